//! Architecture gates. The only check that can return `hard_fail`.
//!
//! Two structural invariants:
//! 1. The derived store must hold zero rows at the finest timeframe — that
//!    rung belongs exclusively to the source store.
//! 2. Every actively tracked symbol must have a recent derived bar at each
//!    configured rung. A rung counts as recent inside `recency_windows`
//!    window-widths plus the rung's confirmation delay; the gate is
//!    suppressed while the market is closed.

use chrono::Duration;
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    timeframe::{self, Timeframe},
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

#[derive(Debug, Serialize)]
struct Summary {
    finest_rows_in_derived: i64,
    stale_rungs: i64,
    symbols_checked: usize,
    rungs_checked: usize,
    recency_suppressed: bool,
}

/// Run the architecture gates.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    use crate::schema::derived_bars::dsl as db_;

    let finest_code = timeframe::db::to_db_string(Timeframe::FINEST);
    let finest_rows: i64 = db_::derived_bars
        .filter(db_::timeframe.eq(finest_code))
        .count()
        .get_result(conn)?;

    let mut details = Vec::new();
    let mut issue_count = 0i64;
    if finest_rows > 0 {
        issue_count += 1;
        details.push(IssueDetail {
            canonical_symbol: None,
            timeframe: Some(finest_code.to_string()),
            ts_utc: None,
            note: format!("derived store holds {finest_rows} rows at the finest timeframe"),
        });
    }

    let symbols = super::active_symbols(conn)?;
    let recency_suppressed = !ctx.calendar.is_active(ctx.now);
    let mut stale_rungs = 0i64;
    let mut rungs_checked = 0usize;

    if !recency_suppressed {
        for symbol in &symbols {
            for rung in &ctx.cfg.ladder {
                let target = rung.target()?;
                let code = timeframe::db::to_db_string(target);
                rungs_checked += 1;

                let latest: Option<String> = db_::derived_bars
                    .filter(db_::canonical_symbol.eq(symbol))
                    .filter(db_::timeframe.eq(code))
                    .select(diesel::dsl::max(db_::ts_utc))
                    .first(conn)?;

                let horizon = ctx.now
                    - Duration::seconds(
                        ctx.cfg.validation.recency_windows * target.secs()
                            + rung.confirmation_delay_secs,
                    );
                let recent = match &latest {
                    Some(raw) => tz::parse_ts_to_utc(raw)? >= horizon,
                    None => false,
                };
                if !recent {
                    stale_rungs += 1;
                    issue_count += 1;
                    if details.len() < DETAIL_LIMIT {
                        details.push(IssueDetail {
                            canonical_symbol: Some(symbol.clone()),
                            timeframe: Some(code.to_string()),
                            ts_utc: latest.clone(),
                            note: match &latest {
                                Some(raw) => format!("latest derived bar {raw} is beyond the recency window"),
                                None => "no derived bars at this rung".to_string(),
                            },
                        });
                    }
                }
            }
        }
    }

    let status = if issue_count > 0 {
        CheckStatus::HardFail
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::Architecture,
        status,
        issue_count,
        summary: serde_json::to_value(Summary {
            finest_rows_in_derived: finest_rows,
            stale_rungs,
            symbols_checked: symbols.len(),
            rungs_checked,
            recency_suppressed,
        })?,
        details,
    })
}
