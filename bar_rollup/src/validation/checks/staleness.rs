//! Source-feed freshness per tracked symbol.
//!
//! Minutes since a symbol's newest source bar, graded against the
//! warning/critical thresholds. Suppressed while the market is closed —
//! a quiet weekend is not an incident. A symbol with no source data at all
//! is always critical.

use diesel::prelude::*;
use diesel::sql_types::Text;
use serde::Serialize;

use crate::{
    timeframe::{self, Timeframe},
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

#[derive(Debug, Serialize)]
struct Summary {
    symbols_checked: usize,
    warnings: i64,
    criticals: i64,
    max_staleness_minutes: Option<i64>,
    suppressed: bool,
}

#[derive(QueryableByName)]
struct LatestRow {
    #[diesel(sql_type = Text)]
    canonical_symbol: String,
    #[diesel(sql_type = Text)]
    latest_ts: String,
}

/// Run the staleness check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let symbols = super::active_symbols(conn)?;

    if !ctx.calendar.is_active(ctx.now) {
        return Ok(CheckOutcome::pass(
            CheckCategory::Staleness,
            serde_json::to_value(Summary {
                symbols_checked: symbols.len(),
                warnings: 0,
                criticals: 0,
                max_staleness_minutes: None,
                suppressed: true,
            })?,
        ));
    }

    let latest: Vec<LatestRow> = diesel::sql_query(
        "SELECT canonical_symbol, MAX(ts_utc) AS latest_ts \
         FROM source_bars WHERE timeframe = ? GROUP BY canonical_symbol",
    )
    .bind::<Text, _>(timeframe::db::to_db_string(Timeframe::FINEST))
    .load(conn)?;
    let latest_by_symbol: std::collections::HashMap<_, _> = latest
        .into_iter()
        .map(|row| (row.canonical_symbol, row.latest_ts))
        .collect();

    let thresholds = &ctx.cfg.staleness;
    let mut warnings = 0i64;
    let mut criticals = 0i64;
    let mut max_staleness = None;
    let mut details = Vec::new();
    let mut status = CheckStatus::Pass;

    for symbol in &symbols {
        let grade = match latest_by_symbol.get(symbol) {
            None => {
                criticals += 1;
                Some((CheckStatus::Critical, "no source bars ingested".to_string()))
            }
            Some(raw) => {
                let minutes = tz::minutes_between(tz::parse_ts_to_utc(raw)?, ctx.now);
                max_staleness = Some(max_staleness.unwrap_or(i64::MIN).max(minutes));
                if minutes > thresholds.critical_minutes {
                    criticals += 1;
                    Some((
                        CheckStatus::Critical,
                        format!("latest source bar is {minutes} minutes old"),
                    ))
                } else if minutes > thresholds.warning_minutes {
                    warnings += 1;
                    Some((
                        CheckStatus::Warning,
                        format!("latest source bar is {minutes} minutes old"),
                    ))
                } else {
                    None
                }
            }
        };
        if let Some((grade_status, note)) = grade {
            status = status.worst(grade_status);
            if details.len() < DETAIL_LIMIT {
                details.push(IssueDetail::symbol(symbol, note));
            }
        }
    }

    Ok(CheckOutcome {
        category: CheckCategory::Staleness,
        status,
        issue_count: warnings + criticals,
        summary: serde_json::to_value(Summary {
            symbols_checked: symbols.len(),
            warnings,
            criticals,
            max_staleness_minutes: max_staleness,
            suppressed: false,
        })?,
        details,
    })
}
