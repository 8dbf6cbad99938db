//! Actual vs expected source-row counts over active sessions.
//!
//! Expected counts come from the trading calendar, between the later of the
//! lookback start and the symbol's first bar in the window, and now. The
//! ratio grades against the configured warning/critical floors.

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
    lookback_days: i64,
    symbols_checked: usize,
    symbols_without_data: usize,
    warnings: i64,
    criticals: i64,
    worst_ratio: Option<f64>,
}

/// Run the coverage-ratio check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let step = Timeframe::FINEST;
    let step_code = timeframe::db::to_db_string(step);
    let lookback_days = ctx.cfg.coverage.lookback_days;
    let window_start = ctx.now - Duration::days(lookback_days);
    let window_start_s = tz::to_rfc3339_millis(window_start);
    let now_floor = step.floor(ctx.now);

    let symbols = super::active_symbols(conn)?;

    let mut warnings = 0i64;
    let mut criticals = 0i64;
    let mut without_data = 0usize;
    let mut worst_ratio: Option<f64> = None;
    let mut status = CheckStatus::Pass;
    let mut details = Vec::new();

    for symbol in &symbols {
        use crate::schema::source_bars::dsl::*;

        let first: Option<String> = source_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(step_code))
            .filter(ts_utc.ge(&window_start_s))
            .select(diesel::dsl::min(ts_utc))
            .first(conn)?;
        let Some(first_raw) = first else {
            // Covered by the staleness check; nothing to ratio against.
            without_data += 1;
            continue;
        };

        let effective_start = tz::parse_ts_to_utc(&first_raw)?.max(window_start);
        let expected = ctx
            .calendar
            .active_steps_between(step.floor(effective_start), now_floor, step.duration());
        if expected <= 0 {
            continue;
        }

        let actual: i64 = source_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(step_code))
            .filter(ts_utc.ge(&window_start_s))
            .count()
            .get_result(conn)?;

        let ratio = actual as f64 / expected as f64;
        worst_ratio = Some(worst_ratio.map_or(ratio, |w: f64| w.min(ratio)));

        let grade = if ratio < ctx.cfg.coverage.critical_ratio {
            criticals += 1;
            Some(CheckStatus::Critical)
        } else if ratio < ctx.cfg.coverage.warning_ratio {
            warnings += 1;
            Some(CheckStatus::Warning)
        } else {
            None
        };
        if let Some(grade) = grade {
            status = status.worst(grade);
            if details.len() < DETAIL_LIMIT {
                details.push(IssueDetail::symbol(
                    symbol,
                    format!("{actual} of {expected} expected windows present ({:.2}%)", ratio * 100.0),
                ));
            }
        }
    }

    Ok(CheckOutcome {
        category: CheckCategory::CoverageRatio,
        status,
        issue_count: warnings + criticals,
        summary: serde_json::to_value(Summary {
            lookback_days,
            symbols_checked: symbols.len(),
            symbols_without_data: without_data,
            warnings,
            criticals,
            worst_ratio,
        })?,
        details,
    })
}
