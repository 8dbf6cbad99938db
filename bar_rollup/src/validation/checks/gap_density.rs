//! Missing-window runs in the source feed, against the trading calendar.
//!
//! Consecutive source bars more than one step apart form a gap; only the
//! steps the calendar expected to trade count as missing. A long contiguous
//! run of missing active windows escalates to critical.

use chrono::Duration;
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    timeframe::{self, Timeframe},
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

/// Contiguous missing active windows at or above this are critical.
const CRITICAL_RUN: i64 = 60;

#[derive(Debug, Serialize)]
struct Summary {
    symbols_checked: usize,
    gap_events: i64,
    missing_windows: i64,
    max_missing_run: i64,
}

/// Run the gap-density check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let step = Timeframe::FINEST;
    let cutoff = tz::to_rfc3339_millis(
        ctx.now - Duration::days(ctx.cfg.validation.active_lookback_days),
    );
    let symbols = super::active_symbols(conn)?;

    let mut gap_events = 0i64;
    let mut missing_windows = 0i64;
    let mut max_missing_run = 0i64;
    let mut details = Vec::new();

    for symbol in &symbols {
        let stamps: Vec<String> = {
            use crate::schema::source_bars::dsl::*;
            source_bars
                .filter(canonical_symbol.eq(symbol))
                .filter(timeframe.eq(crate::timeframe::db::to_db_string(step)))
                .filter(ts_utc.ge(&cutoff))
                .order(ts_utc.asc())
                .select(ts_utc)
                .load(conn)?
        };

        for pair in stamps.windows(2) {
            let prev = tz::parse_ts_to_utc(&pair[0])?;
            let next = tz::parse_ts_to_utc(&pair[1])?;
            let gap_start = prev + step.duration();
            if next <= gap_start {
                continue;
            }
            let missing = ctx
                .calendar
                .active_steps_between(gap_start, next, step.duration());
            if missing == 0 {
                // The whole gap fell in a scheduled closure.
                continue;
            }
            gap_events += 1;
            missing_windows += missing;
            max_missing_run = max_missing_run.max(missing);
            if details.len() < DETAIL_LIMIT {
                details.push(IssueDetail::window(
                    symbol,
                    timeframe::db::to_db_string(step),
                    &pair[0],
                    format!("{missing} active windows missing before {}", pair[1]),
                ));
            }
        }
    }

    let status = if max_missing_run >= CRITICAL_RUN {
        CheckStatus::Critical
    } else if gap_events > 0 {
        CheckStatus::Warning
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::GapDensity,
        status,
        issue_count: gap_events,
        summary: serde_json::to_value(Summary {
            symbols_checked: symbols.len(),
            gap_events,
            missing_windows,
            max_missing_run,
        })?,
        details,
    })
}
