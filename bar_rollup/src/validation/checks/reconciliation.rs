//! Independent re-derivation of sampled derived bars.
//!
//! The functional counterpart of the window function: for a sample of
//! recently written derived bars, recompute OHLC straight from the rows in
//! their windows and compare within tolerance. A mismatch means the rollup
//! and the raw feed disagree about the same interval.

use diesel::prelude::*;
use serde::Serialize;

use crate::{
    timeframe,
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
    window,
};

/// Relative tolerance for price comparison.
const REL_TOL: f64 = 1e-4;
/// Absolute tolerance floor.
const ABS_TOL: f64 = 1e-6;

#[derive(Debug, Serialize)]
struct Summary {
    sampled: usize,
    mismatched: i64,
    unverifiable: i64,
    rel_tolerance: f64,
    abs_tolerance: f64,
}

fn outside_tolerance(derived: f64, actual: f64) -> bool {
    (derived - actual).abs() > actual.abs() * REL_TOL + ABS_TOL
}

/// Run the reconciliation check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    type Probe = (String, String, String, String, f64, f64, f64, f64);
    let sample: Vec<Probe> = {
        use crate::schema::derived_bars::dsl::*;
        derived_bars
            .order(ts_utc.desc())
            .limit(ctx.cfg.validation.reconcile_sample)
            .select((
                canonical_symbol,
                timeframe,
                source_timeframe,
                ts_utc,
                open,
                high,
                low,
                close,
            ))
            .load(conn)?
    };

    let mut mismatched = 0i64;
    let mut unverifiable = 0i64;
    let mut details = Vec::new();

    for (symbol, tf_code, source_code, ts, d_open, d_high, d_low, d_close) in &sample {
        let target = timeframe::db::from_db_string(tf_code)?;
        let source = timeframe::db::from_db_string(source_code)?;
        let start = tz::parse_ts_to_utc(ts)?;
        let rows = window::read_window_rows(conn, symbol, source, start, start + target.duration())?;

        let Some(recomputed) = window::combine(&rows) else {
            // Source rows may legitimately be gone (retention); count but
            // don't grade.
            unverifiable += 1;
            continue;
        };

        let mismatch = outside_tolerance(*d_open, recomputed.open)
            || outside_tolerance(*d_high, recomputed.high)
            || outside_tolerance(*d_low, recomputed.low)
            || outside_tolerance(*d_close, recomputed.close);
        if mismatch {
            mismatched += 1;
            if details.len() < DETAIL_LIMIT {
                details.push(IssueDetail::window(
                    symbol,
                    tf_code,
                    ts,
                    format!(
                        "stored O/H/L/C {d_open}/{d_high}/{d_low}/{d_close} vs recomputed {}/{}/{}/{}",
                        recomputed.open, recomputed.high, recomputed.low, recomputed.close
                    ),
                ));
            }
        }
    }

    let status = if mismatched > 0 {
        CheckStatus::Critical
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::Reconciliation,
        status,
        issue_count: mismatched,
        summary: serde_json::to_value(Summary {
            sampled: sample.len(),
            mismatched,
            unverifiable,
            rel_tolerance: REL_TOL,
            abs_tolerance: ABS_TOL,
        })?,
        details,
    })
}
