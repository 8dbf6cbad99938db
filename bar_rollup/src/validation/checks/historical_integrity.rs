//! OHLC and alignment invariants over older rows.
//!
//! Live checks watch the ingestion edge; this one samples the historical
//! window behind it to catch backfill corruption independently. Two
//! passes: the OHLC bound predicates on old source rows, and window-start
//! alignment of old derived rows (a misaligned label poisons every
//! downstream rung that reads it).

use chrono::Duration;
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    timeframe,
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

use super::ohlc_integrity;

#[derive(Debug, Serialize)]
struct Summary {
    window_start_days_ago: i64,
    window_end_days_ago: i64,
    sampled: i64,
    ohlc_violations: i64,
    derived_sampled: usize,
    misaligned_derived: i64,
}

/// Run the historical-integrity check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let lo_days = ctx.cfg.validation.historical_lookback_days;
    let hi_days = ctx.cfg.validation.active_lookback_days;
    let lo = tz::to_rfc3339_millis(ctx.now - Duration::days(lo_days));
    let hi = tz::to_rfc3339_millis(ctx.now - Duration::days(hi_days));

    let counts = ohlc_integrity::violation_counts(
        conn,
        "source_bars",
        &lo,
        &hi,
        ctx.cfg.validation.integrity_sample,
    )?;
    let ohlc_violations = counts.high_below_low
        + counts.open_out_of_range
        + counts.close_out_of_range
        + counts.nonpositive;

    let mut details = Vec::new();
    if ohlc_violations > 0 {
        for row in ohlc_integrity::violation_samples(conn, "source_bars", &lo, &hi)? {
            details.push(IssueDetail::window(
                &row.canonical_symbol,
                &row.timeframe,
                &row.ts_utc,
                "OHLC bounds violated in historical window",
            ));
        }
    }

    // Alignment pass: every derived window start must sit on its
    // timeframe's boundary.
    type AlignProbe = (String, String, String);
    let derived_sample: Vec<AlignProbe> = {
        use crate::schema::derived_bars::dsl::*;
        derived_bars
            .filter(ts_utc.ge(&lo))
            .filter(ts_utc.lt(&hi))
            .order(ts_utc.desc())
            .limit(ctx.cfg.validation.integrity_sample)
            .select((canonical_symbol, timeframe, ts_utc))
            .load(conn)?
    };
    let mut misaligned = 0i64;
    for (symbol, tf_code, ts) in &derived_sample {
        let tf = timeframe::db::from_db_string(tf_code)?;
        let start = tz::parse_ts_to_utc(ts)?;
        if !tf.is_aligned(start) {
            misaligned += 1;
            if details.len() < DETAIL_LIMIT {
                details.push(IssueDetail::window(
                    symbol,
                    tf_code,
                    ts,
                    "window start off the timeframe boundary",
                ));
            }
        }
    }

    let issue_count = ohlc_violations + misaligned;
    let status = if issue_count > 0 {
        CheckStatus::Critical
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::HistoricalIntegrity,
        status,
        issue_count,
        summary: serde_json::to_value(Summary {
            window_start_days_ago: lo_days,
            window_end_days_ago: hi_days,
            sampled: counts.sampled,
            ohlc_violations,
            derived_sampled: derived_sample.len(),
            misaligned_derived: misaligned,
        })?,
        details,
    })
}
