//! OHLC bound predicates over recent source rows.
//!
//! Sampled rows must satisfy `low <= {open, close} <= high`, `high >= low`,
//! and strictly positive prices. Degenerate (zero-range) bars are counted
//! but only graded when every sampled row is degenerate.

use chrono::Duration;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use serde::Serialize;

use crate::{
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

#[derive(Debug, Serialize)]
pub(crate) struct Summary {
    pub(crate) sampled: i64,
    pub(crate) high_below_low: i64,
    pub(crate) open_out_of_range: i64,
    pub(crate) close_out_of_range: i64,
    pub(crate) nonpositive: i64,
    pub(crate) zero_range: i64,
}

#[derive(QueryableByName)]
pub(crate) struct CountsRow {
    #[diesel(sql_type = BigInt)]
    pub(crate) sampled: i64,
    #[diesel(sql_type = BigInt)]
    pub(crate) high_below_low: i64,
    #[diesel(sql_type = BigInt)]
    pub(crate) open_out_of_range: i64,
    #[diesel(sql_type = BigInt)]
    pub(crate) close_out_of_range: i64,
    #[diesel(sql_type = BigInt)]
    pub(crate) nonpositive: i64,
    #[diesel(sql_type = BigInt)]
    pub(crate) zero_range: i64,
}

#[derive(QueryableByName)]
pub(crate) struct OffenderRow {
    #[diesel(sql_type = Text)]
    pub(crate) canonical_symbol: String,
    #[diesel(sql_type = Text)]
    pub(crate) timeframe: String,
    #[diesel(sql_type = Text)]
    pub(crate) ts_utc: String,
}

/// Aggregate OHLC violation counters over a bounded sample of `table`
/// rows with `ts_utc` in `[lo, hi)`.
pub(crate) fn violation_counts(
    conn: &mut SqliteConnection,
    table: &str,
    lo: &str,
    hi: &str,
    limit: i64,
) -> anyhow::Result<CountsRow> {
    let sql = format!(
        "SELECT COUNT(*) AS sampled, \
            COALESCE(SUM(CASE WHEN high < low THEN 1 ELSE 0 END), 0) AS high_below_low, \
            COALESCE(SUM(CASE WHEN open < low OR open > high THEN 1 ELSE 0 END), 0) AS open_out_of_range, \
            COALESCE(SUM(CASE WHEN close < low OR close > high THEN 1 ELSE 0 END), 0) AS close_out_of_range, \
            COALESCE(SUM(CASE WHEN open <= 0 OR high <= 0 OR low <= 0 OR close <= 0 THEN 1 ELSE 0 END), 0) AS nonpositive, \
            COALESCE(SUM(CASE WHEN high = low THEN 1 ELSE 0 END), 0) AS zero_range \
         FROM (SELECT open, high, low, close FROM {table} \
               WHERE ts_utc >= ? AND ts_utc < ? ORDER BY ts_utc DESC LIMIT {limit})"
    );
    Ok(diesel::sql_query(sql)
        .bind::<Text, _>(lo)
        .bind::<Text, _>(hi)
        .get_result(conn)?)
}

/// Sample rows violating any OHLC bound in `[lo, hi)`.
pub(crate) fn violation_samples(
    conn: &mut SqliteConnection,
    table: &str,
    lo: &str,
    hi: &str,
) -> anyhow::Result<Vec<OffenderRow>> {
    let sql = format!(
        "SELECT canonical_symbol, timeframe, ts_utc FROM {table} \
         WHERE ts_utc >= ? AND ts_utc < ? \
           AND (high < low OR open < low OR open > high OR close < low OR close > high \
                OR open <= 0 OR high <= 0 OR low <= 0 OR close <= 0) \
         ORDER BY ts_utc DESC LIMIT {DETAIL_LIMIT}"
    );
    Ok(diesel::sql_query(sql)
        .bind::<Text, _>(lo)
        .bind::<Text, _>(hi)
        .load(conn)?)
}

/// Run the OHLC integrity check over the recent window.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let lo = tz::to_rfc3339_millis(
        ctx.now - Duration::days(ctx.cfg.validation.active_lookback_days),
    );
    let hi = tz::to_rfc3339_millis(ctx.now + Duration::days(1));

    let counts = violation_counts(
        conn,
        "source_bars",
        &lo,
        &hi,
        ctx.cfg.validation.integrity_sample,
    )?;

    let violations = counts.high_below_low
        + counts.open_out_of_range
        + counts.close_out_of_range
        + counts.nonpositive;

    let mut details = Vec::new();
    if violations > 0 {
        for row in violation_samples(conn, "source_bars", &lo, &hi)? {
            details.push(IssueDetail::window(
                &row.canonical_symbol,
                &row.timeframe,
                &row.ts_utc,
                "OHLC bounds violated",
            ));
        }
    }

    let status = if violations > 0 {
        CheckStatus::Critical
    } else if counts.sampled > 0 && counts.zero_range == counts.sampled {
        CheckStatus::Warning
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::OhlcIntegrity,
        status,
        issue_count: violations,
        summary: serde_json::to_value(Summary {
            sampled: counts.sampled,
            high_below_low: counts.high_below_low,
            open_out_of_range: counts.open_out_of_range,
            close_out_of_range: counts.close_out_of_range,
            nonpositive: counts.nonpositive,
            zero_range: counts.zero_range,
        })?,
        details,
    })
}
