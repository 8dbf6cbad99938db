//! Duplicate (symbol, timeframe, timestamp) keys in either store.
//!
//! The unique indexes make duplicates impossible through this engine's own
//! writers; the check guards the other paths (manual loads, schema drift,
//! restores) because a duplicate key silently corrupts every aggregate
//! built on top of it.

use chrono::Duration;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Text};
use serde::Serialize;

use crate::{
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

#[derive(Debug, Serialize)]
struct Summary {
    lookback_days: i64,
    source_duplicate_keys: i64,
    derived_duplicate_keys: i64,
}

#[derive(QueryableByName)]
struct DupRow {
    #[diesel(sql_type = Text)]
    canonical_symbol: String,
    #[diesel(sql_type = Text)]
    timeframe: String,
    #[diesel(sql_type = Text)]
    ts_utc: String,
    #[diesel(sql_type = BigInt)]
    rows_at_key: i64,
}

fn duplicate_keys(
    conn: &mut SqliteConnection,
    table: &str,
    cutoff: &str,
) -> anyhow::Result<Vec<DupRow>> {
    // Table name is one of two compile-time constants, never user input.
    let sql = format!(
        "SELECT canonical_symbol, timeframe, ts_utc, COUNT(*) AS rows_at_key \
         FROM {table} WHERE ts_utc >= ? \
         GROUP BY canonical_symbol, timeframe, ts_utc \
         HAVING COUNT(*) > 1 \
         ORDER BY rows_at_key DESC, canonical_symbol, timeframe, ts_utc \
         LIMIT 500"
    );
    Ok(diesel::sql_query(sql).bind::<Text, _>(cutoff).load(conn)?)
}

/// Run the duplicates check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let lookback_days = ctx.cfg.validation.active_lookback_days;
    let cutoff = tz::to_rfc3339_millis(ctx.now - Duration::days(lookback_days));

    let source_dups = duplicate_keys(conn, "source_bars", &cutoff)?;
    let derived_dups = duplicate_keys(conn, "derived_bars", &cutoff)?;

    let issue_count = (source_dups.len() + derived_dups.len()) as i64;
    let mut details = Vec::new();
    for row in source_dups.iter().chain(derived_dups.iter()) {
        if details.len() >= DETAIL_LIMIT {
            break;
        }
        details.push(IssueDetail::window(
            &row.canonical_symbol,
            &row.timeframe,
            &row.ts_utc,
            format!("{} rows share this key", row.rows_at_key),
        ));
    }

    let status = if issue_count > 0 {
        CheckStatus::Critical
    } else {
        CheckStatus::Pass
    };

    Ok(CheckOutcome {
        category: CheckCategory::Duplicates,
        status,
        issue_count,
        summary: serde_json::to_value(Summary {
            lookback_days,
            source_duplicate_keys: source_dups.len() as i64,
            derived_duplicate_keys: derived_dups.len() as i64,
        })?,
        details,
    })
}
