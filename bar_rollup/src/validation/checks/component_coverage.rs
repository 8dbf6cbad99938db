//! Composite-index component presence.
//!
//! For every recent window of the configured composite symbol, each
//! required component must have a source bar in the same window; a
//! composite value computed from partial components is quietly wrong. The
//! tolerance mode maps missing-component counts to a grade.

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use diesel::prelude::*;
use serde::Serialize;

use crate::{
    config::ToleranceMode,
    timeframe::{self, Timeframe},
    tz,
    validation::{CheckCategory, CheckContext, CheckOutcome, CheckStatus, DETAIL_LIMIT, IssueDetail},
};

/// Most composite windows examined per run.
const WINDOW_CAP: i64 = 10_000;

#[derive(Debug, Serialize)]
struct Summary {
    configured: bool,
    windows_checked: usize,
    windows_with_missing: i64,
    worst_missing: usize,
    tolerance: &'static str,
}

fn tolerance_str(mode: ToleranceMode) -> &'static str {
    match mode {
        ToleranceMode::Strict => "strict",
        ToleranceMode::Degraded => "degraded",
        ToleranceMode::Lenient => "lenient",
    }
}

/// Run the component-coverage check.
pub fn run(
    conn: &mut SqliteConnection,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    let Some(composite) = &ctx.cfg.composite else {
        return Ok(CheckOutcome::pass(
            CheckCategory::ComponentCoverage,
            serde_json::to_value(Summary {
                configured: false,
                windows_checked: 0,
                windows_with_missing: 0,
                worst_missing: 0,
                tolerance: "strict",
            })?,
        ));
    };

    let finest = timeframe::db::to_db_string(Timeframe::FINEST);
    let cutoff = tz::to_rfc3339_millis(
        ctx.now - Duration::days(ctx.cfg.validation.active_lookback_days),
    );

    let composite_windows: Vec<String> = {
        use crate::schema::source_bars::dsl::*;
        source_bars
            .filter(canonical_symbol.eq(&composite.symbol))
            .filter(timeframe.eq(finest))
            .filter(ts_utc.ge(&cutoff))
            .order(ts_utc.asc())
            .limit(WINDOW_CAP)
            .select(ts_utc)
            .load(conn)?
    };

    if composite_windows.is_empty() {
        // Nothing flowing is a staleness/architecture finding, not a
        // coverage one.
        return Ok(CheckOutcome::pass(
            CheckCategory::ComponentCoverage,
            serde_json::to_value(Summary {
                configured: true,
                windows_checked: 0,
                windows_with_missing: 0,
                worst_missing: 0,
                tolerance: tolerance_str(composite.tolerance),
            })?,
        ));
    }

    let component_rows: Vec<(String, String)> = {
        use crate::schema::source_bars::dsl::*;
        source_bars
            .filter(canonical_symbol.eq_any(&composite.components))
            .filter(timeframe.eq(finest))
            .filter(ts_utc.ge(composite_windows.first().expect("non-empty")))
            .filter(ts_utc.le(composite_windows.last().expect("non-empty")))
            .select((ts_utc, canonical_symbol))
            .load(conn)?
    };
    let mut present: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (ts, symbol) in &component_rows {
        present.entry(ts.as_str()).or_default().insert(symbol.as_str());
    }

    let required = composite.components.len();
    let mut windows_with_missing = 0i64;
    let mut worst_missing = 0usize;
    let mut status = CheckStatus::Pass;
    let mut details = Vec::new();

    for ts in &composite_windows {
        let have = present.get(ts.as_str()).map(|s| s.len()).unwrap_or(0);
        let missing = required - have;
        if missing == 0 {
            continue;
        }
        windows_with_missing += 1;
        worst_missing = worst_missing.max(missing);

        let grade = match composite.tolerance {
            ToleranceMode::Strict => CheckStatus::Critical,
            ToleranceMode::Degraded if missing <= 1 => CheckStatus::Warning,
            ToleranceMode::Degraded => CheckStatus::Critical,
            ToleranceMode::Lenient => CheckStatus::Warning,
        };
        status = status.worst(grade);

        if details.len() < DETAIL_LIMIT {
            details.push(IssueDetail::window(
                &composite.symbol,
                finest,
                ts,
                format!("{missing} of {required} components missing"),
            ));
        }
    }

    Ok(CheckOutcome {
        category: CheckCategory::ComponentCoverage,
        status,
        issue_count: windows_with_missing,
        summary: serde_json::to_value(Summary {
            configured: true,
            windows_checked: composite_windows.len(),
            windows_with_missing,
            worst_missing,
            tolerance: tolerance_str(composite.tolerance),
        })?,
        details,
    })
}
