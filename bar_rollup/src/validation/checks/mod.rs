//! The nine consistency checks.
//!
//! Each check is independently invocable (manual diagnosis included), reads
//! only bounded windows or samples, and returns the uniform
//! [`CheckOutcome`](crate::validation::CheckOutcome) shape. Decision rules
//! live with each check; the orchestrator only sequences and persists.

pub mod architecture;
pub mod component_coverage;
pub mod coverage_ratio;
pub mod duplicates;
pub mod gap_density;
pub mod historical_integrity;
pub mod ohlc_integrity;
pub mod reconciliation;
pub mod staleness;

use diesel::prelude::*;

use crate::validation::{CheckCategory, CheckContext, CheckOutcome};

/// Run one check by category.
pub fn run_check(
    conn: &mut SqliteConnection,
    category: CheckCategory,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<CheckOutcome> {
    match category {
        CheckCategory::Architecture => architecture::run(conn, ctx),
        CheckCategory::Staleness => staleness::run(conn, ctx),
        CheckCategory::Duplicates => duplicates::run(conn, ctx),
        CheckCategory::ComponentCoverage => component_coverage::run(conn, ctx),
        CheckCategory::Reconciliation => reconciliation::run(conn, ctx),
        CheckCategory::OhlcIntegrity => ohlc_integrity::run(conn, ctx),
        CheckCategory::GapDensity => gap_density::run(conn, ctx),
        CheckCategory::CoverageRatio => coverage_ratio::run(conn, ctx),
        CheckCategory::HistoricalIntegrity => historical_integrity::run(conn, ctx),
    }
}

/// Active symbols, straight from the store (checks never trust the cache).
pub(crate) fn active_symbols(conn: &mut SqliteConnection) -> anyhow::Result<Vec<String>> {
    use crate::schema::asset_registry::dsl::*;
    Ok(asset_registry
        .filter(is_active.eq(true))
        .order(canonical_symbol.asc())
        .select(canonical_symbol)
        .load(conn)?)
}
