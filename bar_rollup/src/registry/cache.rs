//! Lock-free, read-mostly cache of actively tracked symbols.
//!
//! Worker loops consult this snapshot every tick; reloading it is an atomic
//! pointer swap after a registry sync. The store remains authoritative —
//! the scheduler re-filters against `asset_registry` when claiming — so a
//! stale snapshot can only delay work, never run an untracked symbol.

use std::{collections::HashSet, sync::Arc};

use arc_swap::ArcSwap;
use diesel::prelude::*;
use once_cell::sync::Lazy;

use crate::schema::asset_registry::dsl as ar;

type ActiveSet = HashSet<String>;

static ACTIVE: Lazy<ArcSwap<ActiveSet>> = Lazy::new(|| ArcSwap::from_pointee(ActiveSet::new()));

/// True if `symbol` is in the current active snapshot.
///
/// Returns `false` until someone calls [`refresh_active`].
pub fn is_active_symbol(symbol: &str) -> bool {
    ACTIVE.load().contains(symbol)
}

/// Rebuild the active set from the store and atomically swap it in.
///
/// Call after a registry sync or at worker start; readers see either the
/// old or the new snapshot.
pub fn refresh_active(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    let rows: Vec<String> = ar::asset_registry
        .filter(ar::is_active.eq(true))
        .select(ar::canonical_symbol)
        .load(conn)?;

    ACTIVE.store(Arc::new(rows.into_iter().collect()));
    Ok(())
}

/// Clear the cache to an empty set. Useful for tests.
pub fn clear_active_cache() {
    ACTIVE.store(Arc::new(ActiveSet::new()));
}

/// Current snapshot, for callers that need to iterate.
pub fn snapshot() -> Arc<ActiveSet> {
    ACTIVE.load_full()
}
