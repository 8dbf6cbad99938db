//! Tracked-asset registry: configuration file, store sync, and the
//! read-mostly active-symbol cache.

pub mod assets;
mod cache;
pub mod sync;

pub use cache::{clear_active_cache, is_active_symbol, refresh_active, snapshot};
