//! Asset file: the TOML list of tracked symbols.
//!
//! Normalization trims and uppercases symbols, rejects empties, and rejects
//! duplicates after normalization; the sync step treats this file as the
//! desired state of the registry.

use anyhow::{Context, bail};
use serde::Deserialize;

/// Top-level asset file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetFile {
    /// Tracked symbols, in file order.
    pub assets: Vec<AssetCfg>,
}

/// One tracked symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetCfg {
    /// Canonical symbol (normalized to trimmed uppercase).
    pub symbol: String,
    /// Human-readable name.
    pub name: String,
    /// Whether the symbol is currently tracked.
    #[serde(default = "default_active")]
    pub active: bool,
    /// Whether the symbol is a computed composite index.
    #[serde(default)]
    pub composite: bool,
}

fn default_active() -> bool {
    true
}

/// Normalize an asset file in place.
pub fn normalize_assets(file: &mut AssetFile) -> anyhow::Result<()> {
    let mut seen = Vec::with_capacity(file.assets.len());
    for asset in &mut file.assets {
        asset.symbol = asset.symbol.trim().to_uppercase();
        if asset.symbol.is_empty() {
            bail!("asset symbol cannot be empty after trimming");
        }
        asset.name = asset.name.trim().to_string();
        if asset.name.is_empty() {
            bail!("asset {} has an empty name", asset.symbol);
        }
        if seen.contains(&asset.symbol) {
            bail!("duplicate asset symbol after normalization: {}", asset.symbol);
        }
        seen.push(asset.symbol.clone());
    }
    Ok(())
}

/// Parse and normalize an asset file from a TOML string.
pub fn load_assets_str(toml_str: &str) -> anyhow::Result<AssetFile> {
    let mut file: AssetFile = toml::from_str(toml_str).context("failed to parse asset file")?;
    normalize_assets(&mut file)?;
    Ok(file)
}

/// Read an asset TOML file from disk, parse, and normalize it.
pub fn load_assets_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<AssetFile> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read asset file {}", path.as_ref().display()))?;
    load_assets_str(&text)
}
