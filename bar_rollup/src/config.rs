//! Engine configuration: parsing, validation, and defaults.
//!
//! One TOML file configures the whole engine: the aggregation ladder, the
//! quality policy, validation thresholds, the composite index, the trading
//! calendar, and worker cadences. The set of tracked symbols lives in a
//! separate asset file (see [`crate::registry::assets`]); splitting the two
//! keeps "what to roll up" deployable without touching engine tuning.
//!
//! Entrypoints:
//! - Parse + validate from a TOML string: [`load_config_str`]
//! - Parse + validate from a file path: [`load_config_path`]

use anyhow::{Context, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::{timeframe::Timeframe, tz};

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Core engine tuning.
    pub engine: EngineSection,
    /// Quality scoring thresholds.
    #[serde(default)]
    pub quality: QualityPolicy,
    /// Aggregation ladder, one rung per derived timeframe.
    pub ladder: Vec<LadderRung>,
    /// Staleness thresholds.
    #[serde(default)]
    pub staleness: StalenessSection,
    /// Coverage-ratio thresholds.
    #[serde(default)]
    pub coverage: CoverageSection,
    /// Optional composite index definition.
    pub composite: Option<CompositeSection>,
    /// Trading calendar selection.
    #[serde(default)]
    pub calendar: CalendarSection,
    /// Validation cadences and bounds.
    #[serde(default)]
    pub validation: ValidationSection,
}

/// Core engine tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    /// Fixed wall-clock start shared by every task, RFC-3339 UTC.
    ///
    /// Deliberately not derived from data availability so that tasks
    /// created at different times converge on identical coverage.
    pub agg_start: String,
    /// Version tag written into every derived bar.
    #[serde(default = "default_derivation_version")]
    pub derivation_version: i32,
    /// Consecutive hard failures before a task escalates.
    #[serde(default = "default_hard_fail_threshold")]
    pub hard_fail_threshold: i32,
    /// Windows evaluated per catchup invocation.
    #[serde(default = "default_max_windows")]
    pub max_windows_per_run: u32,
    /// Seconds after which a `running` lease is considered abandoned.
    #[serde(default = "default_stale_lease_secs")]
    pub stale_lease_secs: i64,
    /// Aggregation worker threads.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Worker poll interval, seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Tasks claimed per poll.
    #[serde(default = "default_batch_size")]
    pub task_batch_size: i64,
}

/// Quality scoring thresholds, expressed as found/expected row ratios.
///
/// For the default 5-row window this grades 5 rows -> 2, 4 -> 1, 3 -> 0,
/// fewer -> ungraded. Scores 1 and 2 store a bar; score 0 marks a window
/// evaluated but too incomplete to store.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QualityPolicy {
    /// Ratio at or above which a bar is graded full quality (2).
    #[serde(default = "default_full_ratio")]
    pub full_ratio: f64,
    /// Ratio at or above which a bar is graded partial quality (1).
    #[serde(default = "default_partial_ratio")]
    pub partial_ratio: f64,
    /// Ratio at or above which a window is still graded (score 0) even
    /// though no bar is stored. Below this the window counts as having
    /// insufficient rows.
    #[serde(default = "default_min_ratio")]
    pub min_ratio: f64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        QualityPolicy {
            full_ratio: default_full_ratio(),
            partial_ratio: default_partial_ratio(),
            min_ratio: default_min_ratio(),
        }
    }
}

impl QualityPolicy {
    /// Grade a window. `Some(2)`/`Some(1)` store a bar, `Some(0)` is
    /// evaluated-but-not-stored, `None` is ungraded (insufficient rows).
    pub fn score(&self, found: i64, expected: i64) -> Option<i32> {
        if expected <= 0 {
            return None;
        }
        let ratio = found as f64 / expected as f64;
        if ratio >= self.full_ratio {
            Some(2)
        } else if ratio >= self.partial_ratio {
            Some(1)
        } else if ratio >= self.min_ratio {
            Some(0)
        } else {
            None
        }
    }
}

/// One rung of the aggregation ladder.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LadderRung {
    /// Target timeframe code (e.g. "5m").
    pub timeframe: String,
    /// Source timeframe code (e.g. "1m").
    pub source: String,
    /// Settle time after window close before the window is trusted.
    #[serde(default = "default_confirmation_delay")]
    pub confirmation_delay_secs: i64,
    /// Scheduling priority (lower runs first within a timeframe).
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Whether tasks on this rung escalate instead of auto-disabling.
    #[serde(default)]
    pub mandatory: bool,
}

impl LadderRung {
    /// Target timeframe, typed.
    pub fn target(&self) -> anyhow::Result<Timeframe> {
        Ok(self.timeframe.parse()?)
    }

    /// Source timeframe, typed.
    pub fn source_tf(&self) -> anyhow::Result<Timeframe> {
        Ok(self.source.parse()?)
    }
}

/// Staleness thresholds in minutes (defaults 5 / 15).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StalenessSection {
    /// Minutes after which a symbol is flagged as a warning.
    #[serde(default = "default_staleness_warning")]
    pub warning_minutes: i64,
    /// Minutes after which a symbol is flagged as critical.
    #[serde(default = "default_staleness_critical")]
    pub critical_minutes: i64,
}

impl Default for StalenessSection {
    fn default() -> Self {
        StalenessSection {
            warning_minutes: default_staleness_warning(),
            critical_minutes: default_staleness_critical(),
        }
    }
}

/// Coverage-ratio thresholds over the calendar's active minutes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoverageSection {
    /// Lookback window, days.
    #[serde(default = "default_coverage_lookback")]
    pub lookback_days: i64,
    /// Actual/expected ratio below which a symbol is a warning.
    #[serde(default = "default_coverage_warning")]
    pub warning_ratio: f64,
    /// Actual/expected ratio below which a symbol is critical.
    #[serde(default = "default_coverage_critical")]
    pub critical_ratio: f64,
}

impl Default for CoverageSection {
    fn default() -> Self {
        CoverageSection {
            lookback_days: default_coverage_lookback(),
            warning_ratio: default_coverage_warning(),
            critical_ratio: default_coverage_critical(),
        }
    }
}

/// How strictly missing composite components are graded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToleranceMode {
    /// Every component must be present.
    Strict,
    /// One missing component is a warning, more is critical.
    Degraded,
    /// Missing components are warnings only.
    Lenient,
}

/// A computed composite index and its required components.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeSection {
    /// Composite symbol (e.g. "DXY").
    pub symbol: String,
    /// Component symbols that must share each composite window.
    pub components: Vec<String>,
    /// Grading mode for missing components.
    #[serde(default = "default_tolerance")]
    pub tolerance: ToleranceMode,
}

/// Which trading calendar the validation suite consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// Weekly FX session: closed Friday 22:00 UTC through Sunday 22:00 UTC.
    #[default]
    FxWeek,
    /// No closures (24/7 feeds, tests).
    AlwaysOpen,
}

/// Trading calendar selection.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct CalendarSection {
    /// Calendar implementation to inject.
    #[serde(default)]
    pub kind: CalendarKind,
}

/// Validation cadences and per-check bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationSection {
    /// Seconds between reduced-mode runs in the worker loop.
    #[serde(default = "default_reduced_interval")]
    pub reduced_interval_secs: u64,
    /// Seconds between full-mode runs in the worker loop.
    #[serde(default = "default_full_interval")]
    pub full_interval_secs: u64,
    /// Wall-clock budget per check, seconds; overruns surface as errors.
    #[serde(default = "default_check_budget")]
    pub check_budget_secs: u64,
    /// Recent-data lookback for live checks, days.
    #[serde(default = "default_active_lookback")]
    pub active_lookback_days: i64,
    /// Derived bars sampled by the reconciliation check.
    #[serde(default = "default_reconcile_sample")]
    pub reconcile_sample: i64,
    /// Rows sampled by integrity checks.
    #[serde(default = "default_integrity_sample")]
    pub integrity_sample: i64,
    /// Historical lookback, days.
    #[serde(default = "default_historical_lookback")]
    pub historical_lookback_days: i64,
    /// Architecture recency window, in multiples of each rung's timeframe.
    #[serde(default = "default_recency_windows")]
    pub recency_windows: i64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        ValidationSection {
            reduced_interval_secs: default_reduced_interval(),
            full_interval_secs: default_full_interval(),
            check_budget_secs: default_check_budget(),
            active_lookback_days: default_active_lookback(),
            reconcile_sample: default_reconcile_sample(),
            integrity_sample: default_integrity_sample(),
            historical_lookback_days: default_historical_lookback(),
            recency_windows: default_recency_windows(),
        }
    }
}

fn default_derivation_version() -> i32 {
    2
}
fn default_hard_fail_threshold() -> i32 {
    3
}
fn default_max_windows() -> u32 {
    288
}
fn default_stale_lease_secs() -> i64 {
    600
}
fn default_worker_threads() -> usize {
    2
}
fn default_tick_secs() -> u64 {
    30
}
fn default_batch_size() -> i64 {
    16
}
fn default_full_ratio() -> f64 {
    1.0
}
fn default_partial_ratio() -> f64 {
    0.8
}
fn default_min_ratio() -> f64 {
    0.6
}
fn default_confirmation_delay() -> i64 {
    90
}
fn default_priority() -> i32 {
    100
}
fn default_staleness_warning() -> i64 {
    5
}
fn default_staleness_critical() -> i64 {
    15
}
fn default_coverage_lookback() -> i64 {
    7
}
fn default_coverage_warning() -> f64 {
    0.98
}
fn default_coverage_critical() -> f64 {
    0.90
}
fn default_tolerance() -> ToleranceMode {
    ToleranceMode::Strict
}
fn default_reduced_interval() -> u64 {
    300
}
fn default_full_interval() -> u64 {
    3_600
}
fn default_check_budget() -> u64 {
    60
}
fn default_active_lookback() -> i64 {
    7
}
fn default_reconcile_sample() -> i64 {
    200
}
fn default_integrity_sample() -> i64 {
    500
}
fn default_historical_lookback() -> i64 {
    365
}
fn default_recency_windows() -> i64 {
    3
}

impl EngineConfig {
    /// Shared aggregation start, typed.
    pub fn agg_start_utc(&self) -> anyhow::Result<DateTime<Utc>> {
        tz::parse_ts_to_utc(&self.engine.agg_start)
    }

    /// Find the ladder rung producing `tf`, if configured.
    pub fn rung_for(&self, tf: Timeframe) -> Option<&LadderRung> {
        self.ladder
            .iter()
            .find(|r| r.target().map(|t| t == tf).unwrap_or(false))
    }

    /// Validate cross-field consistency.
    ///
    /// Errors on: unparsable timeframes, a rung sourcing from a frame that
    /// is not finer than (or does not divide) its target, duplicate rungs,
    /// a derived rung at the finest timeframe, inverted quality ratios, and
    /// inverted staleness thresholds.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.agg_start_utc().context("engine.agg_start")?;

        let mut seen = Vec::new();
        for rung in &self.ladder {
            let target = rung.target().with_context(|| {
                format!("ladder entry with timeframe {:?}", rung.timeframe)
            })?;
            let source = rung.source_tf().with_context(|| {
                format!("ladder entry with source {:?}", rung.source)
            })?;
            if target == Timeframe::FINEST {
                bail!("ladder must not derive the finest timeframe {target}");
            }
            target.expected_rows_from(source)?;
            if seen.contains(&target) {
                bail!("duplicate ladder rung for {target}");
            }
            seen.push(target);
        }
        if self.ladder.is_empty() {
            bail!("ladder must contain at least one rung");
        }

        let q = &self.quality;
        if !(q.min_ratio <= q.partial_ratio && q.partial_ratio <= q.full_ratio) {
            bail!("quality ratios must be ordered min <= partial <= full");
        }
        if self.staleness.warning_minutes >= self.staleness.critical_minutes {
            bail!("staleness warning threshold must be below critical");
        }
        if let Some(c) = &self.composite {
            if c.components.is_empty() {
                bail!("composite {} has no components", c.symbol);
            }
        }
        Ok(())
    }
}

/// Parse and validate an engine config from a TOML string.
pub fn load_config_str(toml_str: &str) -> anyhow::Result<EngineConfig> {
    let cfg: EngineConfig = toml::from_str(toml_str).context("failed to parse engine config")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read an engine config TOML file from disk, parse, and validate it.
pub fn load_config_path(path: impl AsRef<std::path::Path>) -> anyhow::Result<EngineConfig> {
    let text = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("read config file {}", path.as_ref().display()))?;
    load_config_str(&text)
}
