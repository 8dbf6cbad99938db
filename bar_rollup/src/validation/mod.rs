//! Continuous consistency auditing.
//!
//! Nine independent checks grade the bar stores; the orchestrator runs a
//! mode-selected subset in a fixed order and persists every result
//! regardless of individual failure. A check never aborts a run: its own
//! failure becomes a `status = error` result.

pub mod checks;
pub mod orchestrator;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{calendar::TradingCalendar, config::EngineConfig, errors::EngineError};

/// Graded result of one check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    /// No findings.
    Pass,
    /// Degraded but serviceable.
    Warning,
    /// Defects requiring attention.
    Critical,
    /// An architectural invariant is broken; blocks downstream automation.
    HardFail,
    /// The check itself failed to complete.
    Error,
}

impl CheckStatus {
    /// Severity rank for folding an overall status
    /// (hard_fail > error > critical > warning > pass).
    pub fn rank(self) -> u8 {
        match self {
            CheckStatus::Pass => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Critical => 2,
            CheckStatus::Error => 3,
            CheckStatus::HardFail => 4,
        }
    }

    /// Stored code for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warning => "warning",
            CheckStatus::Critical => "critical",
            CheckStatus::HardFail => "hard_fail",
            CheckStatus::Error => "error",
        }
    }

    /// The worse of two statuses.
    pub fn worst(self, other: CheckStatus) -> CheckStatus {
        if other.rank() > self.rank() { other } else { self }
    }
}

/// Check identity, also the persisted category code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckCategory {
    /// Derived-store structural gates; the only hard-fail check.
    Architecture,
    /// Freshness of the source feed per symbol.
    Staleness,
    /// Duplicate (symbol, timeframe, timestamp) keys.
    Duplicates,
    /// Composite-index component presence.
    ComponentCoverage,
    /// Independent re-derivation of sampled derived bars.
    Reconciliation,
    /// OHLC bound and sanity predicates on recent rows.
    OhlcIntegrity,
    /// Missing-window runs against the trading calendar.
    GapDensity,
    /// Actual vs expected row counts over active sessions.
    CoverageRatio,
    /// OHLC and alignment invariants over older rows.
    HistoricalIntegrity,
}

impl CheckCategory {
    /// Stored code for the category.
    pub fn as_str(self) -> &'static str {
        match self {
            CheckCategory::Architecture => "architecture",
            CheckCategory::Staleness => "staleness",
            CheckCategory::Duplicates => "duplicates",
            CheckCategory::ComponentCoverage => "component_coverage",
            CheckCategory::Reconciliation => "reconciliation",
            CheckCategory::OhlcIntegrity => "ohlc_integrity",
            CheckCategory::GapDensity => "gap_density",
            CheckCategory::CoverageRatio => "coverage_ratio",
            CheckCategory::HistoricalIntegrity => "historical_integrity",
        }
    }
}

/// Which check subset a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Fast subset for the frequent cadence.
    Reduced,
    /// All nine checks.
    Full,
}

impl RunMode {
    /// Stored code for the mode.
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Reduced => "reduced",
            RunMode::Full => "full",
        }
    }

    /// Parse a stored/CLI code.
    pub fn from_db_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "reduced" => Ok(RunMode::Reduced),
            "full" => Ok(RunMode::Full),
            other => Err(EngineError::Config(format!("unknown run mode: {other}"))),
        }
    }

    /// The mode's checks, in execution order. The architecture gate always
    /// runs first: its violations must never hide behind earlier noise.
    pub fn categories(self) -> &'static [CheckCategory] {
        match self {
            RunMode::Reduced => &[
                CheckCategory::Architecture,
                CheckCategory::Staleness,
                CheckCategory::Duplicates,
                CheckCategory::ComponentCoverage,
            ],
            RunMode::Full => &[
                CheckCategory::Architecture,
                CheckCategory::Staleness,
                CheckCategory::Duplicates,
                CheckCategory::ComponentCoverage,
                CheckCategory::Reconciliation,
                CheckCategory::OhlcIntegrity,
                CheckCategory::GapDensity,
                CheckCategory::CoverageRatio,
                CheckCategory::HistoricalIntegrity,
            ],
        }
    }
}

/// A bounded, structured sample of one finding, for drill-down.
#[derive(Debug, Clone, Serialize)]
pub struct IssueDetail {
    /// Affected symbol, when the finding is symbol-scoped.
    pub canonical_symbol: Option<String>,
    /// Affected timeframe code, when timeframe-scoped.
    pub timeframe: Option<String>,
    /// Affected window start, when window-scoped.
    pub ts_utc: Option<String>,
    /// Human-readable description.
    pub note: String,
}

impl IssueDetail {
    /// Detail scoped to a symbol only.
    pub fn symbol(symbol: &str, note: impl Into<String>) -> Self {
        IssueDetail {
            canonical_symbol: Some(symbol.to_string()),
            timeframe: None,
            ts_utc: None,
            note: note.into(),
        }
    }

    /// Detail scoped to a (symbol, timeframe, window).
    pub fn window(
        symbol: &str,
        timeframe: &str,
        ts_utc: &str,
        note: impl Into<String>,
    ) -> Self {
        IssueDetail {
            canonical_symbol: Some(symbol.to_string()),
            timeframe: Some(timeframe.to_string()),
            ts_utc: Some(ts_utc.to_string()),
            note: note.into(),
        }
    }
}

/// Most detail samples a single check result retains.
pub const DETAIL_LIMIT: usize = 20;

/// Uniform result shape every check returns.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// Which check produced this.
    pub category: CheckCategory,
    /// Graded status.
    pub status: CheckStatus,
    /// Total findings (details are a bounded sample of these).
    pub issue_count: i64,
    /// Typed summary counters, serialized for persistence.
    pub summary: serde_json::Value,
    /// Bounded finding samples.
    pub details: Vec<IssueDetail>,
}

impl CheckOutcome {
    /// A passing outcome with a summary payload.
    pub fn pass(category: CheckCategory, summary: serde_json::Value) -> Self {
        CheckOutcome {
            category,
            status: CheckStatus::Pass,
            issue_count: 0,
            summary,
            details: Vec::new(),
        }
    }
}

/// Shared inputs for every check.
pub struct CheckContext<'a> {
    /// Engine configuration (thresholds, bounds, composite definition).
    pub cfg: &'a EngineConfig,
    /// Injected market schedule.
    pub calendar: &'a dyn TradingCalendar,
    /// The clock, injected for testability.
    pub now: DateTime<Utc>,
}
