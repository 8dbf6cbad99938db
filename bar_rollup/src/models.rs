//! Row types and status enums for the engine store.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;

use crate::{
    errors::EngineError,
    schema::{agg_tasks, asset_registry, derived_bars, source_bars},
    timeframe::{self, Timeframe},
    tz,
};

/// Lifecycle state of an aggregation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting to be scheduled.
    Idle,
    /// Leased by a worker.
    Running,
    /// Mandatory task exceeded its hard-failure streak; operator required.
    HardFailed,
    /// Optional task exceeded its streak, or its symbol is untracked.
    Disabled,
}

impl TaskStatus {
    /// Stored code for the status.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Running => "running",
            TaskStatus::HardFailed => "hard_failed",
            TaskStatus::Disabled => "disabled",
        }
    }

    /// Stored code -> status.
    pub fn from_db_str(s: &str) -> Result<Self, EngineError> {
        match s {
            "idle" => Ok(TaskStatus::Idle),
            "running" => Ok(TaskStatus::Running),
            "hard_failed" => Ok(TaskStatus::HardFailed),
            "disabled" => Ok(TaskStatus::Disabled),
            other => Err(EngineError::Config(format!("unknown task status: {other}"))),
        }
    }
}

/// A source bar as written by the ingestion collaborator.
#[derive(Debug, Clone, Queryable)]
pub struct SourceBar {
    /// Row id.
    pub id: i32,
    /// Canonical symbol (e.g. "EURUSD").
    pub canonical_symbol: String,
    /// Timeframe code; source bars are always the finest timeframe.
    pub timeframe: String,
    /// Window start, RFC-3339 UTC.
    pub ts_utc: String,
    /// Opening price.
    pub open: f64,
    /// Highest price in the window.
    pub high: f64,
    /// Lowest price in the window.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Number of trades.
    pub trade_count: i64,
}

/// Insertable source bar (used by tests and seed tooling; production rows
/// come from the ingestion collaborator).
#[derive(Debug, Insertable)]
#[diesel(table_name = source_bars)]
pub struct NewSourceBar<'a> {
    /// Canonical symbol.
    pub canonical_symbol: &'a str,
    /// Timeframe code.
    pub timeframe: &'a str,
    /// Window start, RFC-3339 UTC.
    pub ts_utc: String,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Traded volume.
    pub volume: f64,
    /// Number of trades.
    pub trade_count: i64,
}

/// A derived bar produced by the window function.
#[derive(Debug, Clone, Queryable)]
pub struct DerivedBar {
    /// Row id.
    pub id: i32,
    /// Canonical symbol.
    pub canonical_symbol: String,
    /// Target timeframe code.
    pub timeframe: String,
    /// Window start, RFC-3339 UTC.
    pub ts_utc: String,
    /// Opening price (first source row by time).
    pub open: f64,
    /// Highest price across source rows.
    pub high: f64,
    /// Lowest price across source rows.
    pub low: f64,
    /// Closing price (last source row by time).
    pub close: f64,
    /// Summed volume.
    pub volume: f64,
    /// Summed trade count.
    pub trade_count: i64,
    /// Completeness grade (0/1/2).
    pub quality_score: i32,
    /// Timeframe the bar was derived from.
    pub source_timeframe: String,
    /// Number of source rows found in the window.
    pub source_row_count: i64,
    /// Version tag of the derivation logic that wrote the row.
    pub derivation_version: i32,
}

/// Insertable/upsertable derived bar.
#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = derived_bars)]
pub struct NewDerivedBar<'a> {
    /// Canonical symbol.
    pub canonical_symbol: &'a str,
    /// Target timeframe code.
    pub timeframe: &'a str,
    /// Window start, RFC-3339 UTC.
    pub ts_utc: String,
    /// Opening price.
    pub open: f64,
    /// Highest price.
    pub high: f64,
    /// Lowest price.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Summed volume.
    pub volume: f64,
    /// Summed trade count.
    pub trade_count: i64,
    /// Completeness grade.
    pub quality_score: i32,
    /// Source timeframe code.
    pub source_timeframe: &'a str,
    /// Source rows found.
    pub source_row_count: i64,
    /// Derivation logic version.
    pub derivation_version: i32,
}

/// A tracked symbol.
#[derive(Debug, Clone, Queryable)]
pub struct RegistryAsset {
    /// Canonical symbol, primary key.
    pub canonical_symbol: String,
    /// Human-readable name.
    pub name: String,
    /// Whether the symbol is currently tracked.
    pub is_active: bool,
    /// Whether the symbol is a computed composite index.
    pub is_composite: bool,
    /// Last sync touch, RFC-3339 UTC.
    pub updated_at: String,
}

/// Upsertable registry row.
#[derive(Debug, Insertable, AsChangeset)]
#[diesel(table_name = asset_registry)]
pub struct NewRegistryAsset<'a> {
    /// Canonical symbol.
    pub canonical_symbol: &'a str,
    /// Human-readable name.
    pub name: &'a str,
    /// Tracked flag.
    pub is_active: bool,
    /// Composite flag.
    pub is_composite: bool,
    /// Sync touch timestamp.
    pub updated_at: String,
}

/// One aggregation task row, raw store shape.
#[derive(Debug, Clone, Queryable)]
pub struct AggTask {
    /// Row id.
    pub id: i32,
    /// Canonical symbol.
    pub canonical_symbol: String,
    /// Target timeframe code.
    pub timeframe: String,
    /// Source rung code.
    pub source_timeframe: String,
    /// Window length and re-poll spacing, seconds.
    pub run_interval_secs: i64,
    /// Settle time after window close before aggregation is trusted.
    pub confirmation_delay_secs: i64,
    /// Deterministic boundary-aligned start shared by all tasks.
    pub agg_start: String,
    /// Start of the next window to evaluate; NULL until bootstrapped.
    pub cursor: Option<String>,
    /// Lifecycle status code.
    pub status: String,
    /// Whether the task participates in scheduling at all.
    pub enabled: bool,
    /// Mandatory tasks escalate instead of auto-disabling.
    pub is_mandatory: bool,
    /// Scheduling priority (lower runs first within a timeframe).
    pub priority: i32,
    /// Consecutive hard failures.
    pub hard_fail_streak: i32,
    /// Last successful finish, RFC-3339 UTC.
    pub last_successful_at: Option<String>,
    /// Last recorded error, if any.
    pub last_error: Option<String>,
    /// Earliest next scheduling time.
    pub next_run_at: String,
    /// Lease timestamp while running.
    pub locked_at: Option<String>,
    /// Lifetime run counter.
    pub total_runs: i64,
    /// Lifetime bars created.
    pub total_bars_created: i64,
    /// Lifetime bars stored below full quality.
    pub total_bars_poor_quality: i64,
    /// Row creation time.
    pub created_at: String,
    /// Last row update time.
    pub updated_at: String,
}

impl AggTask {
    /// Target timeframe, typed.
    pub fn target(&self) -> Result<Timeframe, EngineError> {
        timeframe::db::from_db_string(&self.timeframe)
    }

    /// Source rung, typed.
    pub fn source(&self) -> Result<Timeframe, EngineError> {
        timeframe::db::from_db_string(&self.source_timeframe)
    }

    /// Typed status.
    pub fn task_status(&self) -> Result<TaskStatus, EngineError> {
        TaskStatus::from_db_str(&self.status)
    }

    /// Shared aggregation start, typed.
    pub fn agg_start_utc(&self) -> Result<DateTime<Utc>, EngineError> {
        tz::parse_ts_to_utc(&self.agg_start)
            .map_err(|e| EngineError::Config(format!("task {}: {e}", self.id)))
    }

    /// Persisted cursor, typed; `None` before bootstrap.
    pub fn cursor_utc(&self) -> Result<Option<DateTime<Utc>>, EngineError> {
        match &self.cursor {
            None => Ok(None),
            Some(raw) => tz::parse_ts_to_utc(raw)
                .map(Some)
                .map_err(|e| EngineError::Config(format!("task {}: {e}", self.id))),
        }
    }

    /// Confirmation delay, typed.
    pub fn confirmation_delay(&self) -> Duration {
        Duration::seconds(self.confirmation_delay_secs)
    }
}

/// Insertable aggregation task, used by registry sync.
#[derive(Debug, Insertable)]
#[diesel(table_name = agg_tasks)]
pub struct NewAggTask<'a> {
    /// Canonical symbol.
    pub canonical_symbol: &'a str,
    /// Target timeframe code.
    pub timeframe: &'a str,
    /// Source rung code.
    pub source_timeframe: &'a str,
    /// Window length, seconds.
    pub run_interval_secs: i64,
    /// Confirmation delay, seconds.
    pub confirmation_delay_secs: i64,
    /// Shared aggregation start.
    pub agg_start: String,
    /// Lifecycle status code.
    pub status: &'a str,
    /// Scheduling participation flag.
    pub enabled: bool,
    /// Escalation class.
    pub is_mandatory: bool,
    /// Scheduling priority.
    pub priority: i32,
    /// Earliest next scheduling time.
    pub next_run_at: String,
    /// Row creation time.
    pub created_at: String,
    /// Last row update time.
    pub updated_at: String,
}
