//! Cursor-driven catchup controller.
//!
//! Drives the window function repeatedly for one task, from the persisted
//! cursor towards the source-data frontier, bounded by a per-invocation
//! window budget. The controller never writes task state itself; it returns
//! the advanced cursor and counters for the scheduler's finish step to
//! persist, and only writes derived bars through the window function.
//!
//! Two stopping rules carry the correctness weight:
//! - a window whose confirmation time has not passed is deferred, never
//!   slept on;
//! - a window with zero source rows at or beyond the frontier stops the
//!   run without advancing the cursor. Advancing past it would silently
//!   skip data that arrives later. Empty windows strictly before the
//!   frontier are scheduled gaps (weekends) and advance normally.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::{
    config::QualityPolicy,
    errors::EngineError,
    models::AggTask,
    timeframe::Timeframe,
    tz,
    window::{self, WindowSpec},
};

/// Inputs for one catchup invocation.
#[derive(Debug, Clone)]
pub struct CatchupParams {
    /// Explicit cursor override; `None` uses the task's persisted cursor,
    /// bootstrapping from `agg_start` when the task has never run.
    pub cursor: Option<DateTime<Utc>>,
    /// Windows evaluated per invocation.
    pub max_windows: u32,
    /// The clock, injected for testability.
    pub now: DateTime<Utc>,
    /// Skip the confirmation-delay gate (manual diagnosis only).
    pub ignore_confirmation: bool,
    /// Version tag written into derived bars.
    pub derivation_version: i32,
}

/// Why a catchup invocation stopped before its window budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The cursor already sits past the window holding the newest source
    /// row; nothing to do.
    CursorBeyondSourceData,
    /// The next window has not settled yet.
    AwaitingConfirmation,
    /// The next window holds zero source rows; the frontier was reached.
    SourceFrontier,
}

impl StopReason {
    /// Stable code for logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::CursorBeyondSourceData => "cursor_beyond_source_data",
            StopReason::AwaitingConfirmation => "awaiting_confirmation",
            StopReason::SourceFrontier => "source_frontier",
        }
    }
}

/// Aggregate counters for one catchup invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupOutcome {
    /// Windows evaluated and advanced past.
    pub processed: u32,
    /// Bars written.
    pub created: u32,
    /// Bars written below full quality.
    pub poor_quality: u32,
    /// Windows advanced past without a stored bar (quality skip).
    pub skipped: u32,
    /// Cursor after this invocation; never behind the starting cursor.
    pub new_cursor: DateTime<Utc>,
    /// True when the loop hit `max_windows`; the caller should re-invoke
    /// promptly.
    pub resume: bool,
    /// Stop cause, when the budget was not the limiter.
    pub reason: Option<StopReason>,
}

/// First cursor for a task: the shared `agg_start` floored to the target
/// timeframe's boundary.
pub fn bootstrap_cursor(agg_start: DateTime<Utc>, target: Timeframe) -> DateTime<Utc> {
    target.floor(agg_start)
}

/// Newest source-rung timestamp for a symbol, if any rows exist.
pub fn source_frontier(
    conn: &mut SqliteConnection,
    symbol: &str,
    source: Timeframe,
) -> Result<Option<DateTime<Utc>>, EngineError> {
    let code = crate::timeframe::db::to_db_string(source);

    let max_ts: Option<String> = if source == Timeframe::FINEST {
        use crate::schema::source_bars::dsl::*;
        source_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(code))
            .select(diesel::dsl::max(ts_utc))
            .first(conn)?
    } else {
        use crate::schema::derived_bars::dsl::*;
        derived_bars
            .filter(canonical_symbol.eq(symbol))
            .filter(timeframe.eq(code))
            .select(diesel::dsl::max(ts_utc))
            .first(conn)?
    };

    match max_ts {
        None => Ok(None),
        Some(raw) => tz::parse_ts_to_utc(&raw)
            .map(Some)
            .map_err(|e| EngineError::Invariant(format!("unparsable frontier timestamp: {e}"))),
    }
}

/// Run one bounded catchup invocation for `task`.
///
/// Errors are store or invariant failures; a frontier or an unconfirmed
/// window is a normal stop, not an error.
pub fn run_catchup(
    conn: &mut SqliteConnection,
    task: &AggTask,
    policy: &QualityPolicy,
    params: &CatchupParams,
) -> Result<CatchupOutcome, EngineError> {
    let target = task.target()?;
    let source = task.source()?;

    let persisted = task.cursor_utc()?;
    let start_cursor = match params.cursor.or(persisted) {
        Some(c) => c,
        None => bootstrap_cursor(task.agg_start_utc()?, target),
    };
    if let Some(p) = persisted {
        if start_cursor < p {
            return Err(EngineError::Invariant(format!(
                "task {}: cursor override {} behind persisted cursor {}",
                task.id,
                tz::to_rfc3339_millis(start_cursor),
                tz::to_rfc3339_millis(p)
            )));
        }
    }

    let stopped = |cursor, processed, created, poor, skipped, reason| CatchupOutcome {
        processed,
        created,
        poor_quality: poor,
        skipped,
        new_cursor: cursor,
        resume: false,
        reason: Some(reason),
    };

    // Frontier pre-check: a cursor past the window holding the newest
    // source row means there is nothing to evaluate yet. A no-op, not an
    // error.
    let frontier_window = match source_frontier(conn, &task.canonical_symbol, source)? {
        Some(max_ts) => target.floor(max_ts),
        None => {
            return Ok(stopped(
                start_cursor,
                0,
                0,
                0,
                0,
                StopReason::CursorBeyondSourceData,
            ));
        }
    };
    if start_cursor > frontier_window {
        return Ok(stopped(
            start_cursor,
            0,
            0,
            0,
            0,
            StopReason::CursorBeyondSourceData,
        ));
    }

    let confirmation = task.confirmation_delay();
    let mut cursor = start_cursor;
    let mut processed = 0u32;
    let mut created = 0u32;
    let mut poor_quality = 0u32;
    let mut skipped = 0u32;
    let mut reason = None;

    while processed < params.max_windows {
        let window_end = cursor + target.duration();
        let confirm_at = window_end + confirmation;
        if !params.ignore_confirmation && params.now < confirm_at {
            reason = Some(StopReason::AwaitingConfirmation);
            break;
        }

        let spec = WindowSpec {
            symbol: &task.canonical_symbol,
            target,
            source,
            start: cursor,
            derivation_version: params.derivation_version,
        };
        let outcome = window::aggregate_window(conn, &spec, policy)?;

        if outcome.source_count == 0 && cursor >= frontier_window {
            // Frontier: the window must be re-evaluated once data arrives.
            // Advancing here would silently skip that data forever.
            reason = Some(StopReason::SourceFrontier);
            break;
        }
        // An empty window strictly before the frontier is a scheduled gap
        // (data is known to exist beyond it) and is advanced past like any
        // other evaluated window.

        // The window was evaluated with settled data; advance whether or
        // not a bar was stored. A quality skip is not a stall.
        cursor = window_end;
        if cursor < start_cursor {
            return Err(EngineError::Invariant(format!(
                "task {}: cursor regressed from {} to {}",
                task.id,
                tz::to_rfc3339_millis(start_cursor),
                tz::to_rfc3339_millis(cursor)
            )));
        }
        processed += 1;

        if outcome.stored {
            created += 1;
        } else {
            skipped += 1;
        }
        if outcome.quality_score.map(|s| s < 2).unwrap_or(false) {
            poor_quality += 1;
        }
    }

    let resume = reason.is_none() && processed == params.max_windows;
    Ok(CatchupOutcome {
        processed,
        created,
        poor_quality,
        skipped,
        new_cursor: cursor,
        resume,
        reason,
    })
}
