//! Due-task selection, lease handling, and completion bookkeeping.
//!
//! Mutual exclusion is the task row itself: a claim flips `idle` to
//! `running` with a conditional update, so exactly one worker holds a task
//! even across processes. A reclaim pass resets leases abandoned by crashed
//! workers. `finish` is the single writer of completion state: cursor,
//! streaks, stats, and the next run time.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;

use crate::{
    errors::{EngineError, FailKind},
    models::{AggTask, TaskStatus},
    schema::agg_tasks::dsl as t,
    timeframe,
    tz,
};

/// Counters carried from a successful catchup into the task row.
#[derive(Debug, Clone, Default)]
pub struct FinishStats {
    /// Cursor after the invocation; `None` leaves the stored cursor alone.
    pub new_cursor: Option<DateTime<Utc>>,
    /// Bars written this invocation.
    pub bars_created: i64,
    /// Bars written below full quality.
    pub bars_poor_quality: i64,
}

/// Terminal report for one scheduled invocation.
#[derive(Debug, Clone)]
pub enum FinishReport {
    /// The invocation completed; record progress.
    Success(FinishStats),
    /// The invocation failed; classification decides streak handling.
    Failure {
        /// Transient failures retry silently; hard failures build a streak.
        kind: FailKind,
        /// Human-readable cause, recorded on the row.
        error: String,
    },
}

/// Post-finish task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinishOutcome {
    /// Status after bookkeeping.
    pub status: TaskStatus,
    /// Hard-failure streak after bookkeeping.
    pub streak: i32,
}

/// Reset `running` tasks whose lease is older than `stale_after`.
///
/// Crash recovery: a worker that died mid-run leaves its task leased
/// forever otherwise. Returns the number of rows reclaimed.
pub fn reclaim_stale(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Result<usize, EngineError> {
    let cutoff = tz::to_rfc3339_millis(now - stale_after);
    let now_s = tz::to_rfc3339_millis(now);

    let reclaimed = diesel::update(
        t::agg_tasks
            .filter(t::status.eq(TaskStatus::Running.as_str()))
            .filter(t::locked_at.is_not_null())
            .filter(t::locked_at.lt(&cutoff)),
    )
    .set((
        t::status.eq(TaskStatus::Idle.as_str()),
        t::locked_at.eq(None::<String>),
        t::last_error.eq(format!("lease reclaimed as stale at {now_s}")),
        t::updated_at.eq(&now_s),
    ))
    .execute(conn)?;

    if reclaimed > 0 {
        tracing::warn!(reclaimed, "reclaimed stale task leases");
    }
    Ok(reclaimed)
}

/// Select and claim up to `limit` due tasks.
///
/// Runs the stale-lease reclaim first, then picks idle, enabled tasks whose
/// `next_run_at` has passed and whose symbol is still actively tracked.
/// Ordering: mandatory first, then finer timeframes, then priority, then
/// oldest `last_successful_at` so no task starves. Each pick is claimed
/// with a conditional update; rows lost to a concurrent claimer are simply
/// skipped.
pub fn due_tasks(
    conn: &mut SqliteConnection,
    now: DateTime<Utc>,
    limit: i64,
    stale_after: Duration,
) -> Result<Vec<AggTask>, EngineError> {
    reclaim_stale(conn, now, stale_after)?;

    let now_s = tz::to_rfc3339_millis(now);

    let active_symbols: Vec<String> = {
        use crate::schema::asset_registry::dsl::*;
        asset_registry
            .filter(is_active.eq(true))
            .select(canonical_symbol)
            .load(conn)?
    };

    let mut candidates: Vec<AggTask> = t::agg_tasks
        .filter(t::status.eq(TaskStatus::Idle.as_str()))
        .filter(t::enabled.eq(true))
        .filter(t::next_run_at.le(&now_s))
        .filter(t::canonical_symbol.eq_any(&active_symbols))
        .load(conn)?;

    candidates.sort_by_key(|task| {
        let tf_secs = timeframe::db::from_db_string(&task.timeframe)
            .map(|tf| tf.secs())
            .unwrap_or(i64::MAX);
        (
            !task.is_mandatory,
            tf_secs,
            task.priority,
            // None sorts first: a task that never succeeded is the hungriest.
            task.last_successful_at.clone(),
        )
    });

    let mut claimed = Vec::new();
    for mut task in candidates {
        if (claimed.len() as i64) >= limit {
            break;
        }
        let got = diesel::update(
            t::agg_tasks
                .filter(t::id.eq(task.id))
                .filter(t::status.eq(TaskStatus::Idle.as_str())),
        )
        .set((
            t::status.eq(TaskStatus::Running.as_str()),
            t::locked_at.eq(&now_s),
            t::updated_at.eq(&now_s),
        ))
        .execute(conn)?;

        if got == 1 {
            task.status = TaskStatus::Running.as_str().to_string();
            task.locked_at = Some(now_s.clone());
            claimed.push(task);
        }
    }

    Ok(claimed)
}

/// Record the outcome of one scheduled invocation.
///
/// Success resets the streak and schedules the next run one `run_interval`
/// out. A transient failure retries on the next schedule with no streak
/// impact. A hard failure increments the streak; at `hard_fail_threshold`
/// a mandatory task escalates to `hard_failed` (it must never silently go
/// dark) while an optional task is disabled.
pub fn finish(
    conn: &mut SqliteConnection,
    task_id: i32,
    now: DateTime<Utc>,
    report: &FinishReport,
    hard_fail_threshold: i32,
) -> Result<FinishOutcome, EngineError> {
    let task: AggTask = t::agg_tasks.find(task_id).first(conn)?;

    let now_s = tz::to_rfc3339_millis(now);
    let next_run = tz::to_rfc3339_millis(now + Duration::seconds(task.run_interval_secs));

    match report {
        FinishReport::Success(stats) => {
            let cursor_s = stats.new_cursor.map(tz::to_rfc3339_millis);
            diesel::update(t::agg_tasks.find(task_id))
                .set((
                    t::status.eq(TaskStatus::Idle.as_str()),
                    t::hard_fail_streak.eq(0),
                    t::cursor.eq(cursor_s.or(task.cursor.clone())),
                    t::last_successful_at.eq(&now_s),
                    t::last_error.eq(None::<String>),
                    t::next_run_at.eq(&next_run),
                    t::locked_at.eq(None::<String>),
                    t::total_runs.eq(t::total_runs + 1),
                    t::total_bars_created.eq(t::total_bars_created + stats.bars_created),
                    t::total_bars_poor_quality
                        .eq(t::total_bars_poor_quality + stats.bars_poor_quality),
                    t::updated_at.eq(&now_s),
                ))
                .execute(conn)?;

            Ok(FinishOutcome {
                status: TaskStatus::Idle,
                streak: 0,
            })
        }
        FinishReport::Failure {
            kind: FailKind::Transient,
            error,
        } => {
            diesel::update(t::agg_tasks.find(task_id))
                .set((
                    t::status.eq(TaskStatus::Idle.as_str()),
                    t::last_error.eq(error.as_str()),
                    t::next_run_at.eq(&next_run),
                    t::locked_at.eq(None::<String>),
                    t::total_runs.eq(t::total_runs + 1),
                    t::updated_at.eq(&now_s),
                ))
                .execute(conn)?;

            Ok(FinishOutcome {
                status: TaskStatus::Idle,
                streak: task.hard_fail_streak,
            })
        }
        FinishReport::Failure {
            kind: FailKind::Hard,
            error,
        } => {
            let streak = task.hard_fail_streak + 1;
            let escalate = streak >= hard_fail_threshold;
            let status = if !escalate {
                TaskStatus::Idle
            } else if task.is_mandatory {
                TaskStatus::HardFailed
            } else {
                TaskStatus::Disabled
            };
            let still_enabled = task.enabled && status != TaskStatus::Disabled;

            diesel::update(t::agg_tasks.find(task_id))
                .set((
                    t::status.eq(status.as_str()),
                    t::enabled.eq(still_enabled),
                    t::hard_fail_streak.eq(streak),
                    t::last_error.eq(error.as_str()),
                    t::next_run_at.eq(&next_run),
                    t::locked_at.eq(None::<String>),
                    t::total_runs.eq(t::total_runs + 1),
                    t::updated_at.eq(&now_s),
                ))
                .execute(conn)?;

            if escalate {
                tracing::error!(
                    task_id,
                    symbol = %task.canonical_symbol,
                    timeframe = %task.timeframe,
                    status = status.as_str(),
                    streak,
                    "task escalated after repeated hard failures"
                );
            }

            Ok(FinishOutcome { status, streak })
        }
    }
}
