//! Polling worker pool.
//!
//! N OS threads each poll the store for due aggregation tasks on a fixed
//! tick, drive catchup to the frontier, and record the outcome through the
//! scheduler's finish step. The main loop runs the validation cadences.
//! Nothing is shared between threads but the store: each thread opens its
//! own connection, and leases make task claims exclusive across threads
//! and processes alike.
//!
//! A confirmation-delayed window never blocks a thread; the task simply
//! comes back on a later tick.

use std::{thread, time::Duration as StdDuration};

use chrono::Utc;
use diesel::SqliteConnection;

use crate::{
    calendar,
    catchup::{self, CatchupParams},
    config::EngineConfig,
    db::connection,
    errors::{EngineError, classify},
    models::AggTask,
    registry,
    tasks::scheduler::{self, FinishOutcome, FinishReport, FinishStats},
    validation::{CheckContext, RunMode, orchestrator},
};

/// Drive one claimed task to its frontier (or its budget) and finish it.
///
/// Store and data failures are classified and recorded on the task row;
/// only invariant violations propagate to the caller.
pub fn drive_task(
    conn: &mut SqliteConnection,
    task: &AggTask,
    cfg: &EngineConfig,
    ignore_confirmation: bool,
) -> Result<FinishOutcome, EngineError> {
    let mut stats = FinishStats::default();
    let mut cursor = None;

    loop {
        let params = CatchupParams {
            cursor,
            max_windows: cfg.engine.max_windows_per_run,
            now: Utc::now(),
            ignore_confirmation,
            derivation_version: cfg.engine.derivation_version,
        };
        match catchup::run_catchup(conn, task, &cfg.quality, &params) {
            Ok(outcome) => {
                stats.bars_created += outcome.created as i64;
                stats.bars_poor_quality += outcome.poor_quality as i64;
                stats.new_cursor = Some(outcome.new_cursor);
                cursor = Some(outcome.new_cursor);

                tracing::debug!(
                    task_id = task.id,
                    symbol = %task.canonical_symbol,
                    timeframe = %task.timeframe,
                    processed = outcome.processed,
                    created = outcome.created,
                    reason = outcome.reason.map(|r| r.as_str()),
                    "catchup invocation finished"
                );

                if !outcome.resume {
                    return scheduler::finish(
                        conn,
                        task.id,
                        Utc::now(),
                        &FinishReport::Success(stats),
                        cfg.engine.hard_fail_threshold,
                    );
                }
            }
            Err(err) => {
                let Some(kind) = classify(&err) else {
                    // Invariant violations must stop the worker, not feed
                    // the retry machinery.
                    return Err(err);
                };
                tracing::warn!(
                    task_id = task.id,
                    symbol = %task.canonical_symbol,
                    kind = kind.as_str(),
                    error = %err,
                    "task failed"
                );
                return scheduler::finish(
                    conn,
                    task.id,
                    Utc::now(),
                    &FinishReport::Failure {
                        kind,
                        error: err.to_string(),
                    },
                    cfg.engine.hard_fail_threshold,
                );
            }
        }
    }
}

/// One aggregation poll: claim due tasks and drive each to completion.
pub fn aggregation_tick(
    conn: &mut SqliteConnection,
    cfg: &EngineConfig,
) -> Result<usize, EngineError> {
    if registry::snapshot().is_empty() {
        tracing::debug!("no active symbols in snapshot; skipping tick");
        return Ok(0);
    }

    let tasks = scheduler::due_tasks(
        conn,
        Utc::now(),
        cfg.engine.task_batch_size,
        chrono::Duration::seconds(cfg.engine.stale_lease_secs),
    )?;
    let claimed = tasks.len();

    for task in &tasks {
        drive_task(conn, task, cfg, false)?;
    }
    Ok(claimed)
}

/// Run the worker pool until the process is stopped.
///
/// Spawns the aggregation threads, then drives the validation cadences on
/// the calling thread.
pub fn run(database_url: &str, cfg: &EngineConfig) -> anyhow::Result<()> {
    {
        let mut conn = connection::connect(database_url)?;
        registry::refresh_active(&mut conn)?;
    }

    for worker_id in 0..cfg.engine.worker_threads {
        let url = database_url.to_string();
        let cfg = cfg.clone();
        thread::Builder::new()
            .name(format!("agg-worker-{worker_id}"))
            .spawn(move || aggregation_loop(worker_id, &url, &cfg))?;
    }

    validation_loop(database_url, cfg)
}

fn aggregation_loop(worker_id: usize, database_url: &str, cfg: &EngineConfig) {
    let tick = StdDuration::from_secs(cfg.engine.tick_secs);
    let mut conn = match connection::connect(database_url) {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(worker_id, error = %err, "worker failed to connect");
            return;
        }
    };

    loop {
        match aggregation_tick(&mut conn, cfg) {
            Ok(claimed) if claimed > 0 => {
                tracing::debug!(worker_id, claimed, "aggregation tick");
            }
            Ok(_) => {}
            Err(err @ EngineError::Invariant(_)) => {
                tracing::error!(worker_id, error = %err, "worker stopping on invariant violation");
                return;
            }
            Err(err) => {
                // Transient store trouble; the next tick retries.
                tracing::warn!(worker_id, error = %err, "aggregation tick failed");
            }
        }
        thread::sleep(tick);
    }
}

fn validation_loop(database_url: &str, cfg: &EngineConfig) -> anyhow::Result<()> {
    let mut conn = connection::connect(database_url)?;
    let cal = calendar::from_kind(cfg.calendar.kind);
    let tick = StdDuration::from_secs(1);

    let reduced_every = StdDuration::from_secs(cfg.validation.reduced_interval_secs);
    let full_every = StdDuration::from_secs(cfg.validation.full_interval_secs);
    // A reduced pass runs immediately at startup; the full pass waits one
    // interval.
    let mut last_reduced: Option<std::time::Instant> = None;
    let mut last_full = std::time::Instant::now();

    loop {
        let mode = if last_full.elapsed() >= full_every {
            last_full = std::time::Instant::now();
            Some(RunMode::Full)
        } else if last_reduced.is_none_or(|t| t.elapsed() >= reduced_every) {
            last_reduced = Some(std::time::Instant::now());
            Some(RunMode::Reduced)
        } else {
            None
        };

        if let Some(mode) = mode {
            registry::refresh_active(&mut conn)?;
            let ctx = CheckContext {
                cfg,
                calendar: cal.as_ref(),
                now: Utc::now(),
            };
            match orchestrator::run_health_checks(&mut conn, mode, "scheduled", &ctx) {
                Ok(summary) => {
                    tracing::info!(
                        run_id = %summary.run_id,
                        overall = summary.overall.as_str(),
                        "validation cadence completed"
                    );
                }
                Err(err) => {
                    tracing::warn!(error = %err, "validation cadence failed");
                }
            }
        }

        thread::sleep(tick);
    }
}
