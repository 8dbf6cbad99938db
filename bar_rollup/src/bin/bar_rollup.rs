use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use diesel::prelude::*;

use bar_rollup::{
    calendar,
    config::{self, EngineConfig},
    db::{connection, migrate},
    models::{AggTask, TaskStatus},
    registry::{self, assets, sync::SyncOptions},
    tasks::scheduler::FinishOutcome,
    validation::{CheckContext, RunMode, orchestrator},
    worker,
};

#[derive(Parser)]
#[command(version, about = "Bar rollup & consistency engine")]
struct Cli {
    /// Engine config file.
    #[arg(long, value_name = "FILE", default_value = "engine.toml", global = true)]
    config: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Apply pending store migrations.
    Migrate,
    /// Tracked-asset registry operations.
    Assets(AssetsCmd),
    /// Aggregation task operations.
    Tasks(TasksCmd),
    /// Run the worker pool (aggregation + validation cadences).
    Worker,
    /// Force-catchup one task, bypassing the scheduler.
    Catchup {
        #[arg(long)]
        symbol: String,
        #[arg(long)]
        timeframe: String,
        /// Skip the confirmation-delay gate (manual diagnosis only).
        #[arg(long)]
        ignore_confirmation: bool,
    },
    /// Trigger a validation run.
    Validate {
        #[arg(long, default_value = "reduced")]
        mode: String,
    },
    /// Report engine health: last validation run age and task states.
    Health,
}

#[derive(Args)]
struct AssetsCmd {
    #[command(subcommand)]
    sub: AssetsSub,
}

#[derive(Subcommand)]
enum AssetsSub {
    /// Sync the registry and task table from an asset file.
    Sync {
        #[arg(long, value_name = "FILE")]
        file: String,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct TasksCmd {
    #[command(subcommand)]
    sub: TasksSub,
}

#[derive(Subcommand)]
enum TasksSub {
    /// List aggregation tasks and their cursors.
    List,
}

fn database_url() -> Result<String> {
    Ok(shared_utils::env::get_env_var("DATABASE_URL")?)
}

fn load_config(path: &str) -> Result<EngineConfig> {
    config::load_config_path(path)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let db_url = database_url()?;

    match cli.cmd {
        Cmd::Migrate => {
            migrate::run(&db_url)?;
            println!("migrations applied");
        }
        Cmd::Assets(AssetsCmd {
            sub: AssetsSub::Sync { file, dry_run },
        }) => {
            let cfg = load_config(&cli.config)?;
            let assets = assets::load_assets_path(&file)?;
            let mut conn = connection::connect(&db_url)?;
            let report = registry::sync::sync_assets(
                &mut conn,
                &assets,
                &cfg,
                Utc::now(),
                SyncOptions { dry_run },
            )?;
            println!(
                "{}assets upserted: {}, deactivated: {}; tasks created: {}, updated: {}, re-enabled: {}, disabled: {}",
                if dry_run { "[dry-run] " } else { "" },
                report.assets_upserted,
                report.assets_deactivated,
                report.tasks_created,
                report.tasks_updated,
                report.tasks_reenabled,
                report.tasks_disabled,
            );
        }
        Cmd::Tasks(TasksCmd { sub: TasksSub::List }) => {
            let mut conn = connection::connect(&db_url)?;
            use bar_rollup::schema::agg_tasks::dsl as t;
            let tasks: Vec<AggTask> = t::agg_tasks
                .order((t::canonical_symbol.asc(), t::timeframe.asc()))
                .load(&mut conn)?;
            for task in tasks {
                println!(
                    "{:10} {:>4}  status={:<11} enabled={:<5} streak={} cursor={} next_run={}",
                    task.canonical_symbol,
                    task.timeframe,
                    task.status,
                    task.enabled,
                    task.hard_fail_streak,
                    task.cursor.as_deref().unwrap_or("-"),
                    task.next_run_at,
                );
            }
        }
        Cmd::Worker => {
            let cfg = load_config(&cli.config)?;
            worker::run(&db_url, &cfg)?;
        }
        Cmd::Catchup {
            symbol,
            timeframe,
            ignore_confirmation,
        } => {
            let cfg = load_config(&cli.config)?;
            let mut conn = connection::connect(&db_url)?;
            force_catchup(&mut conn, &cfg, &symbol, &timeframe, ignore_confirmation)?;
        }
        Cmd::Validate { mode } => {
            let cfg = load_config(&cli.config)?;
            let mode = RunMode::from_db_str(&mode)?;
            let mut conn = connection::connect(&db_url)?;
            let cal = calendar::from_kind(cfg.calendar.kind);
            let ctx = CheckContext {
                cfg: &cfg,
                calendar: cal.as_ref(),
                now: Utc::now(),
            };
            let summary = orchestrator::run_health_checks(&mut conn, mode, "manual", &ctx)?;
            println!("run {} -> {}", summary.run_id, summary.overall.as_str());
            for check in &summary.checks {
                println!(
                    "  {:22} {:9} issues={} ({}ms)",
                    check.category.as_str(),
                    check.status.as_str(),
                    check.issue_count,
                    check.execution_time_ms,
                );
            }
        }
        Cmd::Health => {
            let mut conn = connection::connect(&db_url)?;
            print_health(&mut conn)?;
        }
    }

    Ok(())
}

fn force_catchup(
    conn: &mut SqliteConnection,
    cfg: &EngineConfig,
    symbol: &str,
    tf_code: &str,
    ignore_confirmation: bool,
) -> Result<()> {
    use bar_rollup::schema::agg_tasks::dsl as t;

    let task: AggTask = t::agg_tasks
        .filter(t::canonical_symbol.eq(symbol))
        .filter(t::timeframe.eq(tf_code))
        .first(conn)
        .with_context(|| format!("no task for {symbol}/{tf_code}"))?;

    // Same lease discipline as the scheduler, so a manual run can never
    // overlap a worker's.
    let now_s = bar_rollup::tz::to_rfc3339_millis(Utc::now());
    let claimed = diesel::update(
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
    if claimed != 1 {
        bail!(
            "task {symbol}/{tf_code} is not idle (status={}); refusing to run",
            task.status
        );
    }

    let outcome: FinishOutcome = worker::drive_task(conn, &task, cfg, ignore_confirmation)?;
    println!(
        "{symbol}/{tf_code}: status={} streak={}",
        outcome.status.as_str(),
        outcome.streak
    );
    let refreshed: AggTask = t::agg_tasks.find(task.id).first(conn)?;
    println!(
        "cursor={} last_error={}",
        refreshed.cursor.as_deref().unwrap_or("-"),
        refreshed.last_error.as_deref().unwrap_or("-"),
    );
    Ok(())
}

fn print_health(conn: &mut SqliteConnection) -> Result<()> {
    use bar_rollup::schema::validation_runs::dsl as vr;

    let last_run: Option<(String, String, String)> = vr::validation_runs
        .order(vr::id.desc())
        .select((vr::run_id, vr::overall_status, vr::finished_at))
        .first(conn)
        .optional()?;
    match last_run {
        Some((run_id, overall, finished_at)) => {
            let age_minutes = bar_rollup::tz::parse_ts_to_utc(&finished_at)
                .map(|ts| bar_rollup::tz::minutes_between(ts, Utc::now()))
                .unwrap_or(-1);
            println!("last validation run: {run_id} ({overall}), {age_minutes} minutes ago");
        }
        None => println!("last validation run: none recorded"),
    }

    use bar_rollup::schema::agg_tasks::dsl as t;
    let tasks: Vec<(String, i64)> = {
        use diesel::sql_types::{BigInt, Text};
        #[derive(QueryableByName)]
        struct StatusCount {
            #[diesel(sql_type = Text)]
            status: String,
            #[diesel(sql_type = BigInt)]
            n: i64,
        }
        diesel::sql_query("SELECT status, COUNT(*) AS n FROM agg_tasks GROUP BY status")
            .load::<StatusCount>(conn)?
            .into_iter()
            .map(|row| (row.status, row.n))
            .collect()
    };
    for (status, n) in &tasks {
        println!("tasks {status}: {n}");
    }

    let hungriest: Option<(String, String, Option<String>)> = t::agg_tasks
        .filter(t::enabled.eq(true))
        .order(t::last_successful_at.asc())
        .select((t::canonical_symbol, t::timeframe, t::last_successful_at))
        .first(conn)
        .optional()?;
    if let Some((symbol, tf, last)) = hungriest {
        println!(
            "oldest successful task: {symbol}/{tf} at {}",
            last.as_deref().unwrap_or("never")
        );
    }
    Ok(())
}
