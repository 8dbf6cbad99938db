mod common;

use bar_rollup::{
    calendar::AlwaysOpen,
    validation::{CheckContext, CheckStatus, RunMode, orchestrator},
};
use chrono::Duration;
use common::{count, seed_minutes, seed_registry, setup_db, test_config, ts};
use diesel::prelude::*;
use diesel::sql_types::Text;

#[derive(QueryableByName)]
struct ResultRow {
    #[diesel(sql_type = Text)]
    check_category: String,
    #[diesel(sql_type = Text)]
    status: String,
}

fn result_rows(conn: &mut SqliteConnection, run_id: &str) -> Vec<ResultRow> {
    diesel::sql_query(
        "SELECT check_category, status FROM validation_results WHERE run_id = ? ORDER BY id",
    )
    .bind::<Text, _>(run_id)
    .load(conn)
    .expect("result rows")
}

#[test]
fn reduced_mode_persists_four_results_architecture_first() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    // Empty registry: every reduced check passes vacuously.
    let ctx = CheckContext {
        cfg: &cfg,
        calendar: &AlwaysOpen,
        now: ts(2024, 1, 3, 12, 0),
    };

    let summary =
        orchestrator::run_health_checks(&mut conn, RunMode::Reduced, "manual", &ctx).unwrap();
    assert_eq!(summary.overall, CheckStatus::Pass);
    assert_eq!(summary.checks.len(), 4);
    assert_eq!(summary.issue_count, 0);

    let rows = result_rows(&mut conn, &summary.run_id);
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0].check_category, "architecture");
    assert!(rows.iter().all(|r| r.status == "pass"));
    assert_eq!(count(&mut conn, "validation_runs"), 1);
    assert_eq!(count(&mut conn, "validation_issues"), 0);
}

#[test]
fn failing_check_never_aborts_the_run() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    let now = ts(2024, 1, 3, 12, 0);
    seed_registry(&mut conn, "EURUSD", true, false);
    // An unparsable timestamp makes every check that reads it blow up
    // internally; the orchestrator must convert, persist, and continue.
    diesel::sql_query(
        "INSERT INTO source_bars \
         (canonical_symbol, timeframe, ts_utc, open, high, low, close, volume, trade_count) \
         VALUES ('EURUSD', '1m', 'not-a-timestamp', 1.1, 1.2, 1.0, 1.15, 1.0, 1)",
    )
    .execute(&mut conn)
    .unwrap();

    let ctx = CheckContext {
        cfg: &cfg,
        calendar: &AlwaysOpen,
        now,
    };
    let summary =
        orchestrator::run_health_checks(&mut conn, RunMode::Full, "manual", &ctx).unwrap();

    // All nine results persisted, exactly one run record.
    let rows = result_rows(&mut conn, &summary.run_id);
    assert_eq!(rows.len(), 9);
    assert_eq!(count(&mut conn, "validation_runs"), 1);
    assert_eq!(summary.checks.len(), 9);

    // The staleness check parsed the bad timestamp and errored; later
    // checks still ran and recorded results.
    let staleness = rows.iter().find(|r| r.check_category == "staleness").unwrap();
    assert_eq!(staleness.status, "error");
    assert!(rows.iter().any(|r| r.check_category == "historical_integrity"));

    // Architecture hard-fails (no rollups), and hard_fail outranks error.
    assert_eq!(summary.overall, CheckStatus::HardFail);
}

#[test]
fn non_passing_checks_raise_issues() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    let now = ts(2024, 1, 3, 12, 0);
    seed_registry(&mut conn, "EURUSD", true, false);
    // Stale source data, no rollups at all.
    seed_minutes(&mut conn, "EURUSD", now - Duration::hours(2), 5);

    let ctx = CheckContext {
        cfg: &cfg,
        calendar: &AlwaysOpen,
        now,
    };
    let summary =
        orchestrator::run_health_checks(&mut conn, RunMode::Reduced, "scheduled", &ctx).unwrap();
    assert_eq!(summary.overall, CheckStatus::HardFail);
    assert!(summary.issue_count > 0);
    assert_eq!(count(&mut conn, "validation_issues"), summary.issue_count);

    #[derive(QueryableByName)]
    struct IssueRow {
        #[diesel(sql_type = Text)]
        severity: String,
        #[diesel(sql_type = Text)]
        check_category: String,
    }
    let issues: Vec<IssueRow> =
        diesel::sql_query("SELECT severity, check_category FROM validation_issues")
            .load(&mut conn)
            .unwrap();
    assert!(
        issues
            .iter()
            .any(|i| i.check_category == "architecture" && i.severity == "hard_fail")
    );
    assert!(
        issues
            .iter()
            .any(|i| i.check_category == "staleness" && i.severity == "critical")
    );
}

#[test]
fn run_record_carries_mode_trigger_and_counts() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    let ctx = CheckContext {
        cfg: &cfg,
        calendar: &AlwaysOpen,
        now: ts(2024, 1, 3, 12, 0),
    };
    let summary =
        orchestrator::run_health_checks(&mut conn, RunMode::Reduced, "manual", &ctx).unwrap();

    #[derive(QueryableByName)]
    struct RunRow {
        #[diesel(sql_type = Text)]
        mode: String,
        #[diesel(sql_type = Text)]
        triggered_by: String,
        #[diesel(sql_type = Text)]
        overall_status: String,
        #[diesel(sql_type = diesel::sql_types::Integer)]
        checks_run: i32,
    }
    let run: RunRow = diesel::sql_query(
        "SELECT mode, triggered_by, overall_status, checks_run \
         FROM validation_runs WHERE run_id = ?",
    )
    .bind::<Text, _>(&summary.run_id)
    .get_result(&mut conn)
    .unwrap();
    assert_eq!(run.mode, "reduced");
    assert_eq!(run.triggered_by, "manual");
    assert_eq!(run.overall_status, summary.overall.as_str());
    assert_eq!(run.checks_run, 4);
}
