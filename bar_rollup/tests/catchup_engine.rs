mod common;

use bar_rollup::{
    catchup::{self, CatchupParams, StopReason},
    errors::EngineError,
    models::DerivedBar,
    tasks::scheduler::{self, FinishReport, FinishStats},
    timeframe::Timeframe,
    tz,
    window::{self, WindowSpec},
};
use chrono::Duration;
use common::{load_task, seed_minutes, seed_registry, seed_task, setup_db, test_config, ts};
use diesel::prelude::*;

fn params(now: chrono::DateTime<chrono::Utc>) -> CatchupParams {
    CatchupParams {
        cursor: None,
        max_windows: 500,
        now,
        ignore_confirmation: false,
        derivation_version: 2,
    }
}

fn derived_for(
    conn: &mut diesel::SqliteConnection,
    symbol: &str,
    tf: Timeframe,
) -> Vec<DerivedBar> {
    use bar_rollup::schema::derived_bars::dsl as db_;
    db_::derived_bars
        .filter(db_::canonical_symbol.eq(symbol))
        .filter(db_::timeframe.eq(bar_rollup::timeframe::db::to_db_string(tf)))
        .order(db_::ts_utc.asc())
        .load(conn)
        .expect("derived rows")
}

#[test]
fn bootstrap_walks_gap_and_stores_full_quality_window() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 0, 0),
        true,
    );

    // Five full minutes covering 10:00-10:04.
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let out = catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(ts(2024, 1, 1, 10, 15)))
        .expect("catchup");

    // 120 empty gap windows from 00:00, one stored window, then frontier.
    assert_eq!(out.new_cursor, ts(2024, 1, 1, 10, 5));
    assert_eq!(out.processed, 121);
    assert_eq!(out.created, 1);
    assert_eq!(out.skipped, 120);
    assert_eq!(out.poor_quality, 0);
    assert!(!out.resume);
    assert_eq!(out.reason, Some(StopReason::SourceFrontier));

    let bars = derived_for(&mut conn, "EURUSD", Timeframe::M5);
    assert_eq!(bars.len(), 1);
    let bar = &bars[0];
    assert_eq!(bar.ts_utc, tz::to_rfc3339_millis(ts(2024, 1, 1, 10, 0)));
    assert_eq!(bar.quality_score, 2);
    assert_eq!(bar.source_row_count, 5);
    // First open, last close, extrema, sums (see common::minute_bar).
    assert!((bar.open - 1.10).abs() < 1e-12);
    assert!((bar.close - (1.104 + 0.001)).abs() < 1e-12);
    assert!((bar.high - (1.104 + 0.002)).abs() < 1e-12);
    assert!((bar.low - (1.10 - 0.003)).abs() < 1e-12);
    assert!((bar.volume - (100.0 + 101.0 + 102.0 + 103.0 + 104.0)).abs() < 1e-9);
    assert_eq!(bar.trade_count, 10 + 11 + 12 + 13 + 14);
}

#[test]
fn rerun_with_no_new_data_is_a_noop() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    let task_id = seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let now = ts(2024, 1, 1, 10, 10);
    let out = catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(now)).expect("catchup");
    assert_eq!(out.new_cursor, ts(2024, 1, 1, 10, 5));

    // Persist the cursor the way the worker does.
    scheduler::finish(
        &mut conn,
        task_id,
        now,
        &FinishReport::Success(FinishStats {
            new_cursor: Some(out.new_cursor),
            bars_created: out.created as i64,
            bars_poor_quality: out.poor_quality as i64,
        }),
        3,
    )
    .expect("finish");

    // Immediate re-invoke: idempotent restart from the persisted cursor.
    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    assert_eq!(
        task.cursor.as_deref(),
        Some(tz::to_rfc3339_millis(ts(2024, 1, 1, 10, 5)).as_str())
    );
    let again =
        catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(now)).expect("catchup");
    assert_eq!(again.processed, 0);
    assert_eq!(again.reason, Some(StopReason::CursorBeyondSourceData));
    assert_eq!(again.new_cursor, ts(2024, 1, 1, 10, 5));
}

#[test]
fn three_row_window_grades_zero_and_advances_without_storing() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "USDJPY", true, false);
    seed_task(
        &mut conn,
        "USDJPY",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        false,
    );
    // Only 3 of the 5 minutes.
    seed_minutes(&mut conn, "USDJPY", ts(2024, 1, 1, 10, 0), 3);

    let task = load_task(&mut conn, "USDJPY", Timeframe::M5);
    let out = catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(ts(2024, 1, 1, 10, 10)))
        .expect("catchup");

    // Skip, not stall: the cursor moves past the evaluated window.
    assert_eq!(out.new_cursor, ts(2024, 1, 1, 10, 5));
    assert_eq!(out.processed, 1);
    assert_eq!(out.created, 0);
    assert_eq!(out.skipped, 1);
    assert_eq!(out.poor_quality, 1);
    assert!(derived_for(&mut conn, "USDJPY", Timeframe::M5).is_empty());
}

#[test]
fn zero_row_frontier_window_does_not_advance() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let now = ts(2024, 1, 1, 10, 10);
    let first =
        catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(now)).expect("catchup");
    assert_eq!(first.new_cursor, ts(2024, 1, 1, 10, 5));

    // New data arrives for the next window; restart resumes exactly there.
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 5), 5);
    let mut p = params(ts(2024, 1, 1, 10, 20));
    p.cursor = Some(first.new_cursor);
    let second = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).expect("catchup");
    assert_eq!(second.processed, 1);
    assert_eq!(second.created, 1);
    assert_eq!(second.new_cursor, ts(2024, 1, 1, 10, 10));
}

#[test]
fn unconfirmed_window_is_deferred() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    // Window closes 10:05; confirmation delay 90s; 10:06 is too early.
    let out = catchup::run_catchup(&mut conn, &task, &cfg.quality, &params(ts(2024, 1, 1, 10, 6)))
        .expect("catchup");
    assert_eq!(out.processed, 0);
    assert_eq!(out.reason, Some(StopReason::AwaitingConfirmation));
    assert_eq!(out.new_cursor, ts(2024, 1, 1, 10, 0));

    // Manual override processes it anyway.
    let mut p = params(ts(2024, 1, 1, 10, 6));
    p.ignore_confirmation = true;
    let forced = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).expect("catchup");
    assert_eq!(forced.created, 1);
    assert_eq!(forced.new_cursor, ts(2024, 1, 1, 10, 5));
}

#[test]
fn rerunning_a_stored_window_is_byte_identical() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    let spec = WindowSpec {
        symbol: "EURUSD",
        target: Timeframe::M5,
        source: Timeframe::M1,
        start: ts(2024, 1, 1, 10, 0),
        derivation_version: 2,
    };
    let first = window::aggregate_window(&mut conn, &spec, &cfg.quality).expect("first run");
    assert!(first.stored);
    let rows_before = derived_for(&mut conn, "EURUSD", Timeframe::M5);

    let second = window::aggregate_window(&mut conn, &spec, &cfg.quality).expect("second run");
    assert_eq!(first, second);
    let rows_after = derived_for(&mut conn, "EURUSD", Timeframe::M5);
    assert_eq!(rows_before.len(), 1);
    assert_eq!(rows_after.len(), 1);
    let (a, b) = (&rows_before[0], &rows_after[0]);
    assert_eq!(a.ts_utc, b.ts_utc);
    assert_eq!(a.open, b.open);
    assert_eq!(a.high, b.high);
    assert_eq!(a.low, b.low);
    assert_eq!(a.close, b.close);
    assert_eq!(a.volume, b.volume);
    assert_eq!(a.trade_count, b.trade_count);
    assert_eq!(a.quality_score, b.quality_score);
    assert_eq!(a.source_row_count, b.source_row_count);
}

#[test]
fn window_budget_sets_resume_and_continues_cleanly() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    // Three full 5m windows: 10:00, 10:05, 10:10.
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 15);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let mut p = params(ts(2024, 1, 1, 10, 30));
    p.max_windows = 2;

    let first = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).expect("catchup");
    assert_eq!(first.processed, 2);
    assert!(first.resume);
    assert_eq!(first.reason, None);
    assert_eq!(first.new_cursor, ts(2024, 1, 1, 10, 10));

    p.cursor = Some(first.new_cursor);
    let second = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).expect("catchup");
    assert_eq!(second.processed, 1);
    assert!(!second.resume);
    assert_eq!(second.new_cursor, ts(2024, 1, 1, 10, 15));
    assert_eq!(derived_for(&mut conn, "EURUSD", Timeframe::M5).len(), 3);
}

#[test]
fn higher_rung_reads_lower_derived_rows() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::H1,
        Timeframe::M5,
        ts(2024, 1, 1, 10, 0),
        false,
    );
    // One full hour of minutes.
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 60);

    let five = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let out = catchup::run_catchup(&mut conn, &five, &cfg.quality, &params(ts(2024, 1, 1, 11, 30)))
        .expect("5m catchup");
    assert_eq!(out.created, 12);

    let hour = load_task(&mut conn, "EURUSD", Timeframe::H1);
    let out = catchup::run_catchup(&mut conn, &hour, &cfg.quality, &params(ts(2024, 1, 1, 11, 30)))
        .expect("1h catchup");
    assert_eq!(out.created, 1);

    let bars = derived_for(&mut conn, "EURUSD", Timeframe::H1);
    assert_eq!(bars.len(), 1);
    assert_eq!(bars[0].source_timeframe, "5m");
    assert_eq!(bars[0].source_row_count, 12);
    assert_eq!(bars[0].quality_score, 2);
    // End-to-end OHLC agreement with the raw minutes.
    assert!((bars[0].open - 1.10).abs() < 1e-12);
    assert!((bars[0].close - (1.10 + 59.0 * 0.001 + 0.001)).abs() < 1e-12);
}

#[test]
fn cursor_never_regresses_across_invocations() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 23);

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let mut cursor = None;
    let mut last = ts(2024, 1, 1, 10, 0);
    for step in 0..6 {
        let mut p = params(ts(2024, 1, 1, 10, 0) + Duration::minutes(5 * step + 30));
        p.cursor = cursor;
        p.max_windows = 1;
        let out = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).expect("catchup");
        assert!(out.new_cursor >= last, "cursor regressed at step {step}");
        last = out.new_cursor;
        cursor = Some(out.new_cursor);
    }
}

#[test]
fn cursor_override_behind_persisted_cursor_is_fatal() {
    let (_db, mut conn) = setup_db();
    let cfg = test_config();
    seed_registry(&mut conn, "EURUSD", true, false);
    let task_id = seed_task(
        &mut conn,
        "EURUSD",
        Timeframe::M5,
        Timeframe::M1,
        ts(2024, 1, 1, 10, 0),
        true,
    );
    seed_minutes(&mut conn, "EURUSD", ts(2024, 1, 1, 10, 0), 5);

    scheduler::finish(
        &mut conn,
        task_id,
        ts(2024, 1, 1, 10, 10),
        &FinishReport::Success(FinishStats {
            new_cursor: Some(ts(2024, 1, 1, 10, 5)),
            bars_created: 1,
            bars_poor_quality: 0,
        }),
        3,
    )
    .expect("finish");

    let task = load_task(&mut conn, "EURUSD", Timeframe::M5);
    let mut p = params(ts(2024, 1, 1, 10, 20));
    p.cursor = Some(ts(2024, 1, 1, 10, 0));
    let err = catchup::run_catchup(&mut conn, &task, &cfg.quality, &p).unwrap_err();
    assert!(matches!(err, EngineError::Invariant(_)));
}
