#![allow(dead_code)]

use bar_rollup::{
    config::{self, EngineConfig},
    db::{connection, migrate},
    models::{AggTask, NewSourceBar},
    timeframe::{self, Timeframe},
    tz,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestDb {
    _dir: TempDir, // keep alive for the life of the test
    pub path: String,
}

pub fn setup_db() -> (TestDb, SqliteConnection) {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    migrate::run(&path).expect("migrations");
    let conn = connection::connect(&path).expect("connect");
    (TestDb { _dir: dir, path }, conn)
}

/// Two-rung ladder (5m from 1m, 1h from 5m), always-open calendar,
/// aggregation start on 2024-01-01T00:00Z.
pub fn test_config() -> EngineConfig {
    config::load_config_str(
        r#"
[engine]
agg_start = "2024-01-01T00:00:00Z"
max_windows_per_run = 500

[[ladder]]
timeframe = "5m"
source = "1m"
confirmation_delay_secs = 90
priority = 10
mandatory = true

[[ladder]]
timeframe = "1h"
source = "5m"
confirmation_delay_secs = 120
priority = 20

[calendar]
kind = "always_open"
"#,
    )
    .expect("test config")
}

pub fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn seed_registry(conn: &mut SqliteConnection, symbol: &str, active: bool, composite: bool) {
    use bar_rollup::schema::asset_registry::dsl as ar;
    diesel::insert_into(ar::asset_registry)
        .values((
            ar::canonical_symbol.eq(symbol),
            ar::name.eq(symbol),
            ar::is_active.eq(active),
            ar::is_composite.eq(composite),
            ar::updated_at.eq(tz::to_rfc3339_millis(ts(2024, 1, 1, 0, 0))),
        ))
        .on_conflict(ar::canonical_symbol)
        .do_update()
        .set(ar::is_active.eq(active))
        .execute(conn)
        .expect("seed registry row");
}

/// Insert a task row directly, bypassing sync, for fine-grained control.
pub fn seed_task(
    conn: &mut SqliteConnection,
    symbol: &str,
    target: Timeframe,
    source: Timeframe,
    agg_start: DateTime<Utc>,
    mandatory: bool,
) -> i32 {
    use bar_rollup::schema::agg_tasks::dsl as t;
    let now_s = tz::to_rfc3339_millis(agg_start);
    diesel::insert_into(t::agg_tasks)
        .values((
            t::canonical_symbol.eq(symbol),
            t::timeframe.eq(timeframe::db::to_db_string(target)),
            t::source_timeframe.eq(timeframe::db::to_db_string(source)),
            t::run_interval_secs.eq(target.secs()),
            t::confirmation_delay_secs.eq(90),
            t::agg_start.eq(tz::to_rfc3339_millis(agg_start)),
            t::status.eq("idle"),
            t::enabled.eq(true),
            t::is_mandatory.eq(mandatory),
            t::priority.eq(100),
            t::next_run_at.eq(&now_s),
            t::created_at.eq(&now_s),
            t::updated_at.eq(&now_s),
        ))
        .execute(conn)
        .expect("seed task");

    t::agg_tasks
        .filter(t::canonical_symbol.eq(symbol))
        .filter(t::timeframe.eq(timeframe::db::to_db_string(target)))
        .select(t::id)
        .first(conn)
        .expect("task id")
}

pub fn load_task(conn: &mut SqliteConnection, symbol: &str, target: Timeframe) -> AggTask {
    use bar_rollup::schema::agg_tasks::dsl as t;
    t::agg_tasks
        .filter(t::canonical_symbol.eq(symbol))
        .filter(t::timeframe.eq(timeframe::db::to_db_string(target)))
        .first(conn)
        .expect("load task")
}

/// One source-minute bar with deterministic prices derived from `i`.
pub fn minute_bar(symbol: &str, start: DateTime<Utc>, i: i64) -> NewSourceBar<'_> {
    let base = 1.10 + (i as f64) * 0.001;
    NewSourceBar {
        canonical_symbol: symbol,
        timeframe: timeframe::db::to_db_string(Timeframe::M1),
        ts_utc: tz::to_rfc3339_millis(start + Duration::minutes(i)),
        open: base,
        high: base + 0.002,
        low: base - 0.003,
        close: base + 0.001,
        volume: 100.0 + i as f64,
        trade_count: 10 + i,
    }
}

/// Seed `count` consecutive 1m bars beginning at `start`.
pub fn seed_minutes(conn: &mut SqliteConnection, symbol: &str, start: DateTime<Utc>, count: i64) {
    use bar_rollup::schema::source_bars::dsl as sb;
    for i in 0..count {
        diesel::insert_into(sb::source_bars)
            .values(&minute_bar(symbol, start, i))
            .execute(conn)
            .expect("seed minute bar");
    }
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    n: i64,
}

pub fn count(conn: &mut SqliteConnection, table: &str) -> i64 {
    let row: CountRow = diesel::sql_query(format!("SELECT COUNT(*) AS n FROM {table}"))
        .get_result(conn)
        .expect("count query");
    row.n
}
