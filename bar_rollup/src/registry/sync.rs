//! Registry synchronization: asset file -> `asset_registry` + `agg_tasks`.
//!
//! ## What this does
//! - Treats the normalized asset file as the desired registry state.
//! - Computes a diff against the store and applies it with UPSERTs
//!   (idempotent): registry rows for every listed symbol, one task row per
//!   (active symbol, ladder rung).
//! - Symbols that disappear from the file are *deactivated*, and their
//!   tasks disabled — never deleted, historical bars keep referencing them.
//!
//! ## Transactions & consistency
//! Everything runs inside one `BEGIN IMMEDIATE` transaction via
//! `immediate_transaction`, so a sync either applies wholly or not at all.
//!
//! ## Dry-run
//! With `SyncOptions::dry_run` the diff is computed and returned without
//! touching the store.
//!
//! ## Failure-disabled tasks
//! A task disabled by its failure streak keeps a non-zero
//! `hard_fail_streak`; sync re-enables only tasks disabled with a clean
//! streak (i.e. disabled because their symbol was untracked).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::{
    config::EngineConfig,
    models::{NewAggTask, NewRegistryAsset, TaskStatus},
    registry::{assets::AssetFile, cache},
    schema::{agg_tasks::dsl as t, asset_registry::dsl as ar},
    timeframe,
    tz,
};

/// Options for registry synchronization.
pub struct SyncOptions {
    /// If true, compute the diff only; write nothing.
    pub dry_run: bool,
}

/// Summary of changes performed (or, under dry-run, required).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Registry rows inserted or updated.
    pub assets_upserted: usize,
    /// Registry rows flipped to inactive.
    pub assets_deactivated: usize,
    /// Task rows created.
    pub tasks_created: usize,
    /// Task rows whose rung configuration changed.
    pub tasks_updated: usize,
    /// Tasks re-enabled after their symbol returned to the file.
    pub tasks_reenabled: usize,
    /// Tasks disabled because their symbol left the file.
    pub tasks_disabled: usize,
}

impl SyncReport {
    /// True when the store already matched the file.
    pub fn is_noop(&self) -> bool {
        self.assets_upserted == 0
            && self.assets_deactivated == 0
            && self.tasks_created == 0
            && self.tasks_updated == 0
            && self.tasks_reenabled == 0
            && self.tasks_disabled == 0
    }
}

#[derive(Debug, PartialEq)]
struct WantTask {
    source: &'static str,
    run_interval_secs: i64,
    confirmation_delay_secs: i64,
    is_mandatory: bool,
    priority: i32,
}

/// Sync the asset registry and the aggregation task table from a file.
pub fn sync_assets(
    conn: &mut SqliteConnection,
    file: &AssetFile,
    cfg: &EngineConfig,
    now: DateTime<Utc>,
    opt: SyncOptions,
) -> anyhow::Result<SyncReport> {
    let now_s = tz::to_rfc3339_millis(now);
    let agg_start_s = tz::to_rfc3339_millis(cfg.agg_start_utc()?);

    // Desired state from the file + ladder.
    let mut want_assets = BTreeMap::new();
    for asset in &file.assets {
        want_assets.insert(asset.symbol.clone(), asset);
    }
    let mut want_tasks: BTreeMap<(String, &'static str), WantTask> = BTreeMap::new();
    for asset in file.assets.iter().filter(|a| a.active) {
        for rung in &cfg.ladder {
            let target = rung.target()?;
            let source = rung.source_tf()?;
            want_tasks.insert(
                (asset.symbol.clone(), timeframe::db::to_db_string(target)),
                WantTask {
                    source: timeframe::db::to_db_string(source),
                    run_interval_secs: target.secs(),
                    confirmation_delay_secs: rung.confirmation_delay_secs,
                    is_mandatory: rung.mandatory,
                    priority: rung.priority,
                },
            );
        }
    }
    let active_symbols: BTreeSet<&String> = file
        .assets
        .iter()
        .filter(|a| a.active)
        .map(|a| &a.symbol)
        .collect();

    let dry_run = opt.dry_run;
    let mut report = SyncReport::default();

    conn.immediate_transaction::<_, anyhow::Error, _>(|conn| {
        // --- registry rows
        let existing_assets: Vec<(String, String, bool, bool)> = ar::asset_registry
            .select((ar::canonical_symbol, ar::name, ar::is_active, ar::is_composite))
            .load(conn)?;
        let existing_by_symbol: BTreeMap<_, _> = existing_assets
            .iter()
            .map(|(s, n, a, c)| (s.clone(), (n.clone(), *a, *c)))
            .collect();

        for (symbol, asset) in &want_assets {
            let changed = match existing_by_symbol.get(symbol) {
                Some((name, active, composite)) => {
                    name != &asset.name || *active != asset.active || *composite != asset.composite
                }
                None => true,
            };
            if !changed {
                continue;
            }
            report.assets_upserted += 1;
            if !dry_run {
                let row = NewRegistryAsset {
                    canonical_symbol: symbol,
                    name: &asset.name,
                    is_active: asset.active,
                    is_composite: asset.composite,
                    updated_at: now_s.clone(),
                };
                diesel::insert_into(ar::asset_registry)
                    .values(&row)
                    .on_conflict(ar::canonical_symbol)
                    .do_update()
                    .set(&row)
                    .execute(conn)?;
            }
        }

        for (symbol, _, active, _) in &existing_assets {
            if *active && !want_assets.contains_key(symbol) {
                report.assets_deactivated += 1;
                if !dry_run {
                    diesel::update(ar::asset_registry.filter(ar::canonical_symbol.eq(symbol)))
                        .set((ar::is_active.eq(false), ar::updated_at.eq(&now_s)))
                        .execute(conn)?;
                }
            }
        }

        // --- task rows
        type TaskProbe = (
            i32,
            String,
            String,
            String,
            i64,
            i64,
            bool,
            i32,
            bool,
            String,
            i32,
        );
        let existing_tasks: Vec<TaskProbe> = t::agg_tasks
            .select((
                t::id,
                t::canonical_symbol,
                t::timeframe,
                t::source_timeframe,
                t::run_interval_secs,
                t::confirmation_delay_secs,
                t::is_mandatory,
                t::priority,
                t::enabled,
                t::status,
                t::hard_fail_streak,
            ))
            .load(conn)?;
        let tasks_by_key: BTreeMap<(String, String), &TaskProbe> = existing_tasks
            .iter()
            .map(|row| ((row.1.clone(), row.2.clone()), row))
            .collect();

        for ((symbol, tf_code), want) in &want_tasks {
            match tasks_by_key.get(&(symbol.clone(), tf_code.to_string())) {
                None => {
                    report.tasks_created += 1;
                    if !dry_run {
                        let row = NewAggTask {
                            canonical_symbol: symbol,
                            timeframe: *tf_code,
                            source_timeframe: want.source,
                            run_interval_secs: want.run_interval_secs,
                            confirmation_delay_secs: want.confirmation_delay_secs,
                            agg_start: agg_start_s.clone(),
                            status: TaskStatus::Idle.as_str(),
                            enabled: true,
                            is_mandatory: want.is_mandatory,
                            priority: want.priority,
                            next_run_at: now_s.clone(),
                            created_at: now_s.clone(),
                            updated_at: now_s.clone(),
                        };
                        diesel::insert_into(t::agg_tasks).values(&row).execute(conn)?;
                    }
                }
                Some(row) => {
                    let (id, _, _, source, interval, confirm, mandatory, priority, enabled, status, streak) = (
                        row.0, &row.1, &row.2, &row.3, row.4, row.5, row.6, row.7, row.8,
                        &row.9, row.10,
                    );
                    let config_changed = source.as_str() != want.source
                        || interval != want.run_interval_secs
                        || confirm != want.confirmation_delay_secs
                        || mandatory != want.is_mandatory
                        || priority != want.priority;
                    if config_changed {
                        report.tasks_updated += 1;
                        if !dry_run {
                            diesel::update(t::agg_tasks.find(id))
                                .set((
                                    t::source_timeframe.eq(want.source),
                                    t::run_interval_secs.eq(want.run_interval_secs),
                                    t::confirmation_delay_secs.eq(want.confirmation_delay_secs),
                                    t::is_mandatory.eq(want.is_mandatory),
                                    t::priority.eq(want.priority),
                                    t::updated_at.eq(&now_s),
                                ))
                                .execute(conn)?;
                        }
                    }
                    let untracked_disabled =
                        !enabled && status.as_str() == TaskStatus::Disabled.as_str() && streak == 0;
                    if untracked_disabled {
                        report.tasks_reenabled += 1;
                        if !dry_run {
                            diesel::update(t::agg_tasks.find(id))
                                .set((
                                    t::enabled.eq(true),
                                    t::status.eq(TaskStatus::Idle.as_str()),
                                    t::next_run_at.eq(&now_s),
                                    t::updated_at.eq(&now_s),
                                ))
                                .execute(conn)?;
                        }
                    }
                }
            }
        }

        for row in &existing_tasks {
            let (id, symbol, enabled, status) = (row.0, &row.1, row.8, &row.9);
            if enabled
                && !active_symbols.contains(symbol)
                && status.as_str() != TaskStatus::Running.as_str()
            {
                report.tasks_disabled += 1;
                if !dry_run {
                    diesel::update(t::agg_tasks.find(id))
                        .set((
                            t::enabled.eq(false),
                            t::status.eq(TaskStatus::Disabled.as_str()),
                            t::updated_at.eq(&now_s),
                        ))
                        .execute(conn)?;
                }
            }
        }

        Ok(())
    })?;

    if !dry_run {
        cache::refresh_active(conn)?;
    }

    tracing::info!(
        dry_run,
        assets_upserted = report.assets_upserted,
        assets_deactivated = report.assets_deactivated,
        tasks_created = report.tasks_created,
        tasks_updated = report.tasks_updated,
        tasks_reenabled = report.tasks_reenabled,
        tasks_disabled = report.tasks_disabled,
        "registry sync finished"
    );
    Ok(report)
}
