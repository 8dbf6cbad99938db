//! Diesel table definitions for the engine store.

// Column/table types are generated by the `diesel::table!` macro and carry no
// hand-written docs; exempt this module from the crate-wide `missing_docs` lint.
#![allow(missing_docs)]

diesel::table! {
    source_bars (id) {
        id -> Integer,
        canonical_symbol -> Text,
        timeframe -> Text,
        ts_utc -> Text,
        open -> Double,
        high -> Double,
        low -> Double,
        close -> Double,
        volume -> Double,
        trade_count -> BigInt,
    }
}

diesel::table! {
    derived_bars (id) {
        id -> Integer,
        canonical_symbol -> Text,
        timeframe -> Text,
        ts_utc -> Text,
        open -> Double,
        high -> Double,
        low -> Double,
        close -> Double,
        volume -> Double,
        trade_count -> BigInt,
        quality_score -> Integer,
        source_timeframe -> Text,
        source_row_count -> BigInt,
        derivation_version -> Integer,
    }
}

diesel::table! {
    asset_registry (canonical_symbol) {
        canonical_symbol -> Text,
        name -> Text,
        is_active -> Bool,
        is_composite -> Bool,
        updated_at -> Text,
    }
}

diesel::table! {
    agg_tasks (id) {
        id -> Integer,
        canonical_symbol -> Text,
        timeframe -> Text,
        source_timeframe -> Text,
        run_interval_secs -> BigInt,
        confirmation_delay_secs -> BigInt,
        agg_start -> Text,
        cursor -> Nullable<Text>,
        status -> Text,
        enabled -> Bool,
        is_mandatory -> Bool,
        priority -> Integer,
        hard_fail_streak -> Integer,
        last_successful_at -> Nullable<Text>,
        last_error -> Nullable<Text>,
        next_run_at -> Text,
        locked_at -> Nullable<Text>,
        total_runs -> BigInt,
        total_bars_created -> BigInt,
        total_bars_poor_quality -> BigInt,
        created_at -> Text,
        updated_at -> Text,
    }
}

diesel::table! {
    validation_runs (id) {
        id -> Integer,
        run_id -> Text,
        mode -> Text,
        triggered_by -> Text,
        started_at -> Text,
        finished_at -> Text,
        overall_status -> Text,
        checks_run -> Integer,
        issue_count -> BigInt,
    }
}

diesel::table! {
    validation_results (id) {
        id -> Integer,
        run_id -> Text,
        check_category -> Text,
        status -> Text,
        execution_time_ms -> BigInt,
        issue_count -> BigInt,
        result_summary -> Text,
        issue_details -> Text,
    }
}

diesel::table! {
    validation_issues (id) {
        id -> Integer,
        run_id -> Text,
        check_category -> Text,
        severity -> Text,
        summary -> Text,
        canonical_symbol -> Nullable<Text>,
        timeframe -> Nullable<Text>,
        ts_utc -> Nullable<Text>,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    source_bars,
    derived_bars,
    asset_registry,
    agg_tasks,
    validation_runs,
    validation_results,
    validation_issues,
);
