//! Check sequencing and resilient persistence.
//!
//! Runs the mode's checks in fixed order (architecture first), converts any
//! check's internal failure into a `status = error` result, and persists
//! every result plus raised issues as it goes. There is deliberately no
//! enclosing transaction: a failing check must never roll back or block the
//! records of the others.

use std::time::Instant;

use chrono::Duration;
use diesel::prelude::*;

use crate::{
    tz,
    validation::{
        CheckCategory, CheckContext, CheckOutcome, CheckStatus, RunMode, checks,
    },
};

/// One persisted check result, echoed back to the caller.
#[derive(Debug, Clone)]
pub struct CheckRecord {
    /// Check identity.
    pub category: CheckCategory,
    /// Graded (possibly budget-escalated) status.
    pub status: CheckStatus,
    /// Findings counted by the check.
    pub issue_count: i64,
    /// Wall-clock execution time.
    pub execution_time_ms: i64,
}

/// Outcome of one orchestrator invocation.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Unique id of the persisted run record.
    pub run_id: String,
    /// Worst severity seen across all checks.
    pub overall: CheckStatus,
    /// Issues raised by this run.
    pub issue_count: i64,
    /// Per-check records, in execution order.
    pub checks: Vec<CheckRecord>,
}

/// Run a mode's checks and persist one run record, one result per check,
/// and one issue per non-passing finding.
pub fn run_health_checks(
    conn: &mut SqliteConnection,
    mode: RunMode,
    trigger: &str,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<RunSummary> {
    let started = ctx.now;
    let run_id = format!("{}_{}", started.format("%Y%m%d_%H%M%S"), mode.as_str());
    let budget_ms = ctx.cfg.validation.check_budget_secs as i64 * 1_000;

    let mut overall = CheckStatus::Pass;
    let mut records = Vec::new();
    let mut issues_raised = 0i64;
    let mut total_elapsed_ms = 0i64;

    for &category in mode.categories() {
        let t0 = Instant::now();
        let result = checks::run_check(conn, category, ctx);
        let elapsed_ms = t0.elapsed().as_millis() as i64;
        total_elapsed_ms += elapsed_ms;

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(
                    category = category.as_str(),
                    error = %err,
                    "check failed internally; recording error result"
                );
                CheckOutcome {
                    category,
                    status: CheckStatus::Error,
                    issue_count: 1,
                    summary: serde_json::json!({ "error": err.to_string() }),
                    details: Vec::new(),
                }
            }
        };

        // A check that blew its wall-clock budget cannot be trusted to have
        // seen everything; surface that, never silently. Escalate only.
        if elapsed_ms > budget_ms {
            outcome.status = outcome.status.worst(CheckStatus::Error);
            outcome.summary["budget_exceeded_ms"] = serde_json::json!(elapsed_ms - budget_ms);
        }

        persist_result(conn, &run_id, &outcome, elapsed_ms)?;
        if outcome.status != CheckStatus::Pass {
            issues_raised += raise_issues(conn, &run_id, &outcome, ctx)?;
        }

        overall = overall.worst(outcome.status);
        records.push(CheckRecord {
            category,
            status: outcome.status,
            issue_count: outcome.issue_count,
            execution_time_ms: elapsed_ms,
        });
    }

    let finished = started + Duration::milliseconds(total_elapsed_ms);
    {
        use crate::schema::validation_runs::dsl as vr;
        diesel::insert_into(vr::validation_runs)
            .values((
                vr::run_id.eq(&run_id),
                vr::mode.eq(mode.as_str()),
                vr::triggered_by.eq(trigger),
                vr::started_at.eq(tz::to_rfc3339_millis(started)),
                vr::finished_at.eq(tz::to_rfc3339_millis(finished)),
                vr::overall_status.eq(overall.as_str()),
                vr::checks_run.eq(records.len() as i32),
                vr::issue_count.eq(issues_raised),
            ))
            .execute(conn)?;
    }

    tracing::info!(
        run_id = %run_id,
        mode = mode.as_str(),
        trigger,
        overall = overall.as_str(),
        checks = records.len(),
        issues = issues_raised,
        "validation run recorded"
    );

    Ok(RunSummary {
        run_id,
        overall,
        issue_count: issues_raised,
        checks: records,
    })
}

fn persist_result(
    conn: &mut SqliteConnection,
    run_id: &str,
    outcome: &CheckOutcome,
    elapsed_ms: i64,
) -> anyhow::Result<()> {
    use crate::schema::validation_results::dsl as res;

    diesel::insert_into(res::validation_results)
        .values((
            res::run_id.eq(run_id),
            res::check_category.eq(outcome.category.as_str()),
            res::status.eq(outcome.status.as_str()),
            res::execution_time_ms.eq(elapsed_ms),
            res::issue_count.eq(outcome.issue_count),
            res::result_summary.eq(outcome.summary.to_string()),
            res::issue_details.eq(serde_json::to_string(&outcome.details)?),
        ))
        .execute(conn)?;
    Ok(())
}

fn raise_issues(
    conn: &mut SqliteConnection,
    run_id: &str,
    outcome: &CheckOutcome,
    ctx: &CheckContext<'_>,
) -> anyhow::Result<i64> {
    use crate::schema::validation_issues::dsl as iss;

    let created = tz::to_rfc3339_millis(ctx.now);
    let severity = outcome.status.as_str();
    let mut raised = 0i64;

    if outcome.details.is_empty() {
        diesel::insert_into(iss::validation_issues)
            .values((
                iss::run_id.eq(run_id),
                iss::check_category.eq(outcome.category.as_str()),
                iss::severity.eq(severity),
                iss::summary.eq(format!(
                    "{}: {} findings",
                    outcome.category.as_str(),
                    outcome.issue_count
                )),
                iss::created_at.eq(&created),
            ))
            .execute(conn)?;
        raised += 1;
    } else {
        for detail in &outcome.details {
            diesel::insert_into(iss::validation_issues)
                .values((
                    iss::run_id.eq(run_id),
                    iss::check_category.eq(outcome.category.as_str()),
                    iss::severity.eq(severity),
                    iss::summary.eq(&detail.note),
                    iss::canonical_symbol.eq(detail.canonical_symbol.as_deref()),
                    iss::timeframe.eq(detail.timeframe.as_deref()),
                    iss::ts_utc.eq(detail.ts_utc.as_deref()),
                    iss::created_at.eq(&created),
                ))
                .execute(conn)?;
            raised += 1;
        }
    }

    Ok(raised)
}
