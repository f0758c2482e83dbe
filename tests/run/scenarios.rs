//! BDD scenarios for the separation run workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{RunContext, run_context};

#[scenario(
    path = "tests/features/run.feature",
    name = "Download the result and destroy the instance"
)]
fn scenario_download_and_destroy(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Fall back to the next offer when capacity is gone"
)]
fn scenario_capacity_fallback(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Report a failed job and still tear down"
)]
fn scenario_failed_job_tears_down(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Attach a teardown failure to a failed job"
)]
fn scenario_teardown_failure_attached(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Surface teardown failure after success"
)]
fn scenario_teardown_failure_after_success(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Keep the instance when asked"
)]
fn scenario_keep_instance(run_context: RunContext) {
    let _ = run_context;
}

#[scenario(
    path = "tests/features/run.feature",
    name = "Report missing capacity without creating anything"
)]
fn scenario_no_capacity(run_context: RunContext) {
    let _ = run_context;
}
