//! BDD step definitions for the `stemrig separate` workflow.

use rstest_bdd_macros::{given, then, when};
use stemrig::RunOrchestrator;
use stemrig::run::RunRequest;
use stemrig::service::{JobStatus, JobStatusReport};
use stemrig::test_support::{
    CreateStep, ManualClock, RecordingEvents, ScriptedConnector, ScriptedMarketplace, offer,
    report,
};
use tokio::runtime::Runtime;

use super::test_helpers::{RunContext, RunResult, settings};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a marketplace offering \"{gpu}\" at \"{price}\" per hour")]
fn marketplace_offering(run_context: RunContext, gpu: String, price: f64) -> RunContext {
    let id = format!("offer-{}", gpu.to_ascii_lowercase().replace(' ', "-"));
    run_context.market.add_offer(offer(&id, &gpu, price));
    run_context
}

#[given("a marketplace with no offers")]
fn marketplace_without_offers(mut run_context: RunContext) -> RunContext {
    run_context.market = ScriptedMarketplace::new();
    run_context
}

#[given("the first create reports the offer as taken")]
fn first_create_taken(run_context: RunContext) -> RunContext {
    run_context.market.script_creates([CreateStep::Capacity]);
    run_context
}

#[given("a separation service producing \"{artifact}\"")]
fn service_producing(run_context: RunContext, artifact: String) -> RunContext {
    run_context
        .service
        .set_artifact(&artifact, format!("separated {artifact}").into_bytes());
    run_context
}

#[given("the remote job fails with \"{message}\"")]
fn remote_job_fails(run_context: RunContext, message: String) -> RunContext {
    run_context.service.script_reports([JobStatusReport {
        error: Some(message),
        ..report("job-1", JobStatus::Failed)
    }]);
    run_context
}

#[given("destroying \"{instance_id}\" fails")]
fn destroy_fails(run_context: RunContext, instance_id: String) -> RunContext {
    run_context.market.fail_destroy(&instance_id);
    run_context
}

#[given("the instance is kept after the run")]
fn keep_instance(mut run_context: RunContext) -> RunContext {
    run_context.keep_instance = true;
    run_context
}

#[when("I run a separation job for \"{input_url}\"")]
fn run_job(run_context: RunContext, input_url: String) -> Result<RunContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let orchestrator = RunOrchestrator::with_clock(
        run_context.market.clone(),
        ScriptedConnector::new(run_context.service.clone()),
        ManualClock::new(),
        settings(),
    );
    let mut request = RunRequest::new(input_url, run_context.destination.clone());
    request.keep_instance = run_context.keep_instance;

    let result = runtime.block_on(async {
        let mut events = RecordingEvents::default();
        orchestrator
            .execute(&request, &mut events, std::future::pending())
            .await
    });

    let outcome = match result {
        Ok(report) => RunResult::Success(Box::new(report)),
        Err(err) => RunResult::Failure(err.to_string()),
    };
    Ok(RunContext {
        outcome: Some(outcome),
        ..run_context
    })
}

#[then("the run succeeds after \"{attempts}\" create attempt")]
fn run_succeeds(run_context: &RunContext, attempts: usize) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunResult::Success(report)) if report.attempts == attempts => Ok(()),
        Some(RunResult::Success(report)) => Err(StepError::Assertion(format!(
            "expected {attempts} create attempt(s), got {}",
            report.attempts
        ))),
        Some(RunResult::Failure(message)) => Err(StepError::Assertion(format!(
            "run failed unexpectedly: {message}"
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the run fails with \"{expected}\"")]
fn run_fails_with(run_context: &RunContext, expected: String) -> Result<(), StepError> {
    match &run_context.outcome {
        Some(RunResult::Failure(message)) if message.contains(&expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning '{expected}', got {other:?}"
        ))),
    }
}

#[then("the downloaded file contains \"{expected}\"")]
fn downloaded_file_contains(run_context: &RunContext, expected: String) -> Result<(), StepError> {
    let contents = std::fs::read_to_string(&run_context.destination)
        .map_err(|err| StepError::Assertion(format!("read result: {err}")))?;
    if contents.contains(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "result '{contents}' does not mention '{expected}'"
        )))
    }
}

#[then("instance \"{instance_id}\" is destroyed")]
fn instance_destroyed(run_context: &RunContext, instance_id: String) -> Result<(), StepError> {
    let destroyed = run_context.market.destroyed();
    if destroyed == vec![instance_id.clone()] {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected only {instance_id} destroyed, got {destroyed:?}"
        )))
    }
}

#[then("no instance is destroyed")]
fn nothing_destroyed(run_context: &RunContext) -> Result<(), StepError> {
    let attempts = run_context.market.destroy_attempts();
    if attempts.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected destroy calls: {attempts:?}"
        )))
    }
}
