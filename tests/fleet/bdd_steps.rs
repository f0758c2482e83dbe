//! BDD step definitions for the fleet workflow.

use rstest_bdd_macros::{given, then, when};
use stemrig::fleet::{ClearPolicy, FleetLauncher, destroy_all};
use stemrig::test_support::{CreateStep, offer};
use tokio::runtime::Runtime;

use super::test_helpers::{FleetContext, FleetOutcome, registry_ids, settings};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

fn runtime() -> Result<Runtime, StepError> {
    Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))
}

fn launch(fleet_context: &FleetContext, count: usize) -> Result<FleetOutcome, StepError> {
    runtime()?.block_on(async {
        let prepared =
            FleetLauncher::prepare(&fleet_context.market, &fleet_context.registry, settings())
                .await;
        let outcome = match prepared {
            Ok(launcher) => launcher.launch(count, std::future::pending()).await,
            Err(err) => Err(err),
        };
        Ok(match outcome {
            Ok(summary) => FleetOutcome::Launched(summary),
            Err(err) => FleetOutcome::Failure(err.to_string()),
        })
    })
}

fn destroy(fleet_context: FleetContext, policy: ClearPolicy) -> Result<FleetContext, StepError> {
    let result = runtime()?.block_on(destroy_all(
        &fleet_context.market,
        &fleet_context.registry,
        policy,
    ));
    let outcome = match result {
        Ok(summary) => FleetOutcome::Destroyed(summary),
        Err(err) => FleetOutcome::Failure(err.to_string()),
    };
    Ok(FleetContext {
        outcome: Some(outcome),
        ..fleet_context
    })
}

#[given("a marketplace offering \"{first}\" and \"{second}\"")]
fn marketplace_offering(fleet_context: FleetContext, first: String, second: String) -> FleetContext {
    fleet_context.market.add_offer(offer("offer-a", &first, 0.20));
    fleet_context.market.add_offer(offer("offer-b", &second, 0.40));
    fleet_context
}

#[given("the second create is rejected")]
fn second_create_rejected(fleet_context: FleetContext) -> FleetContext {
    fleet_context.market.script_creates([
        CreateStep::Created(String::from("inst-1")),
        CreateStep::Fatal(String::from("quota exceeded")),
        CreateStep::Created(String::from("inst-2")),
    ]);
    fleet_context
}

#[given("\"{count}\" fleet instances were launched")]
fn instances_launched(fleet_context: FleetContext, count: usize) -> Result<FleetContext, StepError> {
    match launch(&fleet_context, count)? {
        FleetOutcome::Launched(summary) if summary.succeeded == count => Ok(fleet_context),
        other => Err(StepError::Assertion(format!(
            "setup launch did not succeed: {other:?}"
        ))),
    }
}

#[given("destroying \"{instance_id}\" fails")]
fn destroy_fails(fleet_context: FleetContext, instance_id: String) -> FleetContext {
    fleet_context.market.fail_destroy(&instance_id);
    fleet_context
}

#[when("I launch \"{count}\" fleet instances")]
fn launch_instances(fleet_context: FleetContext, count: usize) -> Result<FleetContext, StepError> {
    let outcome = launch(&fleet_context, count)?;
    Ok(FleetContext {
        outcome: Some(outcome),
        ..fleet_context
    })
}

#[when("I destroy all fleet instances")]
fn destroy_everything(fleet_context: FleetContext) -> Result<FleetContext, StepError> {
    destroy(fleet_context, ClearPolicy::RetainFailed)
}

#[when("I force destroy all fleet instances")]
fn force_destroy_everything(fleet_context: FleetContext) -> Result<FleetContext, StepError> {
    destroy(fleet_context, ClearPolicy::ClearAll)
}

#[then("\"{succeeded}\" launches succeed and \"{failed}\" fail")]
fn launch_tally(
    fleet_context: &FleetContext,
    succeeded: usize,
    failed: usize,
) -> Result<(), StepError> {
    match &fleet_context.outcome {
        Some(FleetOutcome::Launched(summary))
            if summary.succeeded == succeeded
                && summary.failed == failed
                && summary.attempted == succeeded.saturating_add(failed) =>
        {
            Ok(())
        }
        other => Err(StepError::Assertion(format!(
            "expected {succeeded} succeeded and {failed} failed, got {other:?}"
        ))),
    }
}

#[then("the registry lists \"{ids}\"")]
fn registry_lists(fleet_context: &FleetContext, ids: String) -> Result<(), StepError> {
    let expected: Vec<String> = ids.split(',').map(str::to_owned).collect();
    let actual = registry_ids(fleet_context);
    if actual.as_ref() == Some(&expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected registry {expected:?}, got {actual:?}"
        )))
    }
}

#[then("the launch labels cycle through the ranked offers")]
fn labels_cycle(fleet_context: &FleetContext) -> Result<(), StepError> {
    let created: Vec<(String, String)> = fleet_context
        .market
        .created()
        .into_iter()
        .map(|spec| (spec.offer_id, spec.label))
        .collect();
    let expected = vec![
        (String::from("offer-a"), String::from("capacity-00")),
        (String::from("offer-b"), String::from("capacity-01")),
        (String::from("offer-a"), String::from("capacity-02")),
    ];
    if created == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "unexpected create calls: {created:?}"
        )))
    }
}

#[then("\"{count}\" instances are destroyed")]
fn destroyed_count(fleet_context: &FleetContext, count: usize) -> Result<(), StepError> {
    match &fleet_context.outcome {
        Some(FleetOutcome::Destroyed(summary)) if summary.destroyed == count => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected {count} destroyed, got {other:?}"
        ))),
    }
}

#[then("the registry file is gone")]
fn registry_gone(fleet_context: &FleetContext) -> Result<(), StepError> {
    match registry_ids(fleet_context) {
        None => Ok(()),
        Some(ids) => Err(StepError::Assertion(format!(
            "registry still lists {ids:?}"
        ))),
    }
}

#[then("the fleet command fails with \"{expected}\"")]
fn fleet_fails(fleet_context: &FleetContext, expected: String) -> Result<(), StepError> {
    match &fleet_context.outcome {
        Some(FleetOutcome::Failure(message)) if message.contains(&expected) => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected a failure mentioning '{expected}', got {other:?}"
        ))),
    }
}
