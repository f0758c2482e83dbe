//! Unit tests for readiness probing.

use std::time::Duration;

use super::*;
use crate::test_support::{
    ManualClock, ScriptedConnector, ScriptedMarketplace, ScriptedService, snapshot,
};
use rstest::rstest;

const PORT: u16 = 8185;

fn policy() -> PollPolicy {
    PollPolicy::new(Duration::from_secs(10), Duration::from_secs(60))
}

#[rstest]
#[tokio::test]
async fn waits_through_creation_and_missing_mapping() {
    let market = ScriptedMarketplace::new();
    market.push_snapshot(snapshot(InstanceStatus::Creating, None));
    market.push_snapshot(snapshot(InstanceStatus::Running, None));
    market.push_snapshot(snapshot(InstanceStatus::Running, Some(PORT)));
    let service = ScriptedService::new();
    let connector = ScriptedConnector::new(service);
    let clock = ManualClock::new();

    let endpoint = ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_ready("inst-1", policy())
        .await
        .expect("instance becomes ready");

    assert_eq!(endpoint, Endpoint::new("127.0.0.1", PORT));
    assert_eq!(market.get_calls(), 3);
    assert_eq!(clock.sleeps().len(), 2);
}

#[rstest]
#[tokio::test]
async fn unhealthy_service_keeps_polling() {
    let market = ScriptedMarketplace::new();
    let service = ScriptedService::new();
    service.script_health([false, false, true]);
    let connector = ScriptedConnector::new(service);
    let clock = ManualClock::new();

    ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_ready("inst-1", policy())
        .await
        .expect("healthy on third probe");

    assert_eq!(connector.endpoints().len(), 3);
}

#[rstest]
#[tokio::test]
async fn times_out_with_elapsed_duration() {
    let market = ScriptedMarketplace::new();
    market.push_snapshot(snapshot(InstanceStatus::Creating, None));
    let connector = ScriptedConnector::new(ScriptedService::new());
    let clock = ManualClock::new();

    let err = ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_ready("inst-1", policy())
        .await
        .expect_err("never ready");

    match err {
        ReadinessError::Timeout {
            instance_id,
            elapsed,
        } => {
            assert_eq!(instance_id, "inst-1");
            assert!(elapsed >= Duration::from_secs(60), "{elapsed:?}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[rstest]
#[tokio::test]
async fn gateway_failure_is_fatal() {
    let market = ScriptedMarketplace::new();
    market.push_get_failure("api down");
    let connector = ScriptedConnector::new(ScriptedService::new());
    let clock = ManualClock::new();

    let err = ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_ready("inst-1", policy())
        .await
        .expect_err("gateway failure");

    assert!(matches!(err, ReadinessError::Gateway(_)));
    assert!(clock.sleeps().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroyed_instance_is_reported_gone() {
    let market = ScriptedMarketplace::new();
    market.push_snapshot(snapshot(InstanceStatus::Creating, None));
    market.push_snapshot(snapshot(InstanceStatus::Destroyed, None));
    let connector = ScriptedConnector::new(ScriptedService::new());
    let clock = ManualClock::new();

    let err = ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_ready("inst-1", policy())
        .await
        .expect_err("instance vanished");

    assert!(matches!(err, ReadinessError::Gone { .. }));
}

#[rstest]
#[tokio::test]
async fn models_ready_waits_for_flag() {
    let market = ScriptedMarketplace::new();
    let service = ScriptedService::new();
    service.script_models_ready([false, false, true]);
    let connector = ScriptedConnector::new(service);
    let clock = ManualClock::new();

    ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_models_ready(&Endpoint::new("127.0.0.1", PORT), PollPolicy::models())
        .await
        .expect("models load");

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 2]);
}

#[rstest]
#[tokio::test]
async fn models_ready_times_out() {
    let market = ScriptedMarketplace::new();
    let service = ScriptedService::new();
    service.script_models_ready([false]);
    let connector = ScriptedConnector::new(service);
    let clock = ManualClock::new();

    let err = ReadinessProber::new(&market, &connector, &clock, PORT)
        .wait_models_ready(&Endpoint::new("127.0.0.1", PORT), policy())
        .await
        .expect_err("models never load");

    assert!(matches!(err, ReadinessError::ModelsTimeout { .. }));
}
