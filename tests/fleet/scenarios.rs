//! BDD scenarios for fleet launches and destroy-all.

use rstest_bdd_macros::scenario;

use super::test_helpers::{FleetContext, fleet_context};

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Record every launched instance"
)]
fn scenario_record_launches(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Count failed launches without recording them"
)]
fn scenario_failed_launches(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Destroy everything and remove the registry"
)]
fn scenario_destroy_everything(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Keep instances that could not be destroyed"
)]
fn scenario_keep_failed_destroys(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Force clearing drops failed records too"
)]
fn scenario_force_clear(fleet_context: FleetContext) {
    let _ = fleet_context;
}

#[scenario(
    path = "tests/features/fleet.feature",
    name = "Refuse to destroy without a registry"
)]
fn scenario_missing_registry(fleet_context: FleetContext) {
    let _ = fleet_context;
}
