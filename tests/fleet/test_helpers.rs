//! Shared fixtures and helpers for fleet BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::fixture;
use stemrig::fleet::{DestroySummary, FleetSettings, LaunchSummary};
use stemrig::marketplace::InstanceSpec;
use stemrig::registry::InstanceRegistry;
use stemrig::test_support::ScriptedMarketplace;
use tempfile::TempDir;

#[derive(Clone, Debug)]
pub enum FleetOutcome {
    Launched(LaunchSummary),
    Destroyed(DestroySummary),
    Failure(String),
}

#[derive(Clone, Debug)]
pub struct FleetContext {
    pub market: ScriptedMarketplace,
    pub registry: InstanceRegistry,
    pub outcome: Option<FleetOutcome>,
    pub(crate) workspace: Arc<TempDir>,
}

#[fixture]
pub fn fleet_context() -> FleetContext {
    let workspace = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let path = Utf8PathBuf::from_path_buf(workspace.path().join("active_instances.json"))
        .unwrap_or_else(|path| panic!("non-utf8 tempdir path: {}", path.display()));
    FleetContext {
        market: ScriptedMarketplace::new(),
        registry: InstanceRegistry::new(path),
        outcome: None,
        workspace: Arc::new(workspace),
    }
}

pub fn settings() -> FleetSettings {
    let template = InstanceSpec::builder()
        .image("ghcr.io/example/separator:latest")
        .disk_gb(20)
        .label("unused")
        .service_port(8185)
        .build()
        .unwrap_or_else(|err| panic!("template fixture should be valid: {err}"));
    FleetSettings {
        label_prefix: String::from("capacity"),
        ..FleetSettings::new(template)
    }
}

pub fn registry_ids(context: &FleetContext) -> Option<Vec<String>> {
    context
        .registry
        .load()
        .unwrap_or_else(|err| panic!("registry should load: {err}"))
        .map(|records| records.into_iter().map(|record| record.instance_id).collect())
}
