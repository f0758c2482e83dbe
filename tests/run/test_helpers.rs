//! Shared fixtures for run BDD scenarios.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::fixture;
use stemrig::marketplace::InstanceSpec;
use stemrig::run::{RunReport, RunSettings};
use stemrig::test_support::{ScriptedMarketplace, ScriptedService};
use tempfile::TempDir;

#[derive(Clone, Debug)]
pub struct RunContext {
    pub market: ScriptedMarketplace,
    pub service: ScriptedService,
    pub keep_instance: bool,
    pub destination: Utf8PathBuf,
    pub outcome: Option<RunResult>,
    pub(crate) workspace: Arc<TempDir>,
}

#[derive(Clone, Debug)]
pub enum RunResult {
    Success(Box<RunReport>),
    Failure(String),
}

#[fixture]
pub fn run_context() -> RunContext {
    let workspace = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
    let root = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf())
        .unwrap_or_else(|path| panic!("non-utf8 tempdir path: {}", path.display()));
    RunContext {
        market: ScriptedMarketplace::new(),
        service: ScriptedService::new(),
        keep_instance: false,
        destination: root.join("results").join("instrumental.mp3"),
        outcome: None,
        workspace: Arc::new(workspace),
    }
}

pub fn settings() -> RunSettings {
    let template = InstanceSpec::builder()
        .image("ghcr.io/example/separator:latest")
        .disk_gb(20)
        .label("stemrig-bdd")
        .service_port(8185)
        .build()
        .unwrap_or_else(|err| panic!("template fixture should be valid: {err}"));
    RunSettings::new(template)
}
