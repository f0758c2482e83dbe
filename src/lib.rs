//! Core library for the stemrig GPU separation orchestrator.
//!
//! The crate rents short-lived GPU instances from a marketplace, runs an
//! audio separation job on the service inside them, downloads the result,
//! and always tears the instance down again. A fleet mode launches many
//! instances for capacity testing and remembers them in a registry file so
//! they can be destroyed later.

pub mod config;
pub mod fetch;
pub mod fleet;
pub mod gateway;
pub mod job;
pub mod marketplace;
pub mod poll;
pub mod provision;
pub mod ranking;
pub mod readiness;
pub mod registry;
pub mod run;
pub mod runpod;
pub mod service;
pub mod teardown;
pub mod telemetry;
pub mod test_support;
pub mod vast;

pub use config::{ConfigError, Provider, StemrigConfig};
pub use fleet::{ClearPolicy, DestroySummary, FleetError, FleetLauncher, LaunchSummary, destroy_all};
pub use gateway::{GatewayError, ProviderGateway};
pub use marketplace::{
    AvailabilityClass, Classify, Endpoint, InstanceSnapshot, InstanceSpec, InstanceStatus,
    Marketplace, Offer, OfferQuery,
};
pub use registry::{InstanceRecord, InstanceRegistry, RegistryError};
pub use run::{RunError, RunOrchestrator, RunReport, RunRequest, RunSettings};
pub use runpod::{RunPodError, RunPodGateway};
pub use vast::{VastError, VastGateway};
