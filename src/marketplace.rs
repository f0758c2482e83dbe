//! Marketplace abstraction for renting short-lived GPU instances.
//!
//! Providers implement [`Marketplace`] to expose the four operations the
//! orchestrator needs: query offers, create an instance from an offer, read an
//! instance snapshot, and destroy an instance. Errors implement [`Classify`]
//! so the provisioning loop can tell an offer that vanished apart from a
//! systemic failure.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Availability class advertised for an offer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AvailabilityClass {
    /// Datacenter-grade capacity.
    Secure,
    /// Peer-hosted capacity.
    Community,
    /// Provider reports no availability class.
    #[default]
    None,
}

impl fmt::Display for AvailabilityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secure => write!(f, "secure"),
            Self::Community => write!(f, "community"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Priced GPU configuration returned by a marketplace query.
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
    /// Provider specific offer identifier.
    pub id: String,
    /// Marketing name of the GPU (for example `RTX 4090`).
    pub gpu_name: String,
    /// GPU memory in gigabytes.
    pub vram_gb: f64,
    /// Hourly price in USD.
    pub price_per_hour: f64,
    /// Host reliability score in `[0, 1]`.
    pub reliability: f64,
    /// Availability class of the capacity.
    pub availability: AvailabilityClass,
    /// Number of GPUs bundled in the offer.
    pub num_gpus: u32,
    /// Disk space available to the instance, when reported.
    pub disk_gb: Option<f64>,
    /// Highest CUDA version supported by the host driver, when reported.
    pub driver_version: Option<f64>,
}

/// Filters applied when querying offers.
#[derive(Clone, Debug, PartialEq)]
pub struct OfferQuery {
    /// Minimum GPU memory in gigabytes.
    pub min_vram_gb: f64,
    /// Minimum host reliability score.
    pub min_reliability: f64,
    /// Minimum disk space in gigabytes.
    pub min_disk_gb: f64,
    /// Minimum CUDA version supported by the host driver.
    pub min_driver_version: f64,
}

impl Default for OfferQuery {
    fn default() -> Self {
        Self {
            min_vram_gb: 8.0,
            min_reliability: 0.9,
            min_disk_gb: 20.0,
            min_driver_version: 11.0,
        }
    }
}

/// Parameters required to create an instance from an accepted offer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Offer to accept.
    pub offer_id: String,
    /// Container image reference booted on the instance.
    pub image: String,
    /// Disk size in gigabytes.
    pub disk_gb: u32,
    /// Human readable label attached to the instance.
    pub label: String,
    /// Container port exposed by the separation service.
    pub service_port: u16,
}

impl InstanceSpec {
    /// Starts a builder for an [`InstanceSpec`].
    #[must_use]
    pub fn builder() -> InstanceSpecBuilder {
        InstanceSpecBuilder::new()
    }

    /// Returns a copy of the instance spec targeting a different offer.
    #[must_use]
    pub fn for_offer(&self, offer_id: &str) -> Self {
        Self {
            offer_id: offer_id.to_owned(),
            ..self.clone()
        }
    }

    /// Returns a copy of the instance spec carrying a different label.
    #[must_use]
    pub fn with_label(&self, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..self.clone()
        }
    }

    /// Validates the instance spec, returning the first missing field.
    ///
    /// The offer identifier may be empty: the provisioning loop fills it in
    /// per attempt.
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] when the image or label is empty,
    /// the disk size is zero, or the service port is zero.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.image.is_empty() {
            return Err(SpecError::Validation("image".to_owned()));
        }
        if self.label.is_empty() {
            return Err(SpecError::Validation("label".to_owned()));
        }
        if self.disk_gb == 0 {
            return Err(SpecError::Validation("disk_gb".to_owned()));
        }
        if self.service_port == 0 {
            return Err(SpecError::Validation("service_port".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`InstanceSpec`] that trims inputs and validates on build.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpecBuilder {
    offer_id: String,
    image: String,
    disk_gb: u32,
    label: String,
    service_port: u16,
}

impl InstanceSpecBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the offer identifier.
    #[must_use]
    pub fn offer_id(mut self, value: impl Into<String>) -> Self {
        self.offer_id = value.into();
        self
    }

    /// Sets the container image.
    #[must_use]
    pub fn image(mut self, value: impl Into<String>) -> Self {
        self.image = value.into();
        self
    }

    /// Sets the disk size in gigabytes.
    #[must_use]
    pub const fn disk_gb(mut self, value: u32) -> Self {
        self.disk_gb = value;
        self
    }

    /// Sets the instance label.
    #[must_use]
    pub fn label(mut self, value: impl Into<String>) -> Self {
        self.label = value.into();
        self
    }

    /// Sets the service port exposed by the container.
    #[must_use]
    pub const fn service_port(mut self, value: u16) -> Self {
        self.service_port = value;
        self
    }

    /// Builds and validates the [`InstanceSpec`].
    ///
    /// # Errors
    ///
    /// Returns [`SpecError::Validation`] when a required field is empty.
    pub fn build(self) -> Result<InstanceSpec, SpecError> {
        let spec = InstanceSpec {
            offer_id: self.offer_id.trim().to_owned(),
            image: self.image.trim().to_owned(),
            disk_gb: self.disk_gb,
            label: self.label.trim().to_owned(),
            service_port: self.service_port,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Lifecycle state of a rented instance as seen through the gateway.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    /// Scheduled or booting.
    Creating,
    /// Running; the service may still be initialising.
    Running,
    /// The host stopped reporting.
    Unreachable,
    /// The instance no longer exists.
    Destroyed,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Reachable address of the separation service.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    /// Public host name or address.
    pub host: String,
    /// Public TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns the `http://host:port` base URL.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One entry of an instance's dynamic port mapping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortMapping {
    /// Port inside the container.
    pub private_port: u16,
    /// Public port assigned by the provider.
    pub public_port: u16,
    /// Public address for this mapping when it differs from the instance's.
    pub host: Option<String>,
}

/// Point-in-time view of an instance.
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceSnapshot {
    /// Provider specific identifier.
    pub id: String,
    /// Current lifecycle state.
    pub status: InstanceStatus,
    /// Public address of the host, when assigned.
    pub public_host: Option<String>,
    /// Ports published so far.
    pub ports: Vec<PortMapping>,
    /// Hourly cost, when reported.
    pub cost_per_hour: Option<f64>,
}

impl InstanceSnapshot {
    /// Resolves the public endpoint for a container port.
    ///
    /// Returns `None` until the provider has published a mapping with a
    /// usable address.
    #[must_use]
    pub fn endpoint_for(&self, private_port: u16) -> Option<Endpoint> {
        let mapping = self
            .ports
            .iter()
            .find(|mapping| mapping.private_port == private_port && mapping.public_port != 0)?;
        let host = mapping
            .host
            .as_deref()
            .filter(|host| !host.is_empty() && *host != "0.0.0.0")
            .or(self.public_host.as_deref())
            .filter(|host| !host.is_empty())?;
        Some(Endpoint::new(host, mapping.public_port))
    }
}

/// Errors raised while validating marketplace inputs.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SpecError {
    /// Raised when a spec is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Classifies gateway failures for the provisioning fallback.
pub trait Classify {
    /// Returns `true` when the failure is specific to one offer that is no
    /// longer available, so trying the next offer may succeed.
    fn is_capacity_unavailable(&self) -> bool;
}

/// Returns `true` when a provider message reads like an offer-specific
/// capacity failure.
#[must_use]
pub fn looks_like_capacity_message(message: &str) -> bool {
    const MARKERS: [&str; 7] = [
        "no longer available",
        "no longer any",
        "not available",
        "not have the resources",
        "insufficient resources",
        "no_such_ask",
        "already rented",
    ];
    let lowered = message.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Future returned by marketplace operations.
pub type MarketFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Operations every GPU marketplace provider exposes.
pub trait Marketplace {
    /// Provider specific error type.
    type Error: std::error::Error + Classify + Send + Sync + 'static;

    /// Lists offers matching the query.
    fn search_offers<'a>(&'a self, query: &'a OfferQuery)
    -> MarketFuture<'a, Vec<Offer>, Self::Error>;

    /// Accepts an offer and returns the new instance identifier.
    fn create_instance<'a>(&'a self, spec: &'a InstanceSpec)
    -> MarketFuture<'a, String, Self::Error>;

    /// Fetches the current state of an instance.
    ///
    /// Instances the provider no longer knows about are reported with
    /// [`InstanceStatus::Destroyed`] rather than an error.
    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> MarketFuture<'a, InstanceSnapshot, Self::Error>;

    /// Destroys an instance. Destroying an instance that is already gone
    /// succeeds.
    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> MarketFuture<'a, (), Self::Error>;
}
