//! RunPod implementation of the marketplace gateway.
//!
//! RunPod sells GPU types rather than individual host offers, so each GPU
//! type becomes one [`Offer`] whose id is the RunPod GPU type id. RunPod
//! publishes no per-host reliability score; offers report `1.0`.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};

use crate::marketplace::{
    AvailabilityClass, Classify, InstanceSnapshot, InstanceSpec, InstanceStatus, MarketFuture,
    Marketplace, Offer, OfferQuery, PortMapping, SpecError, looks_like_capacity_message,
};

/// Public RunPod GraphQL endpoint.
pub const DEFAULT_GRAPHQL_URL: &str = "https://api.runpod.io/graphql";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const GPU_TYPES_QUERY: &str = "query GpuTypes { gpuTypes { id displayName memoryInGb \
     secureCloud communityCloud lowestPrice(input: {gpuCount: 1}) { minimumBidPrice \
     uninterruptablePrice } } }";

const CREATE_POD_MUTATION: &str = "mutation CreatePod($input: PodFindAndDeployOnDemandInput!) \
     { podFindAndDeployOnDemand(input: $input) { id desiredStatus costPerHr } }";

const POD_QUERY: &str = "query Pod($podId: String!) { pod(input: { podId: $podId }) { id \
     desiredStatus costPerHr runtime { uptimeInSeconds ports { ip isIpPublic privatePort \
     publicPort type } } } }";

const TERMINATE_MUTATION: &str =
    "mutation TerminatePod($podId: String!) { podTerminate(input: { podId: $podId }) }";

/// Errors raised by the RunPod gateway.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunPodError {
    /// Raised when the gateway is misconfigured.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when a create request is missing a required field.
    #[error("invalid instance spec: {0}")]
    Validation(String),
    /// Raised when no host currently has the requested GPU type free.
    #[error("GPU type {gpu_type} unavailable: {message}")]
    CapacityUnavailable {
        /// GPU type that could not be deployed.
        gpu_type: String,
        /// Message returned by the API.
        message: String,
    },
    /// Raised when the request never produced a response.
    #[error("request to RunPod failed: {message}")]
    Transport {
        /// Description of the transport failure.
        message: String,
    },
    /// Raised when the API answers with an HTTP error or GraphQL errors.
    #[error("RunPod returned an error: {message}")]
    Api {
        /// Message returned by the API.
        message: String,
    },
    /// Raised when a response body cannot be decoded.
    #[error("malformed RunPod response: {message}")]
    Malformed {
        /// Description of the decoding failure.
        message: String,
    },
}

impl Classify for RunPodError {
    fn is_capacity_unavailable(&self) -> bool {
        matches!(self, Self::CapacityUnavailable { .. })
    }
}

impl From<reqwest::Error> for RunPodError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

impl From<SpecError> for RunPodError {
    fn from(value: SpecError) -> Self {
        match value {
            SpecError::Validation(field) => Self::Validation(field),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuTypesData {
    gpu_types: Vec<GpuType>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GpuType {
    id: String,
    display_name: Option<String>,
    #[serde(default)]
    memory_in_gb: f64,
    #[serde(default)]
    secure_cloud: bool,
    #[serde(default)]
    community_cloud: bool,
    lowest_price: Option<LowestPrice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LowestPrice {
    minimum_bid_price: Option<f64>,
    uninterruptable_price: Option<f64>,
}

impl GpuType {
    fn into_offer(self) -> Offer {
        let price = self
            .lowest_price
            .and_then(|price| price.minimum_bid_price.or(price.uninterruptable_price))
            .unwrap_or(f64::NAN);
        let availability = if self.secure_cloud {
            AvailabilityClass::Secure
        } else if self.community_cloud {
            AvailabilityClass::Community
        } else {
            AvailabilityClass::None
        };
        Offer {
            gpu_name: self.display_name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            vram_gb: self.memory_in_gb,
            price_per_hour: price,
            reliability: 1.0,
            availability,
            num_gpus: 1,
            disk_gb: None,
            driver_version: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePodData {
    pod_find_and_deploy_on_demand: Option<PodSummary>,
}

#[derive(Debug, Deserialize)]
struct PodSummary {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PodData {
    pod: Option<Pod>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pod {
    #[serde(default)]
    desired_status: Option<String>,
    #[serde(default)]
    cost_per_hr: Option<f64>,
    #[serde(default)]
    runtime: Option<PodRuntime>,
}

#[derive(Debug, Deserialize)]
struct PodRuntime {
    #[serde(default)]
    ports: Option<Vec<PodPort>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodPort {
    ip: Option<String>,
    #[serde(default)]
    is_ip_public: bool,
    private_port: u16,
    public_port: Option<u16>,
}

impl Pod {
    fn into_snapshot(self, id: &str) -> InstanceSnapshot {
        let status = match self.desired_status.as_deref() {
            Some("RUNNING") => InstanceStatus::Running,
            Some("TERMINATED") => InstanceStatus::Destroyed,
            Some("EXITED") => InstanceStatus::Unreachable,
            _ => InstanceStatus::Creating,
        };
        let mut ports: Vec<PodPort> = self
            .runtime
            .and_then(|runtime| runtime.ports)
            .unwrap_or_default();
        ports.sort_by_key(|port| !port.is_ip_public);
        InstanceSnapshot {
            id: id.to_owned(),
            status,
            public_host: None,
            ports: ports
                .into_iter()
                .filter_map(|port| {
                    Some(PortMapping {
                        private_port: port.private_port,
                        public_port: port.public_port?,
                        host: port.ip.filter(|ip| !ip.is_empty()),
                    })
                })
                .collect(),
            cost_per_hour: self.cost_per_hr,
        }
    }
}

/// Gateway talking to the RunPod GraphQL API.
#[derive(Clone, Debug)]
pub struct RunPodGateway {
    client: Client,
    api_key: String,
    url: String,
}

impl RunPodGateway {
    /// Creates a gateway against the public API.
    ///
    /// # Errors
    ///
    /// Returns [`RunPodError::Config`] when the API key is blank and
    /// [`RunPodError::Transport`] when the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, RunPodError> {
        Self::with_url(api_key, DEFAULT_GRAPHQL_URL)
    }

    /// Creates a gateway against an explicit GraphQL endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`RunPodError::Config`] when the API key is blank and
    /// [`RunPodError::Transport`] when the HTTP client cannot be built.
    pub fn with_url(
        api_key: impl Into<String>,
        url: impl Into<String>,
    ) -> Result<Self, RunPodError> {
        let key = api_key.into();
        if key.trim().is_empty() {
            return Err(RunPodError::Config(String::from("RunPod API key is empty")));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: key,
            url: url.into(),
        })
    }

    /// Executes a GraphQL document, returning data or the joined error
    /// messages.
    async fn execute<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<Result<T, String>, RunPodError> {
        debug!(url = %self.url, "RunPod GraphQL request");
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(RunPodError::Api {
                message: format!("HTTP {}: {}", status.as_u16(), String::from_utf8_lossy(&bytes)),
            });
        }
        let parsed: GraphQlResponse<T> =
            serde_json::from_slice(&bytes).map_err(|err| RunPodError::Malformed {
                message: err.to_string(),
            })?;
        if !parsed.errors.is_empty() {
            let joined = parsed
                .errors
                .into_iter()
                .map(|err| err.message)
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(Err(joined));
        }
        parsed.data.map(Ok).ok_or_else(|| RunPodError::Malformed {
            message: String::from("response carried neither data nor errors"),
        })
    }

    async fn search(&self, query: &OfferQuery) -> Result<Vec<Offer>, RunPodError> {
        let data: GpuTypesData = self
            .execute(GPU_TYPES_QUERY, json!({}))
            .await?
            .map_err(|message| RunPodError::Api { message })?;
        let offers: Vec<Offer> = data
            .gpu_types
            .into_iter()
            .filter(|gpu| gpu.memory_in_gb >= query.min_vram_gb)
            .map(GpuType::into_offer)
            .collect();
        info!(count = offers.len(), "RunPod GPU types retrieved");
        Ok(offers)
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, RunPodError> {
        spec.validate()?;
        let variables = json!({
            "input": {
                "cloudType": "ALL",
                "gpuCount": 1,
                "gpuTypeId": spec.offer_id,
                "name": spec.label,
                "imageName": spec.image,
                "containerDiskInGb": spec.disk_gb,
                "volumeInGb": 0,
                "ports": format!("{}/http", spec.service_port),
                "startSsh": false,
            }
        });
        let capacity = |message: String| RunPodError::CapacityUnavailable {
            gpu_type: spec.offer_id.clone(),
            message,
        };
        match self
            .execute::<CreatePodData>(CREATE_POD_MUTATION, variables)
            .await?
        {
            Ok(data) => data
                .pod_find_and_deploy_on_demand
                .map(|pod| pod.id)
                .ok_or_else(|| capacity(String::from("no pod returned"))),
            Err(message) if looks_like_capacity_message(&message) => Err(capacity(message)),
            Err(message) => Err(RunPodError::Api { message }),
        }
    }

    async fn fetch(&self, pod_id: &str) -> Result<InstanceSnapshot, RunPodError> {
        let data: PodData = self
            .execute(POD_QUERY, json!({"podId": pod_id}))
            .await?
            .map_err(|message| RunPodError::Api { message })?;
        Ok(data.pod.map_or_else(
            || InstanceSnapshot {
                id: pod_id.to_owned(),
                status: InstanceStatus::Destroyed,
                public_host: None,
                ports: Vec::new(),
                cost_per_hour: None,
            },
            |pod| pod.into_snapshot(pod_id),
        ))
    }

    async fn destroy(&self, pod_id: &str) -> Result<(), RunPodError> {
        match self
            .execute::<Value>(TERMINATE_MUTATION, json!({"podId": pod_id}))
            .await?
        {
            Ok(_) => Ok(()),
            Err(message) if is_missing_pod(&message) => {
                debug!(%pod_id, "pod already gone");
                Ok(())
            }
            Err(message) => Err(RunPodError::Api { message }),
        }
    }
}

fn is_missing_pod(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("not found") || lowered.contains("does not exist")
}

impl Marketplace for RunPodGateway {
    type Error = RunPodError;

    fn search_offers<'a>(
        &'a self,
        query: &'a OfferQuery,
    ) -> MarketFuture<'a, Vec<Offer>, Self::Error> {
        Box::pin(self.search(query))
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> MarketFuture<'a, String, Self::Error> {
        Box::pin(self.create(spec))
    }

    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> MarketFuture<'a, InstanceSnapshot, Self::Error> {
        Box::pin(self.fetch(instance_id))
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> MarketFuture<'a, (), Self::Error> {
        Box::pin(self.destroy(instance_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn gpu_type_prefers_bid_price() {
        let gpu: GpuType = serde_json::from_value(json!({
            "id": "NVIDIA GeForce RTX 3090",
            "displayName": "RTX 3090",
            "memoryInGb": 24,
            "secureCloud": false,
            "communityCloud": true,
            "lowestPrice": {"minimumBidPrice": 0.11, "uninterruptablePrice": 0.22}
        }))
        .expect("gpu type");
        let offer = gpu.into_offer();
        assert_eq!(offer.id, "NVIDIA GeForce RTX 3090");
        assert_eq!(offer.gpu_name, "RTX 3090");
        assert_eq!(offer.price_per_hour.to_bits(), 0.11_f64.to_bits());
        assert_eq!(offer.availability, AvailabilityClass::Community);
    }

    #[rstest]
    fn pod_ports_prefer_public_addresses() {
        let pod: Pod = serde_json::from_value(json!({
            "desiredStatus": "RUNNING",
            "costPerHr": 0.3,
            "runtime": {"ports": [
                {"ip": "10.0.0.2", "isIpPublic": false, "privatePort": 8185, "publicPort": 8185, "type": "http"},
                {"ip": "194.0.0.9", "isIpPublic": true, "privatePort": 8185, "publicPort": 40001, "type": "tcp"}
            ]}
        }))
        .expect("pod");
        let snap = pod.into_snapshot("pod-1");
        assert_eq!(snap.status, InstanceStatus::Running);
        assert_eq!(
            snap.endpoint_for(8185),
            Some(crate::marketplace::Endpoint::new("194.0.0.9", 40001))
        );
    }

    #[rstest]
    #[case("There are no longer any instances available with the requested specifications", true)]
    #[case("This machine does not have the resources to deploy your pod", true)]
    #[case("Unauthorized", false)]
    fn capacity_messages_are_classified(#[case] message: &str, #[case] capacity: bool) {
        assert_eq!(looks_like_capacity_message(message), capacity);
    }
}
