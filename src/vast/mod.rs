//! Vast.ai implementation of the marketplace gateway.

mod error;
mod types;

use std::time::Duration;

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

use crate::marketplace::{
    InstanceSnapshot, InstanceSpec, InstanceStatus, MarketFuture, Marketplace, Offer, OfferQuery,
    looks_like_capacity_message,
};
use types::{
    BundleResponse, CreatePayload, CreateResponse, ErrorBody, InstanceEnvelope, InstancesField,
    gb_to_mb,
};

pub use error::VastError;

/// Public Vast.ai API root.
pub const DEFAULT_BASE_URL: &str = "https://console.vast.ai/api/v0";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway talking to the Vast.ai REST API.
#[derive(Clone, Debug)]
pub struct VastGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl VastGateway {
    /// Creates a gateway against the public API.
    ///
    /// # Errors
    ///
    /// Returns [`VastError::Config`] when the API key is blank and
    /// [`VastError::Transport`] when the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, VastError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Creates a gateway against an explicit API root.
    ///
    /// # Errors
    ///
    /// Returns [`VastError::Config`] when the API key is blank and
    /// [`VastError::Transport`] when the HTTP client cannot be built.
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, VastError> {
        let key = api_key.into();
        if key.trim().is_empty() {
            return Err(VastError::Config(String::from("Vast.ai API key is empty")));
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_key: key,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, %url, "Vast.ai request");
        self.client
            .request(method, url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, VastError> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| VastError::Malformed {
            message: err.to_string(),
        })
    }

    async fn api_error(response: Response) -> VastError {
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = match (body.error, body.msg) {
            (Some(error), Some(msg)) => format!("{error}: {msg}"),
            (Some(single), None) | (None, Some(single)) => single,
            (None, None) => text,
        };
        VastError::Api { status, message }
    }

    async fn search(&self, query: &OfferQuery) -> Result<Vec<Offer>, VastError> {
        let filter = json!({
            "verified": {"eq": true},
            "external": {"eq": false},
            "rentable": {"eq": true},
            "gpu_ram": {"gte": gb_to_mb(query.min_vram_gb)},
            "disk_space": {"gte": query.min_disk_gb},
            "cuda_max_good": {"gte": query.min_driver_version},
            "reliability2": {"gte": query.min_reliability},
            "order": [["dph_total", "asc"]],
            "type": "on-demand",
        });
        let response = self
            .request(Method::GET, "/bundles/")
            .query(&[("q", filter.to_string())])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let bundles: BundleResponse = Self::decode(response).await?;
        let offers: Vec<Offer> = bundles
            .offers
            .into_iter()
            .map(types::BundleOffer::into_offer)
            .collect();
        info!(count = offers.len(), "Vast.ai offers retrieved");
        Ok(offers)
    }

    async fn create(&self, spec: &InstanceSpec) -> Result<String, VastError> {
        spec.validate()?;
        let response = self
            .request(Method::PUT, &format!("/asks/{}/", spec.offer_id))
            .json(&CreatePayload::from_spec(spec))
            .send()
            .await?;
        let capacity = |message: String| VastError::CapacityUnavailable {
            offer_id: spec.offer_id.clone(),
            message,
        };
        if !response.status().is_success() {
            return Err(match Self::api_error(response).await {
                VastError::Api { status, message }
                    if may_signal_capacity(status) && looks_like_capacity_message(&message) =>
                {
                    capacity(message)
                }
                other => other,
            });
        }
        let created: CreateResponse = Self::decode(response).await?;
        match created.new_contract {
            Some(contract) if created.success => Ok(contract.to_string()),
            _ => {
                let message = created.message();
                if looks_like_capacity_message(&message) {
                    Err(capacity(message))
                } else {
                    Err(VastError::Api {
                        status: StatusCode::OK.as_u16(),
                        message: format!("instance not created: {message}"),
                    })
                }
            }
        }
    }

    async fn fetch(&self, instance_id: &str) -> Result<InstanceSnapshot, VastError> {
        let response = self
            .request(Method::GET, &format!("/instances/{instance_id}/"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(gone(instance_id));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        let envelope: InstanceEnvelope = Self::decode(response).await?;
        Ok(envelope
            .instances
            .and_then(InstancesField::into_first)
            .map_or_else(|| gone(instance_id), |found| found.into_snapshot(instance_id)))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), VastError> {
        let response = self
            .request(Method::DELETE, &format!("/instances/{instance_id}/"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(%instance_id, "instance already gone");
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }
        Ok(())
    }
}

/// Authentication, permission, and server failures are never offer specific.
const fn may_signal_capacity(status: u16) -> bool {
    !matches!(status, 401 | 403) && status < 500
}

fn gone(instance_id: &str) -> InstanceSnapshot {
    InstanceSnapshot {
        id: instance_id.to_owned(),
        status: InstanceStatus::Destroyed,
        public_host: None,
        ports: Vec::new(),
        cost_per_hour: None,
    }
}

impl Marketplace for VastGateway {
    type Error = VastError;

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
