//! Runtime choice between the supported marketplaces.
//!
//! The binaries pick a provider from configuration; [`ProviderGateway`]
//! forwards every [`Marketplace`] call to the selected client so the
//! orchestration code stays monomorphic.

use thiserror::Error;

use crate::config::{ConfigError, Provider, StemrigConfig};
use crate::marketplace::{
    Classify, InstanceSnapshot, InstanceSpec, MarketFuture, Marketplace, Offer, OfferQuery,
};
use crate::runpod::{DEFAULT_GRAPHQL_URL, RunPodError, RunPodGateway};
use crate::vast::{DEFAULT_BASE_URL, VastError, VastGateway};

/// Errors raised by whichever gateway is active.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GatewayError {
    /// Vast.ai failure.
    #[error(transparent)]
    Vast(#[from] VastError),
    /// RunPod failure.
    #[error(transparent)]
    RunPod(#[from] RunPodError),
    /// The gateway could not be configured.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Classify for GatewayError {
    fn is_capacity_unavailable(&self) -> bool {
        match self {
            Self::Vast(err) => err.is_capacity_unavailable(),
            Self::RunPod(err) => err.is_capacity_unavailable(),
            Self::Config(_) => false,
        }
    }
}

/// Marketplace client selected at runtime.
#[derive(Clone, Debug)]
pub enum ProviderGateway {
    /// Vast.ai REST client.
    Vast(VastGateway),
    /// RunPod GraphQL client.
    RunPod(RunPodGateway),
}

impl ProviderGateway {
    /// Builds the gateway named by `config`, resolving its API key.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the provider or key is missing
    /// or invalid, and the provider error when the client cannot be built.
    pub fn from_config(config: &StemrigConfig) -> Result<Self, GatewayError> {
        let api_key = config.resolve_api_key()?;
        let url = config.api_url.as_deref();
        match config.provider()? {
            Provider::Vast => Ok(Self::Vast(VastGateway::with_base_url(
                api_key,
                url.unwrap_or(DEFAULT_BASE_URL),
            )?)),
            Provider::RunPod => Ok(Self::RunPod(RunPodGateway::with_url(
                api_key,
                url.unwrap_or(DEFAULT_GRAPHQL_URL),
            )?)),
        }
    }

    /// Provider behind this gateway.
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::Vast(_) => Provider::Vast,
            Self::RunPod(_) => Provider::RunPod,
        }
    }
}

impl Marketplace for ProviderGateway {
    type Error = GatewayError;

    fn search_offers<'a>(
        &'a self,
        query: &'a OfferQuery,
    ) -> MarketFuture<'a, Vec<Offer>, Self::Error> {
        Box::pin(async move {
            match self {
                Self::Vast(gateway) => Ok(gateway.search_offers(query).await?),
                Self::RunPod(gateway) => Ok(gateway.search_offers(query).await?),
            }
        })
    }

    fn create_instance<'a>(
        &'a self,
        spec: &'a InstanceSpec,
    ) -> MarketFuture<'a, String, Self::Error> {
        Box::pin(async move {
            match self {
                Self::Vast(gateway) => Ok(gateway.create_instance(spec).await?),
                Self::RunPod(gateway) => Ok(gateway.create_instance(spec).await?),
            }
        })
    }

    fn get_instance<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> MarketFuture<'a, InstanceSnapshot, Self::Error> {
        Box::pin(async move {
            match self {
                Self::Vast(gateway) => Ok(gateway.get_instance(instance_id).await?),
                Self::RunPod(gateway) => Ok(gateway.get_instance(instance_id).await?),
            }
        })
    }

    fn destroy_instance<'a>(&'a self, instance_id: &'a str) -> MarketFuture<'a, (), Self::Error> {
        Box::pin(async move {
            match self {
                Self::Vast(gateway) => Ok(gateway.destroy_instance(instance_id).await?),
                Self::RunPod(gateway) => Ok(gateway.destroy_instance(instance_id).await?),
            }
        })
    }
}
