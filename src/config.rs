//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, `stemrig.toml` (or the file named by
//! `STEMRIG_CONFIG_PATH`) and `STEMRIG_*` environment variables. The
//! marketplace credential additionally falls back to the provider's own
//! variable (`VASTAI_API_KEY` or `RUNPOD_API_KEY`).

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::fleet::FleetSettings;
use crate::job::AwaitOptions;
use crate::marketplace::{InstanceSpec, OfferQuery};
use crate::poll::PollPolicy;
use crate::ranking::{DEFAULT_PREFERRED_WINDOW, RankingPolicy};
use crate::registry::{DEFAULT_REGISTRY_FILE, InstanceRegistry};
use crate::run::RunSettings;

/// Container image running the separation service.
pub const DEFAULT_IMAGE: &str = "ghcr.io/cyrille8000/ffmpeg-demucs-vast-template:latest";

/// Port the separation service listens on inside the container.
pub const DEFAULT_SERVICE_PORT: u16 = 8185;

/// Supported GPU marketplaces.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
    /// Vast.ai REST API.
    Vast,
    /// RunPod GraphQL API.
    RunPod,
}

impl Provider {
    /// Provider specific environment variable holding the API key.
    #[must_use]
    pub const fn api_key_env(self) -> &'static str {
        match self {
            Self::Vast => "VASTAI_API_KEY",
            Self::RunPod => "RUNPOD_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vast => f.write_str("vast"),
            Self::RunPod => f.write_str("runpod"),
        }
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vast" | "vastai" | "vast.ai" => Ok(Self::Vast),
            "runpod" => Ok(Self::RunPod),
            other => Err(ConfigError::Invalid(format!(
                "unknown provider '{other}': set STEMRIG_PROVIDER or provider in \
                 [stemrig] in stemrig.toml to 'vast' or 'runpod'"
            ))),
        }
    }
}

/// Orchestrator settings derived from configuration files and environment
/// variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(
    prefix = "STEMRIG",
    discovery(
        app_name = "stemrig",
        env_var = "STEMRIG_CONFIG_PATH",
        config_file_name = "stemrig.toml",
        dotfile_name = ".stemrig.toml",
        project_file_name = "stemrig.toml"
    )
)]
pub struct StemrigConfig {
    /// Marketplace to rent from: `vast` or `runpod`.
    #[ortho_config(default = "vast".to_owned())]
    pub provider: String,
    /// Marketplace API key. Falls back to the provider's own variable.
    pub api_key: Option<String>,
    /// Override for the marketplace API base URL.
    pub api_url: Option<String>,
    /// Container image booted on rented instances.
    #[ortho_config(default = DEFAULT_IMAGE.to_owned())]
    pub image: String,
    /// Container disk size in gigabytes.
    #[ortho_config(default = 20)]
    pub disk_gb: u32,
    /// Port the separation service listens on.
    #[ortho_config(default = DEFAULT_SERVICE_PORT)]
    pub service_port: u16,
    /// Minimum GPU memory in gigabytes.
    #[ortho_config(default = 8.0)]
    pub min_vram_gb: f64,
    /// Minimum host reliability score between 0 and 1.
    #[ortho_config(default = 0.9)]
    pub min_reliability: f64,
    /// Minimum host disk space in gigabytes.
    #[ortho_config(default = 20.0)]
    pub min_disk_gb: f64,
    /// Minimum CUDA version supported by the host driver.
    #[ortho_config(default = 11.0)]
    pub min_driver_version: f64,
    /// Number of ranked offers tried for a single run.
    #[ortho_config(default = 5)]
    pub max_offers: usize,
    /// Comma separated GPU models preferred over cheaper offers.
    pub preferred_gpus: Option<String>,
    /// Prefix for instance labels.
    #[ortho_config(default = "stemrig".to_owned())]
    pub label_prefix: String,
    /// Seconds to wait for an instance to serve `/health`.
    #[ortho_config(default = 600)]
    pub ready_timeout_secs: u64,
    /// Seconds between readiness checks.
    #[ortho_config(default = 10)]
    pub ready_interval_secs: u64,
    /// Wait for `/status` to report loaded models before submitting.
    #[ortho_config(default = true)]
    pub wait_for_models: bool,
    /// Seconds to wait for models to load.
    #[ortho_config(default = 300)]
    pub model_timeout_secs: u64,
    /// Seconds between model checks.
    #[ortho_config(default = 5)]
    pub model_interval_secs: u64,
    /// Seconds to wait for a job to finish.
    #[ortho_config(default = 1800)]
    pub job_timeout_secs: u64,
    /// Seconds between job status polls.
    #[ortho_config(default = 5)]
    pub job_interval_secs: u64,
    /// Stream remote job logs while waiting.
    #[ortho_config(default = true)]
    pub stream_logs: bool,
    /// Location of the fleet instance registry.
    #[ortho_config(default = DEFAULT_REGISTRY_FILE.to_owned())]
    pub registry_path: String,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to [stemrig] in stemrig.toml",
            self.env_var, self.toml_key
        )
    }
}

impl StemrigConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("stemrig")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Parses the configured provider.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unknown provider name.
    pub fn provider(&self) -> Result<Provider, ConfigError> {
        self.provider.parse()
    }

    /// Returns the API key, consulting the provider variable when unset.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming both variables when no
    /// key is available.
    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        self.resolve_api_key_with(|name| env::var(name).ok())
    }

    /// Same as [`Self::resolve_api_key`] with an explicit variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no key is available.
    pub fn resolve_api_key_with<F>(&self, lookup: F) -> Result<String, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let provider = self.provider()?;
        let configured = self
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_owned);
        configured
            .or_else(|| {
                lookup(provider.api_key_env())
                    .map(|key| key.trim().to_owned())
                    .filter(|key| !key.is_empty())
            })
            .ok_or_else(|| {
                ConfigError::MissingField(format!(
                    "missing {provider} API key: set STEMRIG_API_KEY or {} or add api_key \
                     to [stemrig] in stemrig.toml",
                    provider.api_key_env()
                ))
            })
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide values via environment variables or configuration files.
    ///
    /// The API key is checked separately by [`Self::resolve_api_key`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.provider()?;
        Self::require_field(
            &self.image,
            &FieldMetadata::new("container image", "STEMRIG_IMAGE", "image"),
        )?;
        Self::require_field(
            &self.label_prefix,
            &FieldMetadata::new("instance label prefix", "STEMRIG_LABEL_PREFIX", "label_prefix"),
        )?;
        Self::require_field(
            &self.registry_path,
            &FieldMetadata::new("registry path", "STEMRIG_REGISTRY_PATH", "registry_path"),
        )?;
        Self::require_positive(
            u64::from(self.disk_gb),
            &FieldMetadata::new("disk size", "STEMRIG_DISK_GB", "disk_gb"),
        )?;
        Self::require_positive(
            u64::from(self.service_port),
            &FieldMetadata::new("service port", "STEMRIG_SERVICE_PORT", "service_port"),
        )?;
        Self::require_positive(
            u64::try_from(self.max_offers).unwrap_or(u64::MAX),
            &FieldMetadata::new("offer count", "STEMRIG_MAX_OFFERS", "max_offers"),
        )?;
        for (value, metadata) in [
            (
                self.ready_interval_secs,
                FieldMetadata::new(
                    "readiness interval",
                    "STEMRIG_READY_INTERVAL_SECS",
                    "ready_interval_secs",
                ),
            ),
            (
                self.model_interval_secs,
                FieldMetadata::new(
                    "model interval",
                    "STEMRIG_MODEL_INTERVAL_SECS",
                    "model_interval_secs",
                ),
            ),
            (
                self.job_interval_secs,
                FieldMetadata::new("job interval", "STEMRIG_JOB_INTERVAL_SECS", "job_interval_secs"),
            ),
        ] {
            Self::require_positive(value, &metadata)?;
        }
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return Err(ConfigError::Invalid(format!(
                "minimum reliability must lie between 0 and 1: {}",
                FieldMetadata::new("", "STEMRIG_MIN_RELIABILITY", "min_reliability").hint()
            )));
        }
        Ok(())
    }

    /// Marketplace search filters.
    #[must_use]
    pub const fn offer_query(&self) -> OfferQuery {
        OfferQuery {
            min_vram_gb: self.min_vram_gb,
            min_reliability: self.min_reliability,
            min_disk_gb: self.min_disk_gb,
            min_driver_version: self.min_driver_version,
        }
    }

    /// Ranking policy truncated to `max_results`.
    #[must_use]
    pub fn ranking_policy(&self, max_results: usize) -> RankingPolicy {
        let defaults = RankingPolicy::default();
        let preferred = self.preferred_gpus.as_deref().map_or(defaults.preferred, |list| {
            list.split(',')
                .map(str::trim)
                .filter(|model| !model.is_empty())
                .map(str::to_owned)
                .collect()
        });
        RankingPolicy {
            preferred,
            min_vram_gb: self.min_vram_gb,
            min_reliability: self.min_reliability,
            max_results,
            preferred_window: DEFAULT_PREFERRED_WINDOW,
        }
    }

    /// Instance template labelled `label`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the template is incomplete.
    pub fn instance_template(&self, label: &str) -> Result<InstanceSpec, ConfigError> {
        InstanceSpec::builder()
            .image(&self.image)
            .disk_gb(self.disk_gb)
            .label(label)
            .service_port(self.service_port)
            .build()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Settings for a single run, labelled with a fresh random suffix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn run_settings(&self) -> Result<RunSettings, ConfigError> {
        self.validate()?;
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let template = self.instance_template(&format!("{}-{suffix}", self.label_prefix))?;
        Ok(RunSettings {
            query: self.offer_query(),
            ranking: self.ranking_policy(self.max_offers),
            template,
            readiness: PollPolicy::new(
                Duration::from_secs(self.ready_interval_secs),
                Duration::from_secs(self.ready_timeout_secs),
            ),
            models: self.wait_for_models.then(|| {
                PollPolicy::new(
                    Duration::from_secs(self.model_interval_secs),
                    Duration::from_secs(self.model_timeout_secs),
                )
            }),
            job: AwaitOptions {
                policy: PollPolicy::new(
                    Duration::from_secs(self.job_interval_secs),
                    Duration::from_secs(self.job_timeout_secs),
                ),
                stream_logs: self.stream_logs,
            },
        })
    }

    /// Settings for a fleet launch. Labels get a `-fleet` suffix on the
    /// configured prefix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when validation fails.
    pub fn fleet_settings(&self) -> Result<FleetSettings, ConfigError> {
        self.validate()?;
        let label_prefix = format!("{}-fleet", self.label_prefix);
        let template = self.instance_template(&label_prefix)?;
        let defaults = FleetSettings::new(template);
        Ok(FleetSettings {
            query: self.offer_query(),
            ranking: self.ranking_policy(defaults.ranking.max_results),
            label_prefix,
            ..defaults
        })
    }

    /// Registry at the configured path.
    #[must_use]
    pub fn registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(Utf8PathBuf::from(self.registry_path.trim()))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is out of range or unrecognised.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for provider parsing and derived settings.

    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> StemrigConfig {
        StemrigConfig {
            provider: String::from("vast"),
            api_key: None,
            api_url: None,
            image: String::from(DEFAULT_IMAGE),
            disk_gb: 20,
            service_port: DEFAULT_SERVICE_PORT,
            min_vram_gb: 8.0,
            min_reliability: 0.9,
            min_disk_gb: 20.0,
            min_driver_version: 11.0,
            max_offers: 5,
            preferred_gpus: None,
            label_prefix: String::from("stemrig"),
            ready_timeout_secs: 600,
            ready_interval_secs: 10,
            wait_for_models: true,
            model_timeout_secs: 300,
            model_interval_secs: 5,
            job_timeout_secs: 1800,
            job_interval_secs: 5,
            stream_logs: true,
            registry_path: String::from(DEFAULT_REGISTRY_FILE),
        }
    }

    #[rstest]
    #[case("vast", Provider::Vast)]
    #[case("Vast.ai", Provider::Vast)]
    #[case(" runpod ", Provider::RunPod)]
    fn provider_names_parse(#[case] raw: &str, #[case] expected: Provider) {
        assert_eq!(raw.parse::<Provider>(), Ok(expected));
    }

    #[rstest]
    fn configured_key_wins_over_provider_variable(config: StemrigConfig) {
        let cfg = StemrigConfig {
            api_key: Some(String::from("configured")),
            ..config
        };
        let key = cfg
            .resolve_api_key_with(|_| Some(String::from("from-env")))
            .unwrap_or_else(|err| panic!("key: {err}"));
        assert_eq!(key, "configured");
    }

    #[rstest]
    fn provider_variable_fills_missing_key(config: StemrigConfig) {
        let cfg = StemrigConfig {
            provider: String::from("runpod"),
            ..config
        };
        let key = cfg
            .resolve_api_key_with(|name| (name == "RUNPOD_API_KEY").then(|| String::from("rp")))
            .unwrap_or_else(|err| panic!("key: {err}"));
        assert_eq!(key, "rp");
    }

    #[rstest]
    fn blank_preferred_entries_are_dropped(config: StemrigConfig) {
        let cfg = StemrigConfig {
            preferred_gpus: Some(String::from("A40, ,RTX 4090,")),
            ..config
        };
        let policy = cfg.ranking_policy(3);
        assert_eq!(policy.preferred, vec!["A40", "RTX 4090"]);
        assert_eq!(policy.max_results, 3);
    }

    #[rstest]
    fn run_settings_follow_configuration(config: StemrigConfig) {
        let cfg = StemrigConfig {
            wait_for_models: false,
            job_interval_secs: 2,
            ..config
        };
        let settings = cfg
            .run_settings()
            .unwrap_or_else(|err| panic!("settings: {err}"));
        assert!(settings.models.is_none());
        assert_eq!(settings.job.policy.interval, Duration::from_secs(2));
        assert!(settings.template.label.starts_with("stemrig-"));
        assert_eq!(settings.template.label.len(), "stemrig-".len() + 8);
        assert_eq!(settings.ranking.max_results, 5);
    }

    #[rstest]
    fn fleet_settings_use_wider_ranking(config: StemrigConfig) {
        let settings = config
            .fleet_settings()
            .unwrap_or_else(|err| panic!("settings: {err}"));
        assert_eq!(settings.label_prefix, "stemrig-fleet");
        assert_eq!(settings.ranking.max_results, crate::fleet::DEFAULT_FLEET_OFFERS);
    }
}
