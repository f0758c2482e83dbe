//! Wire types for the Vast.ai REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::marketplace::{
    AvailabilityClass, InstanceSnapshot, InstanceSpec, InstanceStatus, Offer, PortMapping,
};

const MB_PER_GB: f64 = 1024.0;

#[derive(Debug, Deserialize)]
pub(super) struct BundleResponse {
    #[serde(default)]
    pub(super) offers: Vec<BundleOffer>,
}

#[derive(Debug, Deserialize)]
pub(super) struct BundleOffer {
    id: u64,
    #[serde(default)]
    gpu_name: Option<String>,
    /// GPU memory in megabytes.
    #[serde(default)]
    gpu_ram: Option<f64>,
    #[serde(default)]
    num_gpus: Option<u32>,
    #[serde(default)]
    dph_total: Option<f64>,
    #[serde(default)]
    disk_space: Option<f64>,
    #[serde(default)]
    cuda_max_good: Option<f64>,
    #[serde(default)]
    reliability2: Option<f64>,
    #[serde(default)]
    hosting_type: Option<u8>,
}

impl BundleOffer {
    #[expect(
        clippy::float_arithmetic,
        reason = "Vast reports GPU memory in megabytes"
    )]
    pub(super) fn into_offer(self) -> Offer {
        Offer {
            id: self.id.to_string(),
            gpu_name: self.gpu_name.unwrap_or_else(|| String::from("Unknown")),
            vram_gb: self.gpu_ram.unwrap_or_default() / MB_PER_GB,
            price_per_hour: self.dph_total.unwrap_or(f64::NAN),
            reliability: self.reliability2.unwrap_or_default(),
            availability: if self.hosting_type == Some(1) {
                AvailabilityClass::Secure
            } else {
                AvailabilityClass::Community
            },
            num_gpus: self.num_gpus.unwrap_or(1),
            disk_gb: self.disk_space,
            driver_version: self.cuda_max_good,
        }
    }
}

#[expect(
    clippy::float_arithmetic,
    reason = "Vast filters GPU memory in megabytes"
)]
pub(super) fn gb_to_mb(gb: f64) -> f64 {
    gb * MB_PER_GB
}

#[derive(Debug, Serialize)]
pub(super) struct CreatePayload<'a> {
    client_id: &'static str,
    image: &'a str,
    disk: u32,
    label: &'a str,
    onstart: &'static str,
    runtype: &'static str,
    env: BTreeMap<String, String>,
}

impl<'a> CreatePayload<'a> {
    pub(super) fn from_spec(spec: &'a InstanceSpec) -> Self {
        let mut env = BTreeMap::new();
        env.insert(format!("-p {0}:{0}", spec.service_port), String::from("1"));
        Self {
            client_id: "me",
            image: &spec.image,
            disk: spec.disk_gb,
            label: &spec.label,
            onstart: "/start.sh",
            runtype: "ssh",
            env,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct CreateResponse {
    #[serde(default)]
    pub(super) success: bool,
    #[serde(default)]
    pub(super) new_contract: Option<u64>,
    #[serde(default)]
    pub(super) error: Option<String>,
    #[serde(default)]
    pub(super) msg: Option<String>,
}

impl CreateResponse {
    pub(super) fn message(&self) -> String {
        [self.error.as_deref(), self.msg.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(": ")
    }
}

/// Error body returned alongside non-success statuses.
#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorBody {
    #[serde(default)]
    pub(super) error: Option<String>,
    #[serde(default)]
    pub(super) msg: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InstanceEnvelope {
    #[serde(default)]
    pub(super) instances: Option<InstancesField>,
}

/// The API returns an object for a single instance and an array otherwise.
///
/// `Many` is tried first: every `VastInstance` field is optional, so an
/// empty array would otherwise deserialize as a blank instance.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(super) enum InstancesField {
    Many(Vec<VastInstance>),
    One(Box<VastInstance>),
}

impl InstancesField {
    pub(super) fn into_first(self) -> Option<VastInstance> {
        match self {
            Self::One(instance) => Some(*instance),
            Self::Many(list) => list.into_iter().next(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct VastInstance {
    #[serde(default)]
    actual_status: Option<String>,
    #[serde(default)]
    public_ipaddr: Option<String>,
    #[serde(default)]
    ports: Option<BTreeMap<String, Option<Vec<HostBinding>>>>,
    #[serde(default)]
    dph_total: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct HostBinding {
    #[serde(rename = "HostIp", default)]
    host_ip: Option<String>,
    #[serde(rename = "HostPort")]
    host_port: String,
}

fn map_status(actual_status: Option<&str>) -> InstanceStatus {
    match actual_status {
        Some("running") => InstanceStatus::Running,
        Some("offline" | "exited") => InstanceStatus::Unreachable,
        _ => InstanceStatus::Creating,
    }
}

fn parse_ports(ports: BTreeMap<String, Option<Vec<HostBinding>>>) -> Vec<PortMapping> {
    ports
        .into_iter()
        .filter_map(|(key, bindings)| {
            let private_port = key.split('/').next()?.parse::<u16>().ok()?;
            let binding = bindings?.into_iter().next()?;
            let public_port = binding.host_port.trim().parse::<u16>().ok()?;
            Some(PortMapping {
                private_port,
                public_port,
                host: binding.host_ip.filter(|ip| !ip.is_empty()),
            })
        })
        .collect()
}

impl VastInstance {
    pub(super) fn into_snapshot(self, id: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            id: id.to_owned(),
            status: map_status(self.actual_status.as_deref()),
            public_host: self
                .public_ipaddr
                .map(|ip| ip.trim().to_owned())
                .filter(|ip| !ip.is_empty()),
            ports: self.ports.map(parse_ports).unwrap_or_default(),
            cost_per_hour: self.dph_total,
        }
    }
}
