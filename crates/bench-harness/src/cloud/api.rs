//! Compute API surface used by the provisioner
//!
//! Resource types mirror the JSON the compute API returns; only the fields
//! the harness reads are modelled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// HTTP status the API uses for a name already taken
pub const STATUS_CONFLICT: u16 = 409;
pub const STATUS_NOT_FOUND: u16 = 404;

/// Compute API call failures
#[derive(Debug, Error)]
pub enum ApiError {
    /// The API answered with a non-2xx status
    #[error("Compute API returned {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never got an answer, or the answer did not decode
    #[error("Compute API request failed: {0}")]
    Transport(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Transport(_) => None,
        }
    }

    /// Check if the requested name is already in use
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(STATUS_CONFLICT)
    }

    /// Check if the resource does not exist (safe to skip in cleanup)
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(STATUS_NOT_FOUND)
    }
}

/// A boot image
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    pub self_link: String,
}

/// A long-running zone operation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    /// `PENDING`, `RUNNING` or `DONE`
    pub status: String,
    #[serde(default)]
    pub target_link: Option<String>,
    /// Present when a finished operation failed
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }
}

/// A VM instance as described by the API
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    #[serde(rename = "networkIP", default)]
    pub network_ip: Option<String>,
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccessConfig {
    #[serde(rename = "natIP", default)]
    pub nat_ip: Option<String>,
}

impl Instance {
    /// First external NAT address, if the instance has one
    pub fn external_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .flat_map(|n| &n.access_configs)
            .find_map(|a| a.nat_ip.as_deref())
    }

    /// First internal network address
    pub fn internal_ip(&self) -> Option<&str> {
        self.network_interfaces
            .iter()
            .find_map(|n| n.network_ip.as_deref())
    }
}

/// Body of an instance insert request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRequest {
    pub name: String,
    pub machine_type: String,
    pub disks: Vec<AttachedDisk>,
    pub network_interfaces: Vec<NetworkInterfaceRequest>,
    #[serde(skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachedDisk {
    pub boot: bool,
    pub auto_delete: bool,
    pub initialize_params: InitializeParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub source_image: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterfaceRequest {
    pub network: String,
    pub access_configs: Vec<AccessConfigRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessConfigRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metadata {
    pub items: Vec<MetadataItem>,
}

impl Metadata {
    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataItem {
    pub key: String,
    pub value: String,
}

impl InstanceRequest {
    /// Persistent boot disk from `source_image`, default network with an external NAT
    pub fn new(
        name: impl Into<String>,
        zone: &str,
        machine_type: &str,
        source_image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            machine_type: format!("zones/{zone}/machineTypes/{machine_type}"),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: InitializeParams {
                    source_image: source_image.into(),
                },
            }],
            network_interfaces: vec![NetworkInterfaceRequest {
                network: "global/networks/default".to_string(),
                access_configs: vec![AccessConfigRequest {
                    name: "External NAT".to_string(),
                    kind: "ONE_TO_ONE_NAT".to_string(),
                }],
            }],
            metadata: Metadata::default(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.items.push(MetadataItem {
            key: key.into(),
            value: value.into(),
        });
        self
    }
}

/// Compute API calls the harness makes.
///
/// Every call is a single request/response; long-running work is reported
/// as an `Operation` to be polled with `get_zone_operation`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_image(&self, project: &str, image: &str) -> Result<Image, ApiError>;

    /// Latest non-deprecated image of a family
    async fn get_image_from_family(&self, project: &str, family: &str) -> Result<Image, ApiError>;

    async fn insert_instance(
        &self,
        project: &str,
        zone: &str,
        request: &InstanceRequest,
    ) -> Result<Operation, ApiError>;

    async fn get_instance(&self, project: &str, zone: &str, name: &str) -> Result<Instance, ApiError>;

    async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<Operation, ApiError>;

    async fn get_zone_operation(
        &self,
        project: &str,
        zone: &str,
        operation: &str,
    ) -> Result<Operation, ApiError>;
}
