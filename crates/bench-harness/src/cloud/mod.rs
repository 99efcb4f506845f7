//! Cloud VM provisioning
//!
//! `Provisioner` drives instance insert/delete through a `ComputeApi` and
//! polls the resulting operations. `GceClient` is the Compute Engine REST
//! implementation; tests substitute a mock.

mod api;
mod bootstrap;
mod error;
mod gce;
mod provisioner;

pub use api::{
    ApiError, ComputeApi, Image, Instance, InstanceRequest, Metadata, MetadataItem, Operation,
    STATUS_CONFLICT, STATUS_NOT_FOUND,
};
pub use bootstrap::{bootstrap, DEFAULT_STARTUP_SCRIPT};
pub(crate) use bootstrap::public_key_path;
pub use error::ProvisionError;
pub use gce::{GceClient, ACCESS_TOKEN_ENV};
pub use provisioner::Provisioner;

#[cfg(test)]
pub use api::MockComputeApi;
