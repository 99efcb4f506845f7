//! VM instance creation and deletion against a `ComputeApi`

use super::api::{ComputeApi, Instance, InstanceRequest, MetadataItem, Operation};
use super::error::ProvisionError;
use crate::config::{CloudConfig, PollingConfig};
use crate::wait::{poll_until, PollConfig};
use bench_harness_common::defaults::{
    DEFAULT_INSTANCE_PREFIX, DEFAULT_MACHINE_TYPE, DEFAULT_WAIT_TIMEOUT, INSTANCE_NAME_DIGITS,
    OPERATION_POLL_INTERVAL,
};
use rand::Rng;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Creates and deletes instances in one project and zone.
///
/// An image must be selected with `set_image` (or `set_image_from_family`)
/// before `create_instance` is called.
pub struct Provisioner {
    api: Arc<dyn ComputeApi>,
    project: String,
    zone: String,
    machine_type: String,
    name_prefix: String,
    metadata: Vec<MetadataItem>,
    operation_poll: PollConfig,
    /// Resolved image self link
    image: RwLock<Option<String>>,
    /// Every name ever submitted, so a name is never tried twice
    used_names: Mutex<HashSet<String>>,
}

impl Provisioner {
    pub fn new(api: Arc<dyn ComputeApi>, project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            api,
            project: project.into(),
            zone: zone.into(),
            machine_type: DEFAULT_MACHINE_TYPE.to_string(),
            name_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
            metadata: Vec::new(),
            operation_poll: PollConfig::fixed(OPERATION_POLL_INTERVAL).with_timeout(DEFAULT_WAIT_TIMEOUT),
            image: RwLock::new(None),
            used_names: Mutex::new(HashSet::new()),
        }
    }

    pub fn from_config(api: Arc<dyn ComputeApi>, cloud: &CloudConfig, polling: &PollingConfig) -> Self {
        Self::new(api, &cloud.project, &cloud.zone)
            .with_machine_type(&cloud.machine_type)
            .with_name_prefix(&cloud.name_prefix)
            .with_operation_poll(polling.operation.clone())
    }

    pub fn with_machine_type(mut self, machine_type: impl Into<String>) -> Self {
        self.machine_type = machine_type.into();
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    pub fn with_operation_poll(mut self, poll: PollConfig) -> Self {
        self.operation_poll = poll;
        self
    }

    /// Attach a metadata item to every instance this provisioner creates
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.push(MetadataItem {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Resolve an image name (in `image_project`, or this project) and use it
    /// for subsequent instances
    pub async fn set_image(&self, image: &str, image_project: Option<&str>) -> Result<(), ProvisionError> {
        let project = image_project.unwrap_or(&self.project);
        let resolved = self.api.get_image(project, image).await?;
        info!(image = %image, link = %resolved.self_link, "Selected image");
        self.store_image(resolved.self_link);
        Ok(())
    }

    /// Resolve the newest image of a family and use it for subsequent instances
    pub async fn set_image_from_family(&self, project: &str, family: &str) -> Result<(), ProvisionError> {
        let resolved = self.api.get_image_from_family(project, family).await?;
        info!(family = %family, image = %resolved.name, "Selected image from family");
        self.store_image(resolved.self_link);
        Ok(())
    }

    fn store_image(&self, link: String) {
        *self.image.write().unwrap_or_else(PoisonError::into_inner) = Some(link);
    }

    /// The currently selected image link
    pub fn image(&self) -> Option<String> {
        self.image
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Prefix followed by random digits, never one handed out before
    fn generate_name(&self) -> String {
        let mut used = self.used_names.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rng = rand::thread_rng();
        loop {
            let suffix: String = (0..INSTANCE_NAME_DIGITS)
                .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
                .collect();
            let name = format!("{}{}", self.name_prefix, suffix);
            if used.insert(name.clone()) {
                return name;
            }
        }
    }

    fn request(&self, name: &str, image: &str) -> InstanceRequest {
        let mut request = InstanceRequest::new(name, &self.zone, &self.machine_type, image);
        request.metadata.items.extend(self.metadata.iter().cloned());
        request
    }

    /// Create an instance under a fresh random name.
    ///
    /// A name conflict is retried with a new name; any other failure is
    /// returned as is.
    pub async fn create_instance(&self) -> Result<Instance, ProvisionError> {
        let image = self.image().ok_or(ProvisionError::ImageNotSet)?;
        loop {
            let name = self.generate_name();
            let request = self.request(&name, &image);
            match self.api.insert_instance(&self.project, &self.zone, &request).await {
                Ok(operation) => return self.finish_insert(operation, &name).await,
                Err(e) if e.is_conflict() => {
                    warn!(instance = %name, "Instance name already taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Create an instance with a caller-chosen name and extra metadata
    pub async fn create_named(
        &self,
        name: &str,
        metadata: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Instance, ProvisionError> {
        let image = self.image().ok_or(ProvisionError::ImageNotSet)?;
        let mut request = self.request(name, &image);
        request
            .metadata
            .items
            .extend(metadata.into_iter().map(|(key, value)| MetadataItem { key, value }));

        let operation = self
            .api
            .insert_instance(&self.project, &self.zone, &request)
            .await?;
        self.finish_insert(operation, name).await
    }

    /// Wait for an accepted insert and fetch the instance.
    ///
    /// Every failure from here on names the instance, since it may exist.
    async fn finish_insert(&self, operation: Operation, name: &str) -> Result<Instance, ProvisionError> {
        info!(instance = %name, operation = %operation.name, "Instance insert submitted");
        let confirmed = async {
            self.wait_operation(operation, name).await?;
            Ok::<_, ProvisionError>(self.api.get_instance(&self.project, &self.zone, name).await?)
        }
        .await;

        match confirmed {
            Ok(instance) => {
                info!(instance = %name, status = %instance.status, "Instance created");
                Ok(instance)
            }
            Err(e) if e.failed_instance().is_some() => Err(e),
            Err(e) => Err(ProvisionError::InsertIncomplete {
                instance: name.to_string(),
                source: Box::new(e),
            }),
        }
    }

    /// Poll an operation until it is DONE; a DONE operation carrying an error
    /// is a failure naming `instance`
    pub async fn wait_operation(&self, operation: Operation, instance: &str) -> Result<(), ProvisionError> {
        let done = if operation.is_done() {
            operation
        } else {
            let api = &self.api;
            let (project, zone) = (self.project.as_str(), self.zone.as_str());
            let op_name = operation.name.as_str();
            poll_until(&self.operation_poll, &format!("operation {op_name}"), || async move {
                let current = api.get_zone_operation(project, zone, op_name).await?;
                debug!(operation = %op_name, status = %current.status, "Polled operation");
                Ok::<_, ProvisionError>(current.is_done().then_some(current))
            })
            .await?
        };

        match done.error {
            Some(error) => Err(ProvisionError::OperationFailed {
                operation: done.name,
                instance: instance.to_string(),
                error,
            }),
            None => Ok(()),
        }
    }

    /// Submit deletion of an instance without waiting for it to finish
    pub async fn delete_instance(&self, name: &str) -> Result<(), ProvisionError> {
        let operation = self
            .api
            .delete_instance(&self.project, &self.zone, name)
            .await?;
        info!(instance = %name, operation = %operation.name, "Instance deletion submitted");
        Ok(())
    }

    /// Delete an instance during rollback, logging instead of failing
    pub(crate) async fn delete_quietly(&self, name: &str) {
        if let Err(e) = self.delete_instance(name).await {
            if !e.is_not_found() {
                warn!(instance = %name, error = %e, "Failed to delete instance during rollback");
            }
        }
    }

    /// Look up an instance's current descriptor
    pub async fn get_instance(&self, name: &str) -> Result<Instance, ProvisionError> {
        Ok(self
            .api
            .get_instance(&self.project, &self.zone, name)
            .await?)
    }
}
