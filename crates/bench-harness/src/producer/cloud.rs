//! Producer that creates a VM per machine

use super::MachineProducer;
use crate::cloud::{public_key_path, GceClient, ProvisionError, Provisioner};
use crate::config::{HarnessConfig, SshCredentials};
use crate::error::{HarnessError, Result};
use crate::machine::{Machine, MachineSettings};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Creates fresh VM instances on `get_machines` and deletes them on release
pub struct CloudProducer {
    provisioner: Provisioner,
    ssh: SshCredentials,
    settings: MachineSettings,
}

impl CloudProducer {
    pub fn new(provisioner: Provisioner, ssh: SshCredentials, settings: MachineSettings) -> Self {
        Self {
            provisioner,
            ssh,
            settings,
        }
    }

    /// Build from the `cloud` section of `config`.
    ///
    /// Resolves the configured image and, when `<key_path>.pub` exists,
    /// installs it on every instance as an `ssh-keys` entry.
    pub async fn from_config(config: &HarnessConfig) -> Result<Self> {
        let cloud = config.require_cloud()?;
        let ssh = cloud
            .ssh
            .clone()
            .ok_or_else(|| HarnessError::precondition("cloud producer needs `cloud.ssh` credentials"))?;

        let api = Arc::new(GceClient::from_env(cloud.access_token.as_deref()).await?);
        let mut provisioner = Provisioner::from_config(api, cloud, &config.polling);

        if let Ok(public_key) = tokio::fs::read_to_string(public_key_path(&ssh.key_path)).await {
            provisioner = provisioner.with_metadata(
                "ssh-keys",
                format!("{}:{}", ssh.username, public_key.trim()),
            );
        }

        if let Some(image) = &cloud.image {
            provisioner
                .set_image(image, cloud.image_project.as_deref())
                .await
                .with_context(|| format!("Failed to resolve image {image}"))?;
        }

        Ok(Self::new(provisioner, ssh, MachineSettings::from(config)))
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    async fn create_machine(&self) -> Result<Machine> {
        let instance = match self.provisioner.create_instance().await {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(name) = e.failed_instance() {
                    self.provisioner.delete_quietly(name).await;
                }
                return Err(e.into());
            }
        };

        let name = instance.name.clone();
        match Machine::cloud(
            instance,
            &self.ssh.username,
            &self.ssh.key_path,
            self.ssh.key_password.clone(),
            self.settings.clone(),
        ) {
            Ok(machine) => Ok(machine),
            Err(e) => {
                self.provisioner.delete_quietly(&name).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl MachineProducer for CloudProducer {
    async fn get_machines(&self, count: usize) -> Result<Vec<Arc<Machine>>> {
        let mut machines = Vec::with_capacity(count);
        for _ in 0..count {
            match self.create_machine().await {
                Ok(machine) => machines.push(Arc::new(machine)),
                Err(e) => {
                    warn!(
                        created = machines.len(),
                        requested = count,
                        error = %e,
                        "Instance creation failed, deleting instances already created"
                    );
                    for machine in &machines {
                        self.provisioner.delete_quietly(machine.name()).await;
                    }
                    return Err(e);
                }
            }
        }
        info!(count, "Created cloud machines");
        Ok(machines)
    }

    async fn release_machines(&self, machines: Vec<Arc<Machine>>) -> Result<()> {
        let mut first_error: Option<ProvisionError> = None;
        for machine in machines {
            if machine.instance().is_none() {
                warn!(machine = %machine.name(), "Not a cloud machine, nothing to delete");
                continue;
            }
            match self.provisioner.delete_instance(machine.name()).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!(instance = %machine.name(), "Instance already deleted");
                }
                Err(e) => {
                    warn!(instance = %machine.name(), error = %e, "Failed to delete instance");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{ApiError, Image, Instance, MockComputeApi, Operation};
    use crate::wait::PollConfig;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    fn credentials() -> SshCredentials {
        SshCredentials {
            username: "bench".into(),
            key_path: PathBuf::from("/keys/bench"),
            key_password: None,
        }
    }

    fn with_ip(name: &str) -> Instance {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "networkInterfaces": [{"accessConfigs": [{"natIP": "34.0.0.1"}]}]
        }))
        .unwrap()
    }

    fn done() -> Operation {
        Operation {
            name: "operation".into(),
            status: "DONE".into(),
            ..Default::default()
        }
    }

    async fn producer(mock: MockComputeApi) -> CloudProducer {
        let provisioner = Provisioner::new(Arc::new(mock), "bench", "us-central1-b")
            .with_operation_poll(PollConfig::fixed(Duration::from_millis(1)));
        provisioner.set_image("ubuntu", None).await.unwrap();
        CloudProducer::new(provisioner, credentials(), MachineSettings::default())
    }

    fn images(mock: &mut MockComputeApi) {
        mock.expect_get_image().returning(|_, name| {
            Ok(Image {
                name: name.to_string(),
                self_link: format!("global/images/{name}"),
            })
        });
    }

    #[tokio::test]
    async fn creates_one_instance_per_machine() {
        let mut mock = MockComputeApi::new();
        images(&mut mock);
        mock.expect_insert_instance().times(2).returning(|_, _, _| Ok(done()));
        mock.expect_get_instance().returning(|_, _, name| Ok(with_ip(name)));

        let machines = producer(mock).await.get_machines(2).await.unwrap();
        assert_eq!(machines.len(), 2);
        assert_ne!(machines[0].name(), machines[1].name());
        assert!(machines.iter().all(|m| m.instance().is_some()));
    }

    #[tokio::test]
    async fn failure_rolls_back_created_instances() {
        let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
        let inserts = Arc::new(Mutex::new(0));

        let mut mock = MockComputeApi::new();
        images(&mut mock);
        let count = inserts.clone();
        mock.expect_insert_instance().returning(move |_, _, _| {
            let mut n = count.lock().unwrap();
            *n += 1;
            if *n == 2 {
                Err(ApiError::Status {
                    status: 403,
                    message: "quota exceeded".into(),
                })
            } else {
                Ok(done())
            }
        });
        mock.expect_get_instance().returning(|_, _, name| Ok(with_ip(name)));
        let seen = deleted.clone();
        mock.expect_delete_instance().returning(move |_, _, name| {
            seen.lock().unwrap().push(name.to_string());
            Ok(done())
        });

        let p = producer(mock).await;
        let err = p.get_machines(3).await.unwrap_err();
        assert!(matches!(err, HarnessError::Provision(ProvisionError::Api(_))));
        assert_eq!(*inserts.lock().unwrap(), 2);
        assert_eq!(deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unconfirmed_instance_is_deleted() {
        let deleted = Arc::new(Mutex::new(Vec::<String>::new()));
        let submitted = Arc::new(Mutex::new(Vec::<String>::new()));

        let mut mock = MockComputeApi::new();
        images(&mut mock);
        let names = submitted.clone();
        mock.expect_insert_instance().returning(move |_, _, request| {
            names.lock().unwrap().push(request.name.clone());
            Ok(Operation {
                name: "op".into(),
                status: "RUNNING".into(),
                ..Default::default()
            })
        });
        mock.expect_get_zone_operation().returning(|_, _, name| {
            Ok(Operation {
                name: name.to_string(),
                status: "RUNNING".into(),
                ..Default::default()
            })
        });
        let seen = deleted.clone();
        mock.expect_delete_instance().returning(move |_, _, name| {
            seen.lock().unwrap().push(name.to_string());
            Ok(done())
        });

        let provisioner = Provisioner::new(Arc::new(mock), "bench", "us-central1-b").with_operation_poll(
            PollConfig::fixed(Duration::from_millis(1)).with_timeout(Duration::from_millis(10)),
        );
        provisioner.set_image("ubuntu", None).await.unwrap();
        let p = CloudProducer::new(provisioner, credentials(), MachineSettings::default());

        let err = p.get_machines(1).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provision(ProvisionError::InsertIncomplete { .. })
        ));
        assert_eq!(*deleted.lock().unwrap(), *submitted.lock().unwrap());
        assert_eq!(deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_swallows_not_found_and_reports_other_errors() {
        let mut mock = MockComputeApi::new();
        images(&mut mock);
        mock.expect_insert_instance().returning(|_, _, _| Ok(done()));
        mock.expect_get_instance().returning(|_, _, name| Ok(with_ip(name)));
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        mock.expect_delete_instance().returning(move |_, _, _| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            let status = if *n == 1 { 404 } else { 500 };
            Err(ApiError::Status {
                status,
                message: "delete".into(),
            })
        });

        let p = producer(mock).await;
        let machines = p.get_machines(3).await.unwrap();
        let err = p.release_machines(machines).await.unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Provision(ProvisionError::Api(ApiError::Status { status: 500, .. }))
        ));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn release_of_nothing_is_ok() {
        let p = producer({
            let mut mock = MockComputeApi::new();
            images(&mut mock);
            mock
        })
        .await;
        p.release_machines(Vec::new()).await.unwrap();
    }
}
