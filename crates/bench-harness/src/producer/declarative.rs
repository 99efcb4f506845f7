//! Building a `MachinePool` from a pool specification

use super::MachinePool;
use crate::channel::SshTarget;
use crate::cloud::{bootstrap, ComputeApi, GceClient, Provisioner};
use crate::config::HarnessConfig;
use crate::error::Result;
use crate::machine::{Machine, MachineSettings};
use bench_harness_common::{CloudEntry, MachineSpec, PoolSpec};
use std::sync::Arc;
use tracing::{info, warn};

/// A cloud entry whose instance `from_spec` created
struct Bootstrapped {
    api: Arc<dyn ComputeApi>,
    entry: CloudEntry,
}

impl MachinePool {
    /// Build every machine in `spec`, in order.
    ///
    /// Remote entries are connected and checked; cloud entries are created
    /// and bootstrapped through `compute`, or a Compute Engine client
    /// resolved from the environment when `compute` is `None`. If any entry
    /// fails, the instances of cloud entries built before it are deleted.
    pub async fn from_spec(
        spec: PoolSpec,
        config: &HarnessConfig,
        compute: Option<Arc<dyn ComputeApi>>,
    ) -> Result<Self> {
        let settings = MachineSettings::from(config);
        let mut compute = compute;
        let mut machines = Vec::with_capacity(spec.len());
        let mut bootstrapped = Vec::new();

        for (name, entry) in spec {
            let built = match entry {
                MachineSpec::Local => Ok(Machine::local(&name, settings.clone())),
                MachineSpec::Remote(remote) => {
                    Machine::remote(&name, SshTarget::from(&remote), settings.clone()).await
                }
                MachineSpec::Cloud(cloud) => {
                    let api = match &compute {
                        Some(api) => Ok(Arc::clone(api)),
                        None => {
                            let token = config.cloud.as_ref().and_then(|c| c.access_token.as_deref());
                            GceClient::from_env(token).await.map(|client| {
                                let api: Arc<dyn ComputeApi> = Arc::new(client);
                                compute = Some(Arc::clone(&api));
                                api
                            })
                        }
                    };
                    match api {
                        Ok(api) => {
                            let result =
                                bootstrap(Arc::clone(&api), &name, &cloud, settings.clone(), &config.polling)
                                    .await;
                            if result.is_ok() {
                                bootstrapped.push(Bootstrapped { api, entry: cloud });
                            }
                            result
                        }
                        Err(e) => Err(e.into()),
                    }
                }
            };

            match built {
                Ok(machine) => {
                    info!(machine = %machine.name(), kind = ?machine.kind(), "Added machine to pool");
                    machines.push(machine);
                }
                Err(e) => {
                    warn!(machine = %name, error = %e, "Pool build failed");
                    delete_bootstrapped(&bootstrapped).await;
                    return Err(e);
                }
            }
        }

        Ok(Self::new(machines).with_recheck_interval(config.polling.pool_recheck))
    }
}

/// Delete the instances of cloud entries built before a failure
async fn delete_bootstrapped(bootstrapped: &[Bootstrapped]) {
    for built in bootstrapped {
        let provisioner = Provisioner::new(Arc::clone(&built.api), &built.entry.project, &built.entry.zone);
        provisioner.delete_quietly(&built.entry.instance_name).await;
    }
}
