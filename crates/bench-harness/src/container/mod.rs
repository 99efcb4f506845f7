//! Container lifecycle on one machine
//!
//! A `ContainerHandle` describes `count` instances of an image bound to a
//! machine's container runtime. Building one has no side effects. `run`
//! executes a single transient instance; `detach` starts every instance,
//! waits until all are running, hands the handle to a caller-supplied body
//! and kills every started instance afterwards, however the body ends.

mod docker;
mod guard;
mod runtime;

pub use docker::DockerCli;
pub use runtime::{
    ContainerOptions, ContainerRuntime, InstanceRef, InstanceState, LaunchSpec, RuntimeError,
};

use crate::error::{HarnessError, Result};
use crate::wait::{poll_until, PollConfig};
use bench_harness_common::defaults::{
    DEFAULT_CONTAINER_RUNTIME, DEFAULT_WAIT_TIMEOUT, READINESS_POLL_INTERVAL,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use guard::KillOnDrop;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How many instances to run and how to configure them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerParams {
    pub count: usize,
    /// Container port to publish; requires `count == 1`
    pub port: Option<u16>,
    /// OCI runtime; the machine's default when `None`
    pub runtime: Option<String>,
    pub options: ContainerOptions,
}

impl Default for ContainerParams {
    fn default() -> Self {
        Self {
            count: 1,
            port: None,
            runtime: None,
            options: ContainerOptions::default(),
        }
    }
}

impl ContainerParams {
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_runtime(mut self, runtime: impl Into<String>) -> Self {
        self.runtime = Some(runtime.into());
        self
    }

    pub fn with_options(mut self, options: ContainerOptions) -> Self {
        self.options = options;
        self
    }
}

/// One or more instances of an image on a single machine
pub struct ContainerHandle {
    image: String,
    /// Address of the machine the instances run on
    host: String,
    runtime: Arc<dyn ContainerRuntime>,
    runtime_name: String,
    count: usize,
    port: Option<u16>,
    options: ContainerOptions,
    readiness: PollConfig,
    /// Started instances, in start order
    instances: Vec<InstanceRef>,
}

impl std::fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("image", &self.image)
            .field("host", &self.host)
            .field("runtime", &self.runtime_name)
            .field("count", &self.count)
            .field("port", &self.port)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

impl ContainerHandle {
    /// Describe instances of `image` on the machine reachable at `host`.
    ///
    /// Fails if `count` is zero, or if a port is reserved for more than one
    /// instance.
    pub fn new(
        image: impl Into<String>,
        host: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        params: ContainerParams,
    ) -> Result<Self> {
        let image = image.into();
        if params.count == 0 {
            return Err(HarnessError::precondition(format!(
                "container {image} needs at least one instance"
            )));
        }
        if params.port.is_some() && params.count != 1 {
            return Err(HarnessError::precondition(format!(
                "a reserved port needs exactly one instance, {image} asks for {}",
                params.count
            )));
        }
        if params.options.name.is_some() && params.count != 1 {
            return Err(HarnessError::precondition(format!(
                "a fixed name needs exactly one instance, {image} asks for {}",
                params.count
            )));
        }

        Ok(Self {
            image,
            host: host.into(),
            runtime,
            runtime_name: params
                .runtime
                .unwrap_or_else(|| DEFAULT_CONTAINER_RUNTIME.to_string()),
            count: params.count,
            port: params.port,
            options: params.options,
            readiness: PollConfig::fixed(READINESS_POLL_INTERVAL).with_timeout(DEFAULT_WAIT_TIMEOUT),
            instances: Vec::new(),
        })
    }

    /// Override how `detach` waits for instances to report running
    pub fn with_readiness(mut self, readiness: PollConfig) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn launch_spec(&self, env: &[(&str, &str)]) -> LaunchSpec {
        LaunchSpec {
            image: self.image.clone(),
            runtime: self.runtime_name.clone(),
            port: self.port,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            options: self.options.clone(),
        }
    }

    /// Run one transient instance to completion and return its stdout.
    ///
    /// The runtime removes the instance when it exits.
    pub async fn run(&self, env: &[(&str, &str)]) -> Result<String> {
        info!(image = %self.image, host = %self.host, runtime = %self.runtime_name, "Running container");
        let output = self.runtime.run(&self.launch_spec(env)).await?;
        debug!(image = %self.image, bytes = output.len(), "Container finished");
        Ok(output)
    }

    /// Start every instance, wait until all are running, then run `body`.
    ///
    /// Every started instance is killed before this returns, whether `body`
    /// succeeds, fails or panics, and also when starting or waiting fails
    /// part way. Instances that are already gone are not an error. A panic in
    /// `body` is resumed after cleanup.
    ///
    /// ```ignore
    /// let mut server = machine.container("redis", ContainerParams::default().with_port(6379)).await?;
    /// let stats = server
    ///     .detach(&[], |server| async move {
    ///         let (host, port) = server.address().await?;
    ///         client.container("redis-bench", ContainerParams::default())
    ///             .await?
    ///             .run(&[("host", &host), ("port", &port.to_string())])
    ///             .await
    ///     }.boxed())
    ///     .await?;
    /// ```
    pub async fn detach<T, F>(&mut self, env: &[(&str, &str)], body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a ContainerHandle) -> BoxFuture<'a, Result<T>>,
    {
        let spec = self.launch_spec(env);
        let mut guard = KillOnDrop::new(Arc::clone(&self.runtime));

        let outcome = match self.start_all(&spec, &mut guard).await {
            Ok(()) => match self.wait_running().await {
                Ok(()) => {
                    // Call the body inside the guarded future so a panic while
                    // building it is caught too.
                    let this = &*self;
                    AssertUnwindSafe(async move { body(this).await })
                        .catch_unwind()
                        .await
                }
                Err(e) => Ok(Err(e)),
            },
            Err(e) => Ok(Err(e)),
        };

        let cleanup = self.cleanup().await;
        guard.disarm();

        match outcome {
            Err(panic) => std::panic::resume_unwind(panic),
            Ok(Err(e)) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(image = %self.image, error = %cleanup_err, "Cleanup failed after error");
                }
                Err(e)
            }
            Ok(Ok(value)) => cleanup.map(|()| value),
        }
    }

    /// Start instances one at a time, stopping at the first failure.
    async fn start_all(&mut self, spec: &LaunchSpec, guard: &mut KillOnDrop) -> Result<()> {
        for index in 0..self.count {
            match self.runtime.start(spec).await {
                Ok(instance) => {
                    info!(
                        image = %self.image,
                        host = %self.host,
                        index,
                        name = %instance.name,
                        "Started container instance"
                    );
                    guard.track(instance.id.clone());
                    self.instances.push(instance);
                }
                Err(e) => {
                    warn!(
                        image = %self.image,
                        index,
                        started = self.instances.len(),
                        error = %e,
                        "Container instance failed to start"
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Wait until every started instance reports running
    async fn wait_running(&self) -> Result<()> {
        let runtime = &self.runtime;
        let instances = &self.instances;
        let resource = format!("{} x{} running on {}", self.image, self.count, self.host);

        poll_until(&self.readiness, &resource, || async move {
            for instance in instances {
                let state = runtime.inspect(&instance.id).await?;
                if !state.running {
                    debug!(name = %instance.name, "Instance not running yet");
                    return Ok::<_, RuntimeError>(None);
                }
            }
            Ok(Some(()))
        })
        .await?;
        Ok(())
    }

    /// Kill every started instance and forget them.
    ///
    /// All kills are attempted; "not found" is ignored and the first other
    /// failure is returned.
    async fn cleanup(&mut self) -> Result<()> {
        let mut first_error = None;
        for instance in self.instances.drain(..) {
            match self.runtime.kill(&instance.id).await {
                Ok(()) => info!(name = %instance.name, "Killed container instance"),
                Err(e) if e.is_not_found() => {
                    debug!(name = %instance.name, "Instance already gone")
                }
                Err(e) => {
                    warn!(name = %instance.name, error = %e, "Failed to kill container instance");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Host and host-side port at which the single instance's reserved port is reachable
    pub async fn address(&self) -> Result<(String, u16)> {
        if self.count != 1 {
            return Err(HarnessError::precondition(format!(
                "address() needs a single-instance handle, {} has {}",
                self.image, self.count
            )));
        }
        let Some(port) = self.port else {
            return Err(HarnessError::precondition(format!(
                "address() needs a reserved port, {} has none",
                self.image
            )));
        };
        let Some(instance) = self.instances.first() else {
            return Err(HarnessError::precondition(format!(
                "address() needs a started instance of {}",
                self.image
            )));
        };

        let state = self.runtime.inspect(&instance.id).await?;
        let mapped = state.ports.get(&port).copied().ok_or_else(|| {
            RuntimeError::Parse(format!("{} has no host mapping for port {port}", instance.name))
        })?;
        Ok((self.host.clone(), mapped))
    }

    /// Runtime-assigned names of the started instances, in start order
    pub fn get_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.instances.iter().map(|i| i.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Runtime that starts `fail_at` instances before failing and records kills
    #[derive(Default)]
    struct Recording {
        fail_at: Option<usize>,
        started: AtomicUsize,
        killed: Mutex<Vec<String>>,
        not_running_polls: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for Recording {
        async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
            Ok(format!("ran {}", spec.image))
        }

        async fn start(&self, _: &LaunchSpec) -> Result<InstanceRef, RuntimeError> {
            let index = self.started.load(Ordering::SeqCst);
            if self.fail_at == Some(index) {
                return Err(RuntimeError::Failed {
                    command: "start".into(),
                    status: Some(125),
                    stderr: "boom".into(),
                });
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(InstanceRef {
                id: format!("id-{index}"),
                name: format!("inst-{index}"),
            })
        }

        async fn inspect(&self, _: &str) -> Result<InstanceState, RuntimeError> {
            let pending = self.not_running_polls.load(Ordering::SeqCst);
            if pending > 0 {
                self.not_running_polls.fetch_sub(1, Ordering::SeqCst);
                return Ok(InstanceState::default());
            }
            Ok(InstanceState {
                running: true,
                ports: BTreeMap::from([(6379, 32768)]),
            })
        }

        async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
            self.killed.lock().unwrap().push(id.to_string());
            Err(RuntimeError::NotFound { id: id.to_string() })
        }
    }

    fn handle(runtime: Arc<Recording>, params: ContainerParams) -> ContainerHandle {
        ContainerHandle::new("redis", "10.0.0.2", runtime, params)
            .unwrap()
            .with_readiness(PollConfig::fixed(Duration::from_millis(1)))
    }

    #[test]
    fn port_requires_single_instance() {
        let err = ContainerHandle::new(
            "redis",
            "h",
            Arc::new(Recording::default()),
            ContainerParams::default().with_count(2).with_port(6379),
        )
        .unwrap_err();
        assert!(err.is_precondition());
    }

    #[test]
    fn zero_instances_rejected() {
        let err = ContainerHandle::new(
            "redis",
            "h",
            Arc::new(Recording::default()),
            ContainerParams::default().with_count(0),
        )
        .unwrap_err();
        assert!(err.is_precondition());
    }

    #[tokio::test]
    async fn detach_kills_everything_after_body() {
        let runtime = Arc::new(Recording {
            not_running_polls: AtomicUsize::new(3),
            ..Default::default()
        });
        let mut h = handle(runtime.clone(), ContainerParams::default().with_count(2));

        let names = h
            .detach(&[], |h| {
                async move { Ok(h.get_names().map(str::to_string).collect::<Vec<_>>()) }.boxed()
            })
            .await
            .unwrap();

        assert_eq!(names, ["inst-0", "inst-1"]);
        assert_eq!(*runtime.killed.lock().unwrap(), ["id-0", "id-1"]);
        assert_eq!(h.get_names().count(), 0);
    }

    #[tokio::test]
    async fn detach_rolls_back_partial_start() {
        let runtime = Arc::new(Recording {
            fail_at: Some(1),
            ..Default::default()
        });
        let mut h = handle(runtime.clone(), ContainerParams::default().with_count(3));

        let err = h
            .detach(&[], |_| async { Ok(()) }.boxed())
            .await
            .unwrap_err();

        assert!(matches!(err, HarnessError::Runtime(RuntimeError::Failed { .. })));
        assert_eq!(*runtime.killed.lock().unwrap(), ["id-0"]);
        assert_eq!(runtime.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn detach_cleans_up_when_body_fails() {
        let runtime = Arc::new(Recording::default());
        let mut h = handle(runtime.clone(), ContainerParams::default());

        let err = h
            .detach(&[], |_| {
                async { Err::<(), _>(HarnessError::precondition("client gave up")) }.boxed()
            })
            .await
            .unwrap_err();

        assert!(err.is_precondition());
        assert_eq!(*runtime.killed.lock().unwrap(), ["id-0"]);
    }

    #[tokio::test]
    async fn address_returns_host_and_mapped_port() {
        let runtime = Arc::new(Recording::default());
        let mut h = handle(runtime, ContainerParams::default().with_port(6379));

        let addr = h
            .detach(&[], |h| async move { h.address().await }.boxed())
            .await
            .unwrap();
        assert_eq!(addr, ("10.0.0.2".to_string(), 32768));
    }

    #[tokio::test]
    async fn address_without_port_is_precondition() {
        let runtime = Arc::new(Recording::default());
        let h = handle(runtime, ContainerParams::default());
        assert!(h.address().await.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn run_passes_through_output() {
        let runtime = Arc::new(Recording::default());
        let h = handle(runtime.clone(), ContainerParams::default().with_count(3));
        assert_eq!(h.run(&[("k", "v")]).await.unwrap(), "ran redis");
        assert_eq!(runtime.started.load(Ordering::SeqCst), 0);
    }
}
