//! Recording container runtime

use async_trait::async_trait;
use bench_harness::container::{ContainerRuntime, InstanceRef, InstanceState, LaunchSpec, RuntimeError};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct State {
    runs: Vec<LaunchSpec>,
    started: Vec<String>,
    killed: Vec<String>,
    polls: HashMap<String, usize>,
    next_id: usize,
}

/// In-memory `ContainerRuntime` that records every call.
///
/// Instances are named `<prefix>-<n>` in start order. Behaviour is set with
/// the builder methods before the runtime is shared.
pub struct FakeRuntime {
    prefix: String,
    fail_start_at: Option<usize>,
    running_after: usize,
    ports: BTreeMap<u16, u16>,
    kill_not_found: bool,
    run_output: String,
    state: Mutex<State>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new("fake")
    }
}

impl FakeRuntime {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            fail_start_at: None,
            running_after: 0,
            ports: BTreeMap::new(),
            kill_not_found: false,
            run_output: String::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// The `index`-th start (zero based) fails
    pub fn fail_start_at(mut self, index: usize) -> Self {
        self.fail_start_at = Some(index);
        self
    }

    /// Instances report running only after `polls` inspections
    pub fn running_after(mut self, polls: usize) -> Self {
        self.running_after = polls;
        self
    }

    /// Every instance publishes `container` on `host`
    pub fn with_port(mut self, container: u16, host: u16) -> Self {
        self.ports.insert(container, host);
        self
    }

    /// `kill` reports every instance as already gone
    pub fn kill_not_found(mut self) -> Self {
        self.kill_not_found = true;
        self
    }

    /// Output returned by synchronous runs
    pub fn with_run_output(mut self, output: impl Into<String>) -> Self {
        self.run_output = output.into();
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Launch specs of synchronous runs, in order
    pub fn runs(&self) -> Vec<LaunchSpec> {
        self.state().runs.clone()
    }

    /// Ids of instances started, in order
    pub fn started(&self) -> Vec<String> {
        self.state().started.clone()
    }

    /// Ids passed to `kill`, in order
    pub fn killed(&self) -> Vec<String> {
        self.state().killed.clone()
    }

    /// Started instances that were never killed
    pub fn live(&self) -> Vec<String> {
        let state = self.state();
        state
            .started
            .iter()
            .filter(|id| !state.killed.contains(id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(&self, spec: &LaunchSpec) -> Result<String, RuntimeError> {
        self.state().runs.push(spec.clone());
        Ok(self.run_output.clone())
    }

    async fn start(&self, spec: &LaunchSpec) -> Result<InstanceRef, RuntimeError> {
        let mut state = self.state();
        let index = state.next_id;
        state.next_id += 1;
        if self.fail_start_at == Some(index) {
            return Err(RuntimeError::Failed {
                command: format!("run --detach {}", spec.image),
                status: Some(125),
                stderr: "injected start failure".into(),
            });
        }

        let id = format!("{}-{index}", self.prefix);
        state.started.push(id.clone());
        Ok(InstanceRef {
            name: spec.options.name.clone().unwrap_or_else(|| id.clone()),
            id,
        })
    }

    async fn inspect(&self, id: &str) -> Result<InstanceState, RuntimeError> {
        let mut state = self.state();
        if !state.started.iter().any(|s| s == id) || state.killed.iter().any(|k| k == id) {
            return Err(RuntimeError::NotFound { id: id.into() });
        }
        let polls = state.polls.entry(id.to_string()).or_insert(0);
        *polls += 1;
        Ok(InstanceState {
            running: *polls > self.running_after,
            ports: self.ports.clone(),
        })
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        self.state().killed.push(id.to_string());
        if self.kill_not_found {
            return Err(RuntimeError::NotFound { id: id.into() });
        }
        Ok(())
    }
}
