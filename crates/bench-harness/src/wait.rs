//! Polling with an explicit delay policy and optional deadline.
//!
//! Container readiness, cloud operation completion and VM bootstrap all wait
//! on some remote state converging; they all go through `poll_until`.

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Delay policy for a polling loop.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Delay between checks
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Cap on the delay when `factor` grows it
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,
    /// Growth factor per attempt; 1.0 polls at a fixed interval
    pub factor: f32,
    /// Give up after this long; `None` waits for as long as it takes
    #[serde(with = "opt_duration_millis")]
    pub timeout: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(1))
    }
}

impl PollConfig {
    /// Poll every `interval` with no deadline
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_interval: interval,
            factor: 1.0,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_backoff(mut self, factor: f32, max_interval: Duration) -> Self {
        self.factor = factor;
        self.max_interval = max_interval.max(self.interval);
        self
    }
}

/// A polling loop ran past its deadline
#[derive(Debug, Clone, Error)]
#[error("Timeout waiting for {resource} after {timeout:?} ({attempts} attempts)")]
pub struct WaitTimeout {
    pub resource: String,
    pub timeout: Duration,
    pub attempts: u32,
}

/// Poll `check` until it yields a value.
///
/// `check` returns `Ok(Some(value))` when the resource is ready, `Ok(None)`
/// to keep waiting, or `Err` to abort. Errors from `check` are returned
/// unchanged; a missed deadline becomes `E::from(WaitTimeout)`.
pub async fn poll_until<T, E, F, Fut>(config: &PollConfig, resource: &str, mut check: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
    E: From<WaitTimeout>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    let mut delays = ExponentialBuilder::default()
        .with_min_delay(config.interval)
        .with_max_delay(config.max_interval)
        .with_factor(config.factor)
        .build();

    loop {
        attempts += 1;

        if let Some(value) = check().await? {
            debug!(resource = %resource, attempts, "Resource ready");
            return Ok(value);
        }

        let delay = delays.next().unwrap_or(config.max_interval);

        if let Some(timeout) = config.timeout {
            if start.elapsed() + delay > timeout {
                return Err(WaitTimeout {
                    resource: resource.to_string(),
                    timeout,
                    attempts,
                }
                .into());
            }
        }

        debug!(
            resource = %resource,
            attempt = attempts,
            delay_ms = delay.as_millis(),
            "Resource not ready, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
