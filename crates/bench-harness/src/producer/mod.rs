//! Machine producers: where benchmark drivers get machines from
//!
//! - `MachinePool`: a fixed set of machines (local, or built from a pool
//!   specification) handed out under mutual exclusion
//! - `CloudProducer`: creates a VM per requested machine and deletes it on
//!   release

mod cloud;
mod declarative;
mod pool;

pub use cloud::CloudProducer;
pub use pool::MachinePool;

use crate::error::Result;
use crate::machine::Machine;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

/// Hands out machines and takes them back
#[async_trait]
pub trait MachineProducer: Send + Sync {
    /// Obtain `count` machines, waiting if they are not available yet
    async fn get_machines(&self, count: usize) -> Result<Vec<Arc<Machine>>>;

    /// Return machines obtained from `get_machines`.
    ///
    /// Safe to call with any subset, including an empty list.
    async fn release_machines(&self, machines: Vec<Arc<Machine>>) -> Result<()>;
}

/// Run `body` with `count` machines and release them afterwards, whether
/// `body` succeeds or not
pub async fn with_machines<P, T, F, Fut>(producer: &P, count: usize, body: F) -> Result<T>
where
    P: MachineProducer + ?Sized,
    F: FnOnce(Vec<Arc<Machine>>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let machines = producer.get_machines(count).await?;
    let result = body(machines.clone()).await;

    match (producer.release_machines(machines).await, result) {
        (Ok(()), result) => result,
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(body_err)) => {
            warn!(error = %e, "Failed to release machines after error");
            Err(body_err)
        }
    }
}
