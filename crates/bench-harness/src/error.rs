//! Harness error taxonomy
//!
//! Component errors (`RuntimeError`, `ProvisionError`, `PoolSpecError`) are
//! folded into `HarnessError` at the public API so drivers see one error type
//! whose variant says what went wrong.

use crate::cloud::ProvisionError;
use crate::container::RuntimeError;
use bench_harness_common::PoolSpecError;
use thiserror::Error;

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

/// Errors surfaced to benchmark drivers
#[derive(Debug, Error)]
pub enum HarnessError {
    /// More machines were requested than the producer can ever supply
    #[error("Insufficient machines: {requested} requested, pool holds {capacity}")]
    Capacity { requested: usize, capacity: usize },

    /// An operation was called in a state that can never satisfy it
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// The container runtime failed to start, run or inspect an instance
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// Creating or deleting a cloud instance failed
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// A shell command on a machine exited unsuccessfully
    #[error("Command `{command}` on {machine} exited with {status:?}: {stderr}")]
    Command {
        machine: String,
        command: String,
        status: Option<u32>,
        stderr: String,
    },

    /// The pool specification could not be loaded
    #[error(transparent)]
    Config(#[from] PoolSpecError),

    /// Transport, I/O or other plumbing failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HarnessError {
    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition(message.into())
    }

    /// Check if this is a pool capacity error
    pub fn is_capacity(&self) -> bool {
        matches!(self, HarnessError::Capacity { .. })
    }

    /// Check if this is a precondition violation
    pub fn is_precondition(&self) -> bool {
        matches!(self, HarnessError::Precondition(_))
    }

    /// Check if this wraps a runtime "no such instance" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, HarnessError::Runtime(e) if e.is_not_found())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_display() {
        let err = HarnessError::Capacity {
            requested: 3,
            capacity: 2,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient machines: 3 requested, pool holds 2"
        );
        assert!(err.is_capacity());
        assert!(!err.is_precondition());
    }

    #[test]
    fn runtime_not_found_is_classified() {
        let err: HarnessError = RuntimeError::NotFound {
            id: "abc".to_string(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!HarnessError::precondition("x").is_not_found());
    }

    #[test]
    fn anyhow_errors_convert() {
        let err: HarnessError = anyhow::anyhow!("ssh handshake failed").into();
        assert!(matches!(err, HarnessError::Other(_)));
        assert_eq!(err.to_string(), "ssh handshake failed");
    }
}
