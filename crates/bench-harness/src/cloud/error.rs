//! Provisioning errors

use super::api::ApiError;
use crate::wait::WaitTimeout;
use thiserror::Error;

/// Failures creating or deleting cloud instances
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// A compute API call failed
    #[error(transparent)]
    Api(#[from] ApiError),

    /// An operation finished with an error payload.
    ///
    /// The instance may exist; the caller owns deleting it.
    #[error("Operation {operation} for instance {instance} failed: {error}")]
    OperationFailed {
        operation: String,
        instance: String,
        error: serde_json::Value,
    },

    /// The insert was accepted but the instance could not be confirmed.
    ///
    /// The instance may exist; the caller owns deleting it.
    #[error("Instance {instance} was submitted but not confirmed: {source}")]
    InsertIncomplete {
        instance: String,
        #[source]
        source: Box<ProvisionError>,
    },

    /// `set_image` was never called
    #[error("No image selected; call set_image before creating instances")]
    ImageNotSet,

    /// The instance came up without an external address
    #[error("Instance {instance} has no external address")]
    MissingExternalIp { instance: String },

    /// An operation or bootstrap wait ran past its deadline
    #[error(transparent)]
    Timeout(#[from] WaitTimeout),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProvisionError {
    /// Check if the target resource does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::Api(e) if e.is_not_found())
    }

    /// Name of an instance left behind by the failure, if one may exist
    pub fn failed_instance(&self) -> Option<&str> {
        match self {
            ProvisionError::OperationFailed { instance, .. }
            | ProvisionError::InsertIncomplete { instance, .. }
            | ProvisionError::MissingExternalIp { instance } => Some(instance),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_failure_names_instance() {
        let err = ProvisionError::OperationFailed {
            operation: "operation-9".into(),
            instance: "machine-123".into(),
            error: serde_json::json!({"errors": [{"code": "ZONE_RESOURCE_POOL_EXHAUSTED"}]}),
        };
        assert_eq!(err.failed_instance(), Some("machine-123"));
        assert!(err.to_string().contains("ZONE_RESOURCE_POOL_EXHAUSTED"));
    }

    #[test]
    fn incomplete_insert_names_instance() {
        let err = ProvisionError::InsertIncomplete {
            instance: "machine-7".into(),
            source: Box::new(ProvisionError::ImageNotSet),
        };
        assert_eq!(err.failed_instance(), Some("machine-7"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(!err.is_not_found());
    }

    #[test]
    fn not_found_passes_through() {
        let err: ProvisionError = ApiError::Status {
            status: 404,
            message: "gone".into(),
        }
        .into();
        assert!(err.is_not_found());
        assert!(!ProvisionError::ImageNotSet.is_not_found());
    }
}
