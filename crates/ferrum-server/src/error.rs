//! Error types for the control service.

use ferrum_storage::StorageError;
use thiserror::Error;

/// Result type alias for control-service operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors surfaced by scan, format and device-lifecycle calls.
#[derive(Debug, Error)]
pub enum ServerError {
    /// NVMe access needs hugepages and they are disabled for this node.
    #[error("hugepages are disabled on this node, NVMe devices cannot be accessed")]
    HugepagesDisabled,

    /// Node configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// No engine with the given index is managed by this node.
    #[error("engine {0} not found")]
    EngineNotFound(u32),

    /// An engine could not be queried or failed its part of a call.
    #[error("engine {index}: {reason}")]
    Engine {
        /// Engine index.
        index: u32,
        /// Description of the failure.
        reason: String,
    },

    /// The engine has no bdev tier matching the request.
    #[error("engine {engine} has no NVMe tier {tier}")]
    TierNotFound {
        /// Engine index.
        engine: u32,
        /// Requested tier index, if one was given.
        tier: String,
    },

    /// Not enough memory to back all configured ramdisks.
    #[error("insufficient memory for ramdisk SCM: {required} bytes required, {available} available")]
    InsufficientMemory {
        /// Bytes needed including the safety margin.
        required: u64,
        /// Bytes available on the node.
        available: u64,
    },

    /// The node-wide control-metadata store could not be checked or formatted.
    #[error("control metadata store: {0}")]
    ControlMetadata(String),

    /// The call was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A dispatched task ended without reporting its result.
    #[error("task group lost {missing} of {dispatched} results")]
    TaskLost {
        /// Results never received.
        missing: usize,
        /// Tasks dispatched.
        dispatched: usize,
    },

    /// Error from the storage layer.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Remedial action for the operator, where a standard one exists.
    pub fn resolution(&self) -> Option<&'static str> {
        match self {
            ServerError::HugepagesDisabled => {
                Some("enable hugepages in the server config and run `ferrum-server prepare`")
            }
            ServerError::InsufficientMemory { .. } => {
                Some("reduce ramdisk_size in the engine SCM tiers or free system memory")
            }
            ServerError::Config(_) | ServerError::Storage(StorageError::InvalidConfig(_)) => {
                Some("fix the server configuration file and restart")
            }
            ServerError::Storage(e) => e.resolution(),
            ServerError::ControlMetadata(_) => {
                Some("check that the control_metadata path is writable")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_hints() {
        assert!(ServerError::HugepagesDisabled.resolution().is_some());
        assert!(ServerError::InsufficientMemory {
            required: 2,
            available: 1
        }
        .resolution()
        .unwrap()
        .contains("ramdisk"));
        assert!(ServerError::Cancelled.resolution().is_none());
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: ServerError = StorageError::EmptyDeviceList.into();
        assert_eq!(err.to_string(), "empty device list");
    }

    #[test]
    fn test_storage_resolution_passes_through() {
        let err: ServerError = StorageError::UnsupportedClass {
            class: "nvme".to_string(),
        }
        .into();
        assert_eq!(
            err.resolution(),
            StorageError::UnsupportedClass {
                class: "nvme".to_string()
            }
            .resolution()
        );
        assert!(err.resolution().is_some());
    }
}
