//! Error types for the storage subsystem.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The provider was asked to operate on an empty device list.
    #[error("empty device list")]
    EmptyDeviceList,

    /// An NVMe device-level error.
    #[error("Device error on {device}: {reason}")]
    DeviceError {
        /// The device address.
        device: String,
        /// Description of the error.
        reason: String,
    },

    /// The provider does not support the requested bdev class.
    #[error("bdev class {class} is not supported by this provider")]
    UnsupportedClass {
        /// Name of the unsupported class.
        class: String,
    },

    /// SCM operation failed for a mountpoint.
    #[error("SCM error on {}: {reason}", mountpoint.display())]
    ScmError {
        /// The SCM mountpoint.
        mountpoint: PathBuf,
        /// Description of the error.
        reason: String,
    },

    /// The engine metadata-capacity override could not be parsed.
    #[error("invalid metadata capacity override {var}={value:?}: {reason}")]
    InvalidMdCap {
        /// Environment variable name.
        var: &'static str,
        /// Raw value as configured.
        value: String,
        /// Parse failure description.
        reason: String,
    },

    /// Storage configuration is invalid.
    #[error("invalid storage configuration: {0}")]
    InvalidConfig(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {reason}")]
    SerializationError {
        /// Description of the error.
        reason: String,
    },
}

impl StorageError {
    /// Remedial action for errors that have a standard one.
    pub fn resolution(&self) -> Option<&'static str> {
        match self {
            StorageError::UnsupportedClass { class } if class == "nvme" => Some(
                "NVMe namespaces are formatted by the engine's user-space driver; \
                 engines stay blocked until their NVMe tiers are formatted there or \
                 configured as file or malloc bdevs",
            ),
            StorageError::DeviceError { .. } => {
                Some("run `ferrum-server prepare` to bind devices to the user-space driver")
            }
            StorageError::InvalidMdCap { .. } => {
                Some("set FERRUM_MD_CAP to a whole number of MiB in the engine env_vars")
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_result_alias() {
        let ok: StorageResult<i32> = Ok(42);
        assert!(ok.is_ok());

        let err: StorageResult<i32> = Err(StorageError::EmptyDeviceList);
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let storage_err: StorageError = std_err.into();
        assert!(matches!(storage_err, StorageError::IoError(_)));
    }

    #[test]
    fn test_md_cap_error_display() {
        let err = StorageError::InvalidMdCap {
            var: "FERRUM_MD_CAP",
            value: "lots".to_string(),
            reason: "invalid digit found in string".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("FERRUM_MD_CAP"));
        assert!(msg.contains("\"lots\""));
    }

    #[test]
    fn test_nvme_format_unsupported_has_resolution() {
        let err = StorageError::UnsupportedClass {
            class: "nvme".to_string(),
        };
        assert!(err.resolution().unwrap().contains("user-space driver"));

        let kdev = StorageError::UnsupportedClass {
            class: "kdev".to_string(),
        };
        assert!(kdev.resolution().is_none());
        assert!(StorageError::EmptyDeviceList.resolution().is_none());
    }
}
