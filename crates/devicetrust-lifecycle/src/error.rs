//! Lifecycle errors
//!
//! One variant per caller-visible outcome. Conflicts and not-found results
//! are ordinary outcomes, not operational failures.

use std::fmt;

use devicetrust_common::retry::Retryable;
use devicetrust_pki::PkiError;
use devicetrust_registry::RegistryError;
use serde::Serialize;
use thiserror::Error;

/// What is known about the remote side after a failed registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteState {
    /// The control plane refused the create; nothing exists remotely
    NotCreated,
    /// The create may or may not have been applied
    Unknown,
}

impl fmt::Display for RemoteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteState::NotCreated => write!(f, "not created"),
            RemoteState::Unknown => write!(f, "unknown"),
        }
    }
}

/// Error from a lifecycle operation
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Device id or authentication name failed validation
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field
        field: Option<String>,
    },

    /// Configuration or secret material needed by the operation is unusable
    #[error("{source}")]
    Config {
        /// Underlying configuration error
        #[source]
        source: devicetrust_common::Error,
    },

    /// The device is already registered
    #[error("device {device_id} is already registered")]
    Conflict {
        /// Device id
        device_id: String,
    },

    /// The device is not registered
    #[error("device {device_id} is not registered")]
    NotFound {
        /// Device id
        device_id: String,
    },

    /// No CA identity is resident
    #[error("certificate authority is not initialized")]
    NotInitialized,

    /// Certificate issuance failed
    #[error("certificate issuance failed: {0}")]
    Issuance(PkiError),

    /// The broker control plane failed
    #[error("remote registry error: {source}")]
    Remote {
        /// Underlying registry error
        #[source]
        source: RegistryError,
    },

    /// A certificate was minted but the remote registration failed or its
    /// outcome is unknown; the certificate was discarded
    #[error("device {device_id} registration incomplete (remote state {remote_state}): {message}")]
    InconsistentState {
        /// Device id
        device_id: String,
        /// What is known about the remote registration
        remote_state: RemoteState,
        /// Description of the remote failure
        message: String,
        /// Whether the remote failure was transient
        retryable: bool,
    },
}

impl LifecycleError {
    /// Stable machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Config { .. } => "config",
            Self::Conflict { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::NotInitialized => "not_initialized",
            Self::Issuance(_) => "issuance",
            Self::Remote { .. } => "remote",
            Self::InconsistentState { .. } => "inconsistent_state",
        }
    }
}

impl Retryable for LifecycleError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { source } => source.is_retryable(),
            Self::InconsistentState { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

impl From<devicetrust_common::Error> for LifecycleError {
    fn from(err: devicetrust_common::Error) -> Self {
        match err {
            devicetrust_common::Error::Validation { message, field } => {
                Self::Validation { message, field }
            }
            source => Self::Config { source },
        }
    }
}

impl From<PkiError> for LifecycleError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::CaNotInitialized => Self::NotInitialized,
            PkiError::InvalidSubject(message) => Self::Validation {
                message,
                field: None,
            },
            other => Self::Issuance(other),
        }
    }
}

impl From<RegistryError> for LifecycleError {
    fn from(source: RegistryError) -> Self {
        Self::Remote { source }
    }
}

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_keeps_field() {
        let err: LifecycleError =
            devicetrust_common::Error::validation_for_field("deviceId", "too short").into();
        match err {
            LifecycleError::Validation { message, field } => {
                assert_eq!(message, "too short");
                assert_eq!(field.as_deref(), Some("deviceId"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn secret_and_config_failures_are_not_validation() {
        let err: LifecycleError =
            devicetrust_common::Error::secret("file:/etc/ca.key", "permission denied").into();
        assert!(matches!(
            err,
            LifecycleError::Config {
                source: devicetrust_common::Error::Secret { .. }
            }
        ));
        assert_eq!(err.kind(), "config");
        assert!(!err.is_retryable());

        let err: LifecycleError = devicetrust_common::Error::config("no namespace").into();
        assert_eq!(err.kind(), "config");
        assert_eq!(err.to_string(), "configuration error: no namespace");
    }

    #[test]
    fn uninitialized_ca_maps_to_not_initialized() {
        let err: LifecycleError = PkiError::CaNotInitialized.into();
        assert!(matches!(err, LifecycleError::NotInitialized));
        assert_eq!(err.kind(), "not_initialized");
        assert!(!err.is_retryable());
    }

    #[test]
    fn remote_retryability_follows_source() {
        let transient: LifecycleError = RegistryError::transient("list_clients", "503").into();
        assert!(transient.is_retryable());

        let rejected: LifecycleError = RegistryError::rejected("list_clients", "403").into();
        assert!(!rejected.is_retryable());
    }

    #[test]
    fn inconsistent_state_names_remote_state() {
        let err = LifecycleError::InconsistentState {
            device_id: "sensor-001".into(),
            remote_state: RemoteState::Unknown,
            message: "timeout".into(),
            retryable: true,
        };
        assert_eq!(
            err.to_string(),
            "device sensor-001 registration incomplete (remote state unknown): timeout"
        );
        assert!(err.is_retryable());
    }
}
