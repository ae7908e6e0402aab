//! Registry errors
//!
//! Every remote failure is classified once, at the HTTP boundary, into one of
//! the variants below. Callers decide about retries from the variant alone.

use devicetrust_common::retry::Retryable;
use thiserror::Error;

/// Error from the broker control plane or the registry proxy
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The client resource does not exist
    #[error("client {client_name} not found")]
    NotFound {
        /// Broker client resource name
        client_name: String,
    },

    /// The client resource already exists
    #[error("client {client_name} already exists")]
    Conflict {
        /// Broker client resource name
        client_name: String,
    },

    /// Throttling, server error or timeout; repeating may succeed
    #[error("transient failure during {operation}: {message}")]
    Transient {
        /// Operation that failed (e.g., "get_client")
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// The control plane refused the request; repeating will not help
    #[error("{operation} rejected{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    Rejected {
        /// Operation that failed
        operation: String,
        /// HTTP status, if the failure came from a response
        status: Option<u16>,
        /// Description of what failed
        message: String,
    },

    /// Access token could not be obtained
    #[error("authentication error: {message}")]
    Auth {
        /// Description of what failed
        message: String,
        /// Whether the token endpoint failure was transient
        retryable: bool,
    },

    /// Broker settings are incomplete or secrets unreadable
    #[error(transparent)]
    Config(#[from] devicetrust_common::Error),
}

impl RegistryError {
    /// Create a transient error
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a rejection without an HTTP status
    pub fn rejected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            operation: operation.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Create a not-found error for a client
    pub fn not_found(client_name: impl Into<String>) -> Self {
        Self::NotFound {
            client_name: client_name.into(),
        }
    }

    /// Create a conflict error for a client
    pub fn conflict(client_name: impl Into<String>) -> Self {
        Self::Conflict {
            client_name: client_name.into(),
        }
    }

    /// Whether the error means the resource is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the error means the resource already exists
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl Retryable for RegistryError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Auth { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(RegistryError::transient("get_client", "HTTP 503").is_retryable());
        assert!(RegistryError::Auth {
            message: "token endpoint returned 500".into(),
            retryable: true,
        }
        .is_retryable());

        assert!(!RegistryError::not_found("device-a").is_retryable());
        assert!(!RegistryError::conflict("device-a").is_retryable());
        assert!(!RegistryError::rejected("create_client", "bad request").is_retryable());
        assert!(!RegistryError::Auth {
            message: "invalid_client".into(),
            retryable: false,
        }
        .is_retryable());
    }

    #[test]
    fn rejection_message_includes_status() {
        let err = RegistryError::Rejected {
            operation: "create_client".into(),
            status: Some(400),
            message: "InvalidAuthenticationName".into(),
        };
        assert_eq!(
            err.to_string(),
            "create_client rejected (HTTP 400): InvalidAuthenticationName"
        );
        assert_eq!(
            RegistryError::rejected("list_clients", "bad").to_string(),
            "list_clients rejected: bad"
        );
    }

    #[test]
    fn classification_helpers() {
        assert!(RegistryError::not_found("device-a").is_not_found());
        assert!(RegistryError::conflict("device-a").is_conflict());
        assert!(!RegistryError::conflict("device-a").is_not_found());
    }
}
