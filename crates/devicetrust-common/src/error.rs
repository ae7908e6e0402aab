//! Error types shared across devicetrust crates
//!
//! Errors carry the field or source they relate to so that startup failures
//! point at the exact piece of configuration that needs fixing.

use thiserror::Error;

/// Main error type for configuration, validation and secret loading
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed validation (device id, authentication name, settings)
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "deviceId", "issuance.validityDays")
        field: Option<String>,
    },

    /// Configuration could not be loaded or is incomplete
    #[error("configuration error: {message}")]
    Config {
        /// Description of what failed
        message: String,
    },

    /// Secret material could not be read from its source
    #[error("secret error [{source_name}]: {message}")]
    Secret {
        /// Redacted description of the source (e.g., "file:/etc/ca.key")
        source_name: String,
        /// Description of what failed
        message: String,
    },

    /// Telemetry could not be initialized
    #[error("telemetry error: {0}")]
    Telemetry(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error tied to a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a secret loading error for the given source
    pub fn secret(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Secret {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    /// The field a validation error refers to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_carries_field() {
        let err = Error::validation_for_field("deviceId", "must be 3-50 characters");
        assert_eq!(err.field(), Some("deviceId"));
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("3-50"));
    }

    #[test]
    fn plain_validation_error_has_no_field() {
        let err = Error::validation("bad input");
        assert_eq!(err.field(), None);
    }

    #[test]
    fn secret_error_names_source_not_content() {
        let err = Error::secret("env:CA_KEY_PEM", "variable not set");
        let msg = err.to_string();
        assert!(msg.contains("env:CA_KEY_PEM"));
        assert!(msg.contains("variable not set"));
    }

    #[test]
    fn config_error_message() {
        let err = Error::config("intermediate mode requires ca.cert");
        assert!(err.to_string().starts_with("configuration error"));
        assert_eq!(err.field(), None);
    }
}
