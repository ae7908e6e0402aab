//! Error types for the CLI

use devicetrust_lifecycle::LifecycleError;
use devicetrust_pki::PkiError;
use devicetrust_registry::RegistryError;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] devicetrust_common::Error),

    #[error(transparent)]
    Pki(#[from] PkiError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{message}")]
    Refused { message: String },
}

impl Error {
    pub fn refused(message: impl Into<String>) -> Self {
        Error::Refused {
            message: message.into(),
        }
    }
}
