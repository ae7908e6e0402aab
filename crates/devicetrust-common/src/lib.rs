//! Common building blocks for devicetrust: errors, configuration, validation,
//! deterministic naming, retry and logging setup.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod naming;
pub mod retry;
pub mod telemetry;
pub mod validation;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
