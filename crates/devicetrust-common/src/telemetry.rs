//! Logging initialization
//!
//! Structured logging through `tracing-subscriber`:
//! - `RUST_LOG` overrides the default filter
//! - JSON output for log shippers, or compact human-readable output
//! - Service name attached to the root span
//! - Written to stderr; stdout carries command output

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "info,devicetrust=debug,reqwest=warn,hyper=warn";

/// Configuration for logging initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name recorded with every event
    pub service_name: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "devicetrust".to_string(),
            json: false,
            default_filter: DEFAULT_FILTER.to_string(),
        }
    }
}

/// Initialize the global tracing subscriber
///
/// Fails if a global subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use devicetrust_common::telemetry::{init_telemetry, TelemetryConfig};
///
/// init_telemetry(TelemetryConfig {
///     json: true,
///     ..Default::default()
/// })?;
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_filter))
        .map_err(|e| Error::Telemetry(format!("invalid log filter: {}", e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .try_init()
    };

    result.map_err(|e| Error::Telemetry(e.to_string()))?;

    tracing::debug!(service = %config.service_name, json = config.json, "Logging initialized");
    Ok(())
}
