//! devicetrust CLI
//!
//! Issues device certificates and manages their broker registrations.

use clap::Parser;

use devicetrust::Cli;
use devicetrust_common::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        json: cli.global.log_json,
        ..Default::default()
    })?;

    cli.run().await?;
    Ok(())
}
