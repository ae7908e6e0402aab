//! Unregister commands
//!
//! Removing a registration does not revoke the device's certificate; the
//! broker simply stops accepting it.

use clap::Args;
use serde_json::json;

use crate::commands::render_json;
use crate::{App, Error, Result};

/// Remove a device's broker registration
#[derive(Args, Debug)]
pub struct UnregisterArgs {
    /// Device id
    pub device_id: String,
}

/// Remove every device registration
#[derive(Args, Debug)]
pub struct UnregisterAllArgs {
    /// Confirm removal of every registered device
    #[arg(long)]
    pub yes: bool,
}

pub async fn run(app: &App, args: UnregisterArgs) -> Result<String> {
    app.coordinator().unregister(&args.device_id).await?;
    render_json(&json!({
        "success": true,
        "deviceId": args.device_id,
    }))
}

pub async fn run_all(app: &App, args: UnregisterAllArgs) -> Result<String> {
    if !args.yes {
        return Err(Error::refused(
            "unregister-all removes every device registration; pass --yes to confirm",
        ));
    }
    let report = app.coordinator().unregister_all().await?;
    render_json(&report)
}
