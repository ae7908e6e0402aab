//! Status and list commands

use clap::Args;

use crate::commands::render_json;
use crate::{App, Result};

/// Show whether a device is registered
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Device id
    pub device_id: String,
}

pub async fn run(app: &App, args: StatusArgs) -> Result<String> {
    let status = app.coordinator().status(&args.device_id).await?;
    render_json(&status)
}

pub async fn list(app: &App) -> Result<String> {
    let devices = app.coordinator().list().await?;
    render_json(&devices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicetrust_common::config::Settings;

    #[tokio::test]
    async fn unknown_device_reports_unregistered() {
        let app = App::build(Settings::default(), true).unwrap();
        let output = run(
            &app,
            StatusArgs {
                device_id: "sensor-404".to_string(),
            },
        )
        .await
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["deviceId"], "sensor-404");
        assert_eq!(json["registered"], false);
    }

    #[tokio::test]
    async fn list_renders_sorted_ids() {
        let app = App::build(Settings::default(), true).unwrap();
        for id in ["sensor-b", "sensor-a"] {
            app.coordinator().register(id, None).await.unwrap();
        }

        let output = list(&app).await.unwrap();
        let ids: Vec<String> = serde_json::from_str(&output).unwrap();
        assert_eq!(ids, vec!["sensor-a", "sensor-b"]);
    }
}
