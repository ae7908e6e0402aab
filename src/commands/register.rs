//! Register command
//!
//! Issues a device certificate, registers the device on the broker and
//! either prints the full registration (including the private key) or
//! writes the credentials into a directory the way a device expects them:
//! `device.crt`, `device.key` and `ca.crt`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::Serialize;
use tracing::info;

use devicetrust_lifecycle::RegistrationResponse;

use crate::commands::render_json;
use crate::{App, Result};

/// Issue a certificate for a new device and register it
#[derive(Args, Debug)]
pub struct RegisterArgs {
    /// Device id (3-50 characters: A-Z a-z 0-9 - _)
    pub device_id: String,

    /// Authentication name for the certificate CN (default `{device_id}-authnID`)
    #[arg(long)]
    pub authentication_name: Option<String>,

    /// Write device.crt, device.key and ca.crt here instead of printing the key
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

/// Paths of written credential files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialFiles {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub ca_certificate: PathBuf,
}

/// Registration summary printed when credentials go to disk
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterSummary<'a> {
    success: bool,
    device_id: &'a str,
    authentication_name: &'a str,
    client_name: &'a str,
    serial_number: &'a str,
    not_after: &'a str,
    mqtt_hostname: Option<&'a str>,
    files: CredentialFiles,
}

pub async fn run(app: &App, args: RegisterArgs) -> Result<String> {
    let response = app
        .coordinator()
        .register(&args.device_id, args.authentication_name.as_deref())
        .await?;

    let Some(dir) = args.out_dir else {
        return render_json(&response);
    };

    let files = write_credentials(&dir, &response)?;
    info!(
        device_id = %response.device_id,
        dir = %dir.display(),
        "Wrote device credentials"
    );

    render_json(&RegisterSummary {
        success: response.success,
        device_id: &response.device_id,
        authentication_name: &response.authentication_name,
        client_name: &response.client_name,
        serial_number: &response.serial_number,
        not_after: &response.not_after,
        mqtt_hostname: response.mqtt_hostname.as_deref(),
        files,
    })
}

/// Write certificate, key and CA chain into `dir`
///
/// The key file is created owner-read/write only on Unix.
pub fn write_credentials(dir: &Path, response: &RegistrationResponse) -> Result<CredentialFiles> {
    fs::create_dir_all(dir)?;

    let files = CredentialFiles {
        certificate: dir.join("device.crt"),
        private_key: dir.join("device.key"),
        ca_certificate: dir.join("ca.crt"),
    };

    fs::write(&files.certificate, &response.certificate)?;
    write_private(&files.private_key, &response.private_key)?;
    fs::write(&files.ca_certificate, &response.ca_chain)?;

    Ok(files)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicetrust_common::config::Settings;
    use devicetrust_pki::{verify_signed_by, CertificateInfo};

    fn app() -> App {
        App::build(Settings::default(), true).unwrap()
    }

    #[tokio::test]
    async fn prints_full_registration_without_out_dir() {
        let app = app();
        let output = run(
            &app,
            RegisterArgs {
                device_id: "sensor-001".to_string(),
                authentication_name: None,
                out_dir: None,
            },
        )
        .await
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["authenticationName"], "sensor-001-authnID");
        assert_eq!(json["clientName"], "device-sensor-001");
        assert!(json["privateKey"].as_str().unwrap().contains("PRIVATE KEY"));
        assert_eq!(json["instructions"]["port"], 8883);
    }

    #[tokio::test]
    async fn writes_credentials_and_omits_key_from_output() {
        let app = app();
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("sensor-002");

        let output = run(
            &app,
            RegisterArgs {
                device_id: "sensor-002".to_string(),
                authentication_name: Some("bench-02".to_string()),
                out_dir: Some(out_dir.clone()),
            },
        )
        .await
        .unwrap();

        let json: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert!(json.get("privateKey").is_none());
        assert_eq!(json["authenticationName"], "bench-02");

        let cert = fs::read_to_string(out_dir.join("device.crt")).unwrap();
        let key = fs::read_to_string(out_dir.join("device.key")).unwrap();
        let ca = fs::read_to_string(out_dir.join("ca.crt")).unwrap();

        assert_eq!(CertificateInfo::from_pem(&cert).unwrap().common_name, "bench-02");
        assert!(key.contains("PRIVATE KEY"));
        assert!(verify_signed_by(&cert, &ca).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let app = app();
        let dir = tempfile::tempdir().unwrap();
        let response = app.coordinator().register("sensor-003", None).await.unwrap();

        let files = write_credentials(dir.path(), &response).unwrap();
        let mode = fs::metadata(&files.private_key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let app = app();
        let args = || RegisterArgs {
            device_id: "sensor-004".to_string(),
            authentication_name: None,
            out_dir: None,
        };
        run(&app, args()).await.unwrap();

        let err = run(&app, args()).await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }
}
