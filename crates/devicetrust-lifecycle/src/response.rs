//! Caller-facing results of lifecycle operations

use serde::Serialize;

use devicetrust_pki::DeviceCertificate;
use devicetrust_registry::{ClientState, DeviceRegistration};

/// MQTT protocol versions the broker accepts from devices
pub const MQTT_PROTOCOLS: &[&str] = &["MQTT v3.1.1", "MQTT v5"];

/// How a device should connect once registered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInstructions {
    /// Broker MQTT hostname, if configured
    pub hostname: Option<String>,
    /// MQTT over TLS port
    pub port: u16,
    /// Supported protocol versions
    pub protocols: Vec<String>,
    /// MQTT client id to present
    pub client_id: String,
    /// Name the certificate CN binds to
    pub authentication_name: String,
    /// Suggested topics for this device
    pub topics: DeviceTopics,
}

/// Per-device topic layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceTopics {
    /// Device-to-cloud telemetry
    pub telemetry: String,
    /// Cloud-to-device commands
    pub commands: String,
    /// Device status reports
    pub status: String,
}

impl DeviceTopics {
    /// Topics under `devices/{device_id}/`
    pub fn for_device(device_id: &str) -> Self {
        Self {
            telemetry: format!("devices/{}/telemetry", device_id),
            commands: format!("devices/{}/commands", device_id),
            status: format!("devices/{}/status", device_id),
        }
    }
}

/// Everything a device needs after registration
///
/// Contains the device private key. It is returned exactly once and never
/// stored; `Debug` output redacts it.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    /// Always true; failures are errors
    pub success: bool,
    /// Device id
    pub device_id: String,
    /// Certificate CN and broker authentication name
    pub authentication_name: String,
    /// Broker client resource name
    pub client_name: String,
    /// Device certificate PEM
    pub certificate: String,
    /// Device private key PEM
    pub private_key: String,
    /// Device public key PEM
    pub public_key: String,
    /// Trust anchor PEM (root-most CA certificate)
    pub ca_certificate: String,
    /// Full CA chain PEM, root first
    pub ca_chain: String,
    /// Certificate validity in days
    pub validity_days: u32,
    /// Certificate serial number, hex
    pub serial_number: String,
    /// Start of validity, RFC 3339
    pub not_before: String,
    /// End of validity, RFC 3339
    pub not_after: String,
    /// Broker MQTT hostname, if configured
    pub mqtt_hostname: Option<String>,
    /// Connection details
    pub instructions: ConnectionInstructions,
}

impl std::fmt::Debug for RegistrationResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationResponse")
            .field("device_id", &self.device_id)
            .field("authentication_name", &self.authentication_name)
            .field("client_name", &self.client_name)
            .field("serial_number", &self.serial_number)
            .field("not_after", &self.not_after)
            .field("private_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl RegistrationResponse {
    pub(crate) fn assemble(
        certificate: DeviceCertificate,
        registration: DeviceRegistration,
        ca_certificate: String,
        ca_chain: String,
        mqtt_hostname: Option<String>,
        mqtt_port: u16,
    ) -> Self {
        let instructions = ConnectionInstructions {
            hostname: mqtt_hostname.clone(),
            port: mqtt_port,
            protocols: MQTT_PROTOCOLS.iter().map(|p| p.to_string()).collect(),
            client_id: registration.client_name.clone(),
            authentication_name: registration.authentication_name.clone(),
            topics: DeviceTopics::for_device(&registration.device_id),
        };

        Self {
            success: true,
            serial_number: certificate.serial_hex(),
            not_before: certificate.not_before_rfc3339(),
            not_after: certificate.not_after_rfc3339(),
            validity_days: certificate.validity_days(),
            certificate: certificate.certificate_pem().to_string(),
            private_key: certificate.private_key_pem().to_string(),
            public_key: certificate.public_key_pem().to_string(),
            device_id: registration.device_id,
            authentication_name: registration.authentication_name,
            client_name: registration.client_name,
            ca_certificate,
            ca_chain,
            mqtt_hostname,
            instructions,
        }
    }
}

/// Registration state of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Device id
    pub device_id: String,
    /// Whether a broker client exists for the device
    pub registered: bool,
    /// Broker client resource name, if registered
    pub client_name: Option<String>,
    /// Authentication name, if registered
    pub authentication_name: Option<String>,
    /// Connection state, if registered
    pub state: Option<ClientState>,
}

impl DeviceStatus {
    pub(crate) fn from_registration(
        device_id: &str,
        registration: Option<DeviceRegistration>,
    ) -> Self {
        match registration {
            Some(r) => Self {
                device_id: device_id.to_string(),
                registered: true,
                client_name: Some(r.client_name),
                authentication_name: Some(r.authentication_name),
                state: Some(r.state),
            },
            None => Self {
                device_id: device_id.to_string(),
                registered: false,
                client_name: None,
                authentication_name: None,
                state: None,
            },
        }
    }
}
