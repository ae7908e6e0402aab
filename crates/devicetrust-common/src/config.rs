//! Service configuration
//!
//! Settings are read from an optional YAML file and then overlaid by CLI
//! flags and environment variables in the binary. Every field has a default
//! so a minimal file only names what differs:
//!
//! ```yaml
//! ca:
//!   mode: intermediate
//!   cert: { path: /etc/devicetrust/issuing-ca.pem }
//!   key: { env: DEVICETRUST_CA_KEY_PEM }
//!   chain: { path: /etc/devicetrust/root-ca.pem }
//! issuance:
//!   validityDays: 180
//! broker:
//!   subscriptionId: 00000000-0000-0000-0000-000000000000
//!   resourceGroup: makerspace
//!   namespace: makerspace-eventgrid
//!   mqttHostname: makerspace-eventgrid.westus2-1.ts.eventgrid.azure.net
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::{Error, Result};

/// Default device certificate validity in days
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// Upper bound on device certificate validity (the CA's own lifetime)
pub const MAX_VALIDITY_DAYS: u32 = 3650;

/// Default MQTT over TLS port
pub const DEFAULT_MQTT_PORT: u16 = 8883;

/// Default ARM endpoint for the broker control plane
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://management.azure.com";

/// Default Event Grid namespace API version
pub const DEFAULT_API_VERSION: &str = "2025-02-15";

/// Default Azure AD authority
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";

/// Default OAuth scope for the ARM control plane
pub const DEFAULT_MANAGEMENT_SCOPE: &str = "https://management.azure.com/.default";

/// Top-level settings
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Certificate authority key material
    pub ca: CaSettings,
    /// Device certificate issuance
    pub issuance: IssuanceSettings,
    /// Broker control plane connection
    pub broker: BrokerSettings,
    /// Retry policy for remote reads
    pub retry: RetrySettings,
}

impl Settings {
    /// Parse settings from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::config(format!("invalid settings: {}", e)))
    }

    /// Load settings from a YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&data)
    }

    /// Validate settings that do not require contacting anything external
    pub fn validate(&self) -> Result<()> {
        self.ca.validate()?;
        self.issuance.validate()?;
        self.retry.validate()?;

        if self.issuance.organizational_unit == self.ca.organizational_unit {
            return Err(Error::validation_for_field(
                "issuance.organizationalUnit",
                format!(
                    "device OU '{}' must differ from the CA OU so device certificates are distinguishable",
                    self.issuance.organizational_unit
                ),
            ));
        }

        if self.broker.mqtt_port == 0 {
            return Err(Error::validation_for_field(
                "broker.mqttPort",
                "port must be non-zero",
            ));
        }

        Ok(())
    }
}

/// How the CA identity is obtained at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaMode {
    /// Generate a fresh self-signed root in memory
    #[default]
    SelfSigned,
    /// Load an issuing CA and its ancestors from secret material
    Intermediate,
}

impl FromStr for CaMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "selfsigned" => Ok(CaMode::SelfSigned),
            "intermediate" => Ok(CaMode::Intermediate),
            other => Err(Error::validation_for_field(
                "ca.mode",
                format!("unknown CA mode '{}', expected self-signed or intermediate", other),
            )),
        }
    }
}

impl fmt::Display for CaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaMode::SelfSigned => write!(f, "self-signed"),
            CaMode::Intermediate => write!(f, "intermediate"),
        }
    }
}

/// Key algorithm for generated key pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyAlgorithm {
    /// ECDSA on P-256 with SHA-256
    #[default]
    EcdsaP256,
    /// ECDSA on P-384 with SHA-384
    EcdsaP384,
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "ecdsap256" | "p256" => Ok(KeyAlgorithm::EcdsaP256),
            "ecdsap384" | "p384" => Ok(KeyAlgorithm::EcdsaP384),
            other => Err(Error::validation_for_field(
                "ca.keyAlgorithm",
                format!("unknown key algorithm '{}', expected ecdsa-p256 or ecdsa-p384", other),
            )),
        }
    }
}

/// Where a piece of secret material comes from
///
/// In YAML this is a single-key map: `{ pem: "..." }`, `{ path: ... }` or
/// `{ env: NAME }`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SecretSourceSpec")]
pub enum SecretSource {
    /// Inline PEM content
    Pem(String),
    /// Path to a file holding the PEM content
    Path(PathBuf),
    /// Environment variable holding the PEM content
    Env(String),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SecretSourceSpec {
    pem: Option<String>,
    path: Option<PathBuf>,
    env: Option<String>,
}

impl TryFrom<SecretSourceSpec> for SecretSource {
    type Error = String;

    fn try_from(fields: SecretSourceSpec) -> std::result::Result<Self, Self::Error> {
        match (fields.pem, fields.path, fields.env) {
            (Some(pem), None, None) => Ok(SecretSource::Pem(pem)),
            (None, Some(path), None) => Ok(SecretSource::Path(path)),
            (None, None, Some(env)) => Ok(SecretSource::Env(env)),
            _ => Err("secret source must set exactly one of pem, path, env".to_string()),
        }
    }
}

impl SecretSource {
    /// Redacted description safe for logs and error messages
    pub fn describe(&self) -> String {
        match self {
            SecretSource::Pem(_) => "inline".to_string(),
            SecretSource::Path(path) => format!("file:{}", path.display()),
            SecretSource::Env(name) => format!("env:{}", name),
        }
    }

    /// Read the secret content
    pub fn resolve(&self) -> Result<String> {
        let content = match self {
            SecretSource::Pem(pem) => pem.clone(),
            SecretSource::Path(path) => std::fs::read_to_string(path)
                .map_err(|e| Error::secret(self.describe(), e.to_string()))?,
            SecretSource::Env(name) => std::env::var(name)
                .map_err(|e| Error::secret(self.describe(), e.to_string()))?,
        };

        if content.trim().is_empty() {
            return Err(Error::secret(self.describe(), "secret is empty"));
        }
        Ok(content)
    }
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretSource({})", self.describe())
    }
}

/// Certificate authority settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaSettings {
    /// Self-signed or loaded intermediate
    pub mode: CaMode,
    /// Subject CN of a generated CA
    pub common_name: String,
    /// Subject O of a generated CA
    pub organization: String,
    /// Subject OU of a generated CA
    pub organizational_unit: String,
    /// Subject C of a generated CA
    pub country: String,
    /// Subject ST of a generated CA
    pub state: String,
    /// Subject L of a generated CA
    pub locality: String,
    /// Algorithm for the generated CA key and device keys
    pub key_algorithm: KeyAlgorithm,
    /// Issuing certificate (intermediate mode)
    pub cert: Option<SecretSource>,
    /// Issuing private key, PKCS#8 PEM (intermediate mode)
    pub key: Option<SecretSource>,
    /// Ancestor certificates, nearest issuer first (intermediate mode)
    pub chain: Option<SecretSource>,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            mode: CaMode::SelfSigned,
            common_name: "Makerspace Device CA".to_string(),
            organization: "Makerspace".to_string(),
            organizational_unit: "Certificate Authority".to_string(),
            country: "US".to_string(),
            state: "WA".to_string(),
            locality: "Seattle".to_string(),
            key_algorithm: KeyAlgorithm::EcdsaP256,
            cert: None,
            key: None,
            chain: None,
        }
    }
}

impl CaSettings {
    fn validate(&self) -> Result<()> {
        match self.mode {
            CaMode::Intermediate => {
                if self.cert.is_none() {
                    return Err(Error::config("intermediate CA mode requires ca.cert"));
                }
                if self.key.is_none() {
                    return Err(Error::config("intermediate CA mode requires ca.key"));
                }
                if self.chain.is_none() {
                    return Err(Error::config(
                        "intermediate CA mode requires ca.chain with at least the root certificate",
                    ));
                }
            }
            CaMode::SelfSigned => {
                if self.cert.is_some() || self.key.is_some() || self.chain.is_some() {
                    warn!("ca.cert/ca.key/ca.chain are ignored in self-signed mode");
                }
                if self.common_name.trim().is_empty() {
                    return Err(Error::validation_for_field(
                        "ca.commonName",
                        "CA common name must not be empty",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Device certificate issuance settings
///
/// Subject fields other than the CN are fixed for every device certificate.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IssuanceSettings {
    /// Validity window in days
    pub validity_days: u32,
    /// Subject C
    pub country: String,
    /// Subject ST
    pub state: String,
    /// Subject L
    pub locality: String,
    /// Subject O
    pub organization: String,
    /// Subject OU (must differ from the CA OU)
    pub organizational_unit: String,
}

impl Default for IssuanceSettings {
    fn default() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
            country: "US".to_string(),
            state: "WA".to_string(),
            locality: "Seattle".to_string(),
            organization: "Makerspace".to_string(),
            organizational_unit: "IoT Devices".to_string(),
        }
    }
}

impl IssuanceSettings {
    fn validate(&self) -> Result<()> {
        if !(1..=MAX_VALIDITY_DAYS).contains(&self.validity_days) {
            return Err(Error::validation_for_field(
                "issuance.validityDays",
                format!(
                    "validity must be 1-{} days, got {}",
                    MAX_VALIDITY_DAYS, self.validity_days
                ),
            ));
        }
        Ok(())
    }
}

/// Broker control plane settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerSettings {
    /// ARM endpoint
    pub endpoint: String,
    /// Event Grid API version
    pub api_version: String,
    /// Azure subscription id
    pub subscription_id: String,
    /// Resource group holding the namespace
    pub resource_group: String,
    /// Event Grid namespace name
    pub namespace: String,
    /// MQTT hostname handed to devices in registration responses
    pub mqtt_hostname: Option<String>,
    /// MQTT port handed to devices
    pub mqtt_port: u16,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Control plane credentials
    pub credentials: BrokerCredentials,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            subscription_id: String::new(),
            resource_group: String::new(),
            namespace: String::new(),
            mqtt_hostname: None,
            mqtt_port: DEFAULT_MQTT_PORT,
            request_timeout_secs: 30,
            credentials: BrokerCredentials::default(),
        }
    }
}

impl BrokerSettings {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Validate the fields needed to address the remote namespace
    pub fn validate_remote(&self) -> Result<()> {
        for (field, value) in [
            ("broker.subscriptionId", &self.subscription_id),
            ("broker.resourceGroup", &self.resource_group),
            ("broker.namespace", &self.namespace),
            ("broker.endpoint", &self.endpoint),
            ("broker.apiVersion", &self.api_version),
        ] {
            if value.trim().is_empty() {
                return Err(Error::validation_for_field(field, "must not be empty"));
            }
        }
        Ok(())
    }
}

/// Credentials for the broker control plane
///
/// Either a pre-issued bearer token or Azure AD client credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerCredentials {
    /// Azure AD authority
    pub authority: String,
    /// Azure AD tenant id
    pub tenant_id: Option<String>,
    /// Application (client) id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<SecretSource>,
    /// Pre-issued bearer token (takes precedence over client credentials)
    pub access_token: Option<SecretSource>,
    /// OAuth scope requested for the control plane
    pub scope: String,
}

impl Default for BrokerCredentials {
    fn default() -> Self {
        Self {
            authority: DEFAULT_AUTHORITY.to_string(),
            tenant_id: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            scope: DEFAULT_MANAGEMENT_SCOPE.to_string(),
        }
    }
}

/// Retry policy for remote reads
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySettings {
    /// Maximum attempts including the first
    pub max_attempts: u32,
    /// Initial backoff in milliseconds
    pub initial_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation_for_field(
                "retry.maxAttempts",
                "must be at least 1",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::validation_for_field(
                "retry.backoffMultiplier",
                "must be at least 1.0",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::validation_for_field(
                "retry.initialDelayMs",
                "must not exceed retry.maxDelayMs",
            ));
        }
        Ok(())
    }
}
