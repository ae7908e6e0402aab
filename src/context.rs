//! Settings resolution and service wiring
//!
//! Settings come from an optional YAML file, then CLI flags and environment
//! variables override individual fields. The CA identity is initialized
//! before any command runs; a bad CA configuration stops the process. The
//! broker-backed registry only runs with an intermediate CA.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{info, warn};

use devicetrust_common::config::{CaMode, KeyAlgorithm, SecretSource, Settings};
use devicetrust_common::retry::RetryConfig;
use devicetrust_lifecycle::{CoordinatorOptions, DeviceLifecycleCoordinator};
use devicetrust_pki::{CertificateIssuer, KeyMaterialStore};
use devicetrust_registry::{ControlPlane, DeviceRegistry, EventGridControlPlane, InMemoryControlPlane};

use crate::Result;

/// Flags shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Settings file (YAML)
    #[arg(short = 'c', long, env = "DEVICETRUST_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Keep registrations in process memory instead of the broker (nothing
    /// outlives the process)
    #[arg(long, env = "DEVICETRUST_IN_MEMORY", global = true)]
    pub in_memory: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "DEVICETRUST_LOG_JSON", global = true)]
    pub log_json: bool,

    /// CA mode: self-signed or intermediate
    #[arg(long, env = "DEVICETRUST_CA_MODE", global = true)]
    pub ca_mode: Option<CaMode>,

    /// Issuing CA certificate file (intermediate mode)
    #[arg(long, env = "DEVICETRUST_CA_CERT_FILE", global = true)]
    pub ca_cert_file: Option<PathBuf>,

    /// Issuing CA private key file (intermediate mode)
    #[arg(long, env = "DEVICETRUST_CA_KEY_FILE", global = true)]
    pub ca_key_file: Option<PathBuf>,

    /// Ancestor CA certificates file, nearest issuer first (intermediate mode)
    #[arg(long, env = "DEVICETRUST_CA_CHAIN_FILE", global = true)]
    pub ca_chain_file: Option<PathBuf>,

    /// Key algorithm for generated keys: ecdsa-p256 or ecdsa-p384
    #[arg(long, env = "DEVICETRUST_KEY_ALGORITHM", global = true)]
    pub key_algorithm: Option<KeyAlgorithm>,

    /// Device certificate validity in days
    #[arg(long, env = "DEVICETRUST_VALIDITY_DAYS", global = true)]
    pub validity_days: Option<u32>,

    /// Azure subscription holding the broker namespace
    #[arg(long, env = "DEVICETRUST_SUBSCRIPTION_ID", global = true)]
    pub subscription_id: Option<String>,

    /// Resource group holding the broker namespace
    #[arg(long, env = "DEVICETRUST_RESOURCE_GROUP", global = true)]
    pub resource_group: Option<String>,

    /// Event Grid namespace name
    #[arg(long, env = "DEVICETRUST_NAMESPACE", global = true)]
    pub namespace: Option<String>,

    /// MQTT hostname handed to devices
    #[arg(long, env = "DEVICETRUST_MQTT_HOSTNAME", global = true)]
    pub mqtt_hostname: Option<String>,

    /// Bearer token for the management API
    #[arg(long, env = "DEVICETRUST_ACCESS_TOKEN", hide_env_values = true, global = true)]
    pub access_token: Option<String>,

    /// Azure AD tenant for client-credentials auth
    #[arg(long, env = "AZURE_TENANT_ID", global = true)]
    pub tenant_id: Option<String>,

    /// Azure AD application id for client-credentials auth
    #[arg(long, env = "AZURE_CLIENT_ID", global = true)]
    pub client_id: Option<String>,

    /// Azure AD client secret for client-credentials auth
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true, global = true)]
    pub client_secret: Option<String>,
}

impl GlobalArgs {
    /// Load the settings file, if any, apply overrides and validate
    pub fn resolve_settings(&self) -> Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_yaml_file(path)?,
            None => Settings::default(),
        };
        self.apply(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    /// Overlay flags onto loaded settings
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(mode) = self.ca_mode {
            settings.ca.mode = mode;
        }
        if let Some(path) = &self.ca_cert_file {
            settings.ca.cert = Some(SecretSource::Path(path.clone()));
        }
        if let Some(path) = &self.ca_key_file {
            settings.ca.key = Some(SecretSource::Path(path.clone()));
        }
        if let Some(path) = &self.ca_chain_file {
            settings.ca.chain = Some(SecretSource::Path(path.clone()));
        }
        if let Some(algorithm) = self.key_algorithm {
            settings.ca.key_algorithm = algorithm;
        }
        if let Some(days) = self.validity_days {
            settings.issuance.validity_days = days;
        }

        let broker = &mut settings.broker;
        if let Some(id) = &self.subscription_id {
            broker.subscription_id = id.clone();
        }
        if let Some(group) = &self.resource_group {
            broker.resource_group = group.clone();
        }
        if let Some(namespace) = &self.namespace {
            broker.namespace = namespace.clone();
        }
        if let Some(hostname) = &self.mqtt_hostname {
            broker.mqtt_hostname = Some(hostname.clone());
        }

        let credentials = &mut broker.credentials;
        if let Some(token) = &self.access_token {
            credentials.access_token = Some(SecretSource::Pem(token.clone()));
        }
        if let Some(tenant) = &self.tenant_id {
            credentials.tenant_id = Some(tenant.clone());
        }
        if let Some(client) = &self.client_id {
            credentials.client_id = Some(client.clone());
        }
        if let Some(secret) = &self.client_secret {
            credentials.client_secret = Some(SecretSource::Pem(secret.clone()));
        }
    }
}

/// Wired services for one CLI invocation
#[derive(Debug)]
pub struct App {
    settings: Settings,
    coordinator: DeviceLifecycleCoordinator,
}

impl App {
    /// Resolve settings from flags and build the services
    pub fn from_args(args: &GlobalArgs) -> Result<Self> {
        let settings = args.resolve_settings()?;
        Self::build(settings, args.in_memory)
    }

    /// Connect to a control plane, initialize the CA and wire the coordinator
    ///
    /// A self-signed CA is regenerated on every start, so it is only accepted
    /// with the in-memory registry. Devices registered on the broker must keep
    /// chaining to the same trust anchor across invocations.
    pub fn build(settings: Settings, in_memory: bool) -> Result<Self> {
        let control_plane: Arc<dyn ControlPlane> = if in_memory {
            warn!("Using an in-memory broker registry; registrations end with this process");
            Arc::new(InMemoryControlPlane::new())
        } else {
            if settings.ca.mode == CaMode::SelfSigned {
                return Err(devicetrust_common::Error::validation_for_field(
                    "ca.mode",
                    "the broker registry needs a persistent CA; use ca.mode intermediate \
                     (a self-signed CA lasts only for this process)",
                )
                .into());
            }
            Arc::new(EventGridControlPlane::from_settings(&settings.broker)?)
        };

        let store = Arc::new(KeyMaterialStore::new());
        let identity = store.initialize(&settings.ca)?;
        info!(
            mode = %identity.mode(),
            chain_len = identity.chain().len(),
            "Certificate authority ready"
        );

        let issuer = CertificateIssuer::new(store, settings.issuance.clone());
        let registry = DeviceRegistry::new(control_plane, RetryConfig::from(&settings.retry));
        let coordinator = DeviceLifecycleCoordinator::new(
            issuer,
            registry,
            CoordinatorOptions::from_settings(&settings),
        );

        Ok(Self {
            settings,
            coordinator,
        })
    }

    /// Effective settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The lifecycle coordinator
    pub fn coordinator(&self) -> &DeviceLifecycleCoordinator {
        &self.coordinator
    }
}
