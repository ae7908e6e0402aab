//! Device lifecycle coordinator
//!
//! Orchestrates certificate issuance and broker registration for one device
//! at a time. The broker registry is the only record of registration; this
//! type keeps no device state of its own beyond per-device locks.
//!
//! Registration order:
//! 1. validate the device id and any authentication name override
//! 2. take the device lock
//! 3. `exists` on the broker; a hit is a conflict and nothing is minted
//! 4. mint the certificate
//! 5. create the broker client; on failure the certificate is dropped
//! 6. return certificate, private key and CA chain
//!
//! Step 5 runs in its own task holding the device lock, so an abandoned
//! caller cannot cut a remote write short.

use std::collections::BTreeSet;

use tracing::{error, info, warn};

use devicetrust_common::config::{Settings, DEFAULT_MQTT_PORT, DEFAULT_VALIDITY_DAYS};
use devicetrust_common::retry::Retryable;
use devicetrust_common::validation::{validate_authentication_name, validate_device_id};
use devicetrust_pki::{CertificateIssuer, PkiError};
use devicetrust_registry::{DeviceRegistry, RegistryError, UnregisterAllReport};

use crate::error::{LifecycleError, RemoteState, Result};
use crate::locks::DeviceLocks;
use crate::response::{DeviceStatus, RegistrationResponse};

/// Coordinator tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Validity of issued device certificates
    pub validity_days: u32,
    /// Broker MQTT hostname for connection instructions
    pub mqtt_hostname: Option<String>,
    /// Broker MQTT port for connection instructions
    pub mqtt_port: u16,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            validity_days: DEFAULT_VALIDITY_DAYS,
            mqtt_hostname: None,
            mqtt_port: DEFAULT_MQTT_PORT,
        }
    }
}

impl CoordinatorOptions {
    /// Options taken from loaded settings
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            validity_days: settings.issuance.validity_days,
            mqtt_hostname: settings.broker.mqtt_hostname.clone(),
            mqtt_port: settings.broker.mqtt_port,
        }
    }
}

/// Coordinates the issuer and the broker registry per device
#[derive(Debug, Clone)]
pub struct DeviceLifecycleCoordinator {
    issuer: CertificateIssuer,
    registry: DeviceRegistry,
    locks: DeviceLocks,
    options: CoordinatorOptions,
}

impl DeviceLifecycleCoordinator {
    /// Create a coordinator
    pub fn new(
        issuer: CertificateIssuer,
        registry: DeviceRegistry,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            issuer,
            registry,
            locks: DeviceLocks::new(),
            options,
        }
    }

    /// Issue a certificate for a new device and register it on the broker
    pub async fn register(
        &self,
        device_id: &str,
        authentication_name: Option<&str>,
    ) -> Result<RegistrationResponse> {
        validate_device_id(device_id)?;
        if let Some(name) = authentication_name {
            validate_authentication_name(name)?;
        }
        let identity = self.issuer.store().identity().map_err(not_initialized)?;

        let guard = self.locks.acquire(device_id).await;

        if self
            .registry
            .exists(device_id)
            .await
            .map_err(|e| remote_error(device_id, e))?
        {
            info!(device_id = %device_id, "Device already registered");
            return Err(LifecycleError::Conflict {
                device_id: device_id.to_string(),
            });
        }

        let issuer = self.issuer.clone();
        let id = device_id.to_string();
        let name = authentication_name.map(str::to_string);
        let validity_days = self.options.validity_days;
        let certificate = tokio::task::spawn_blocking(move || {
            issuer.issue_device_certificate(&id, name.as_deref(), validity_days)
        })
        .await
        .map_err(|e| {
            LifecycleError::Issuance(PkiError::CertificateGenerationFailed(format!(
                "issuance task failed: {}",
                e
            )))
        })?
        .map_err(not_initialized)?;

        let registry = self.registry.clone();
        let id = device_id.to_string();
        let authn = certificate.authentication_name().to_string();
        let remote = tokio::spawn(async move {
            let _guard = guard;
            let outcome = registry.register(&id, &authn).await;
            if let Err(e) = &outcome {
                warn!(
                    device_id = %id,
                    error = %e,
                    "Broker registration failed, discarding certificate"
                );
            }
            outcome
        });

        let registration = match remote.await {
            Ok(Ok(registration)) => registration,
            Ok(Err(e)) => return Err(registration_failure(device_id, e)),
            Err(e) => {
                return Err(LifecycleError::InconsistentState {
                    device_id: device_id.to_string(),
                    remote_state: RemoteState::Unknown,
                    message: format!("registration task failed: {}", e),
                    retryable: false,
                })
            }
        };

        info!(
            device_id = %device_id,
            client = %registration.client_name,
            serial = %certificate.serial_hex(),
            "Device registered"
        );

        Ok(RegistrationResponse::assemble(
            certificate,
            registration,
            identity.ca_certificate_pem().to_string(),
            identity.chain_pem(),
            self.options.mqtt_hostname.clone(),
            self.options.mqtt_port,
        ))
    }

    /// Whether a device is registered, with its names if so
    pub async fn status(&self, device_id: &str) -> Result<DeviceStatus> {
        validate_device_id(device_id)?;
        let registration = self
            .registry
            .get(device_id)
            .await
            .map_err(|e| remote_error(device_id, e))?;
        Ok(DeviceStatus::from_registration(device_id, registration))
    }

    /// Ids of every registered device
    pub async fn list(&self) -> Result<BTreeSet<String>> {
        Ok(self.registry.list().await?)
    }

    /// Remove a device's broker registration
    ///
    /// Issued certificates stay valid until they expire; only the broker
    /// client is removed.
    pub async fn unregister(&self, device_id: &str) -> Result<()> {
        validate_device_id(device_id)?;
        let _guard = self.locks.acquire(device_id).await;

        self.registry
            .unregister(device_id)
            .await
            .map_err(|e| remote_error(device_id, e))
    }

    /// Remove every device registration, collecting per-device failures
    pub async fn unregister_all(&self) -> Result<UnregisterAllReport> {
        let report = self.registry.unregister_all().await?;
        if !report.errors.is_empty() {
            warn!(
                removed = report.removed_count,
                failed = report.errors.len(),
                "Some devices could not be unregistered"
            );
        }
        Ok(report)
    }

    /// Trust anchor PEM: the root-most CA certificate
    pub fn ca_certificate(&self) -> Result<String> {
        let identity = self.issuer.store().identity().map_err(not_initialized)?;
        Ok(identity.ca_certificate_pem().to_string())
    }

    /// Full CA chain PEM, root first
    pub fn ca_chain(&self) -> Result<String> {
        let identity = self.issuer.store().identity().map_err(not_initialized)?;
        Ok(identity.chain_pem())
    }
}

/// Convert a PKI error, alerting when the CA is missing
fn not_initialized(err: PkiError) -> LifecycleError {
    if matches!(err, PkiError::CaNotInitialized) {
        error!("Certificate authority is not initialized; startup did not complete");
    }
    err.into()
}

/// Map a registry error from a device-scoped call
fn remote_error(device_id: &str, err: RegistryError) -> LifecycleError {
    match err {
        RegistryError::NotFound { .. } => LifecycleError::NotFound {
            device_id: device_id.to_string(),
        },
        RegistryError::Conflict { .. } => LifecycleError::Conflict {
            device_id: device_id.to_string(),
        },
        other => other.into(),
    }
}

/// Map a failed create that followed a successful issuance
fn registration_failure(device_id: &str, err: RegistryError) -> LifecycleError {
    if err.is_conflict() {
        info!(device_id = %device_id, "Device was registered concurrently");
        return LifecycleError::Conflict {
            device_id: device_id.to_string(),
        };
    }

    let retryable = err.is_retryable();
    let remote_state = if retryable {
        RemoteState::Unknown
    } else {
        RemoteState::NotCreated
    };
    warn!(
        device_id = %device_id,
        remote_state = %remote_state,
        error = %err,
        "Registration left incomplete"
    );
    LifecycleError::InconsistentState {
        device_id: device_id.to_string(),
        remote_state,
        message: err.to_string(),
        retryable,
    }
}
