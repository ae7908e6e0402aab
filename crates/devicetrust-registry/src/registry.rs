//! Device-level view of the broker's client registry
//!
//! Translates device ids to client resource names and applies the retry
//! policy:
//! - reads (`get`, `exists`, `list`) retry transient failures with backoff
//! - `register` is attempted once; a lost response is not safe to repeat
//! - `unregister` retries transient failures, and a `NotFound` on a retry
//!   means an earlier attempt already removed the client

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use devicetrust_common::naming::{client_name, device_id_from_client_name};
use devicetrust_common::retry::{retry_with_backoff, RetryConfig};

use crate::control_plane::{ClientResource, ClientState, ControlPlane};
use crate::error::{RegistryError, Result};

/// Concurrent deletions during `unregister_all`
const UNREGISTER_ALL_CONCURRENCY: usize = 4;

/// A device's client registration on the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Device id
    pub device_id: String,
    /// Broker client resource name
    pub client_name: String,
    /// Authentication name the certificate CN must match
    pub authentication_name: String,
    /// Connection state
    pub state: ClientState,
}

impl DeviceRegistration {
    fn from_client(device_id: &str, client: ClientResource) -> Self {
        Self {
            device_id: device_id.to_string(),
            client_name: client.name,
            authentication_name: client.authentication_name,
            state: client.state,
        }
    }
}

/// Per-device failure from a bulk operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFailure {
    /// Device whose removal failed
    pub device_id: String,
    /// Why it failed
    pub error: String,
}

/// Outcome of removing every device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterAllReport {
    /// Devices removed
    pub removed_count: usize,
    /// Devices that could not be removed
    pub errors: Vec<DeviceFailure>,
}

/// Registry of device clients on the broker
#[derive(Clone)]
pub struct DeviceRegistry {
    control_plane: Arc<dyn ControlPlane>,
    retry: RetryConfig,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    /// Create a registry over a control plane
    pub fn new(control_plane: Arc<dyn ControlPlane>, retry: RetryConfig) -> Self {
        Self {
            control_plane,
            retry,
        }
    }

    /// Create the client for a device
    ///
    /// Not idempotent: fails with `Conflict` if the client already exists.
    pub async fn register(
        &self,
        device_id: &str,
        authentication_name: &str,
    ) -> Result<DeviceRegistration> {
        let client =
            ClientResource::for_device(&client_name(device_id), authentication_name, device_id);
        let created = self.control_plane.create_client(&client).await?;

        info!(
            device_id = %device_id,
            client = %created.name,
            authentication_name = %created.authentication_name,
            "Registered device client"
        );
        Ok(DeviceRegistration::from_client(device_id, created))
    }

    /// Fetch a device's registration, `None` if absent
    pub async fn get(&self, device_id: &str) -> Result<Option<DeviceRegistration>> {
        let name = client_name(device_id);
        let client = retry_with_backoff(&self.retry, "get_client", || {
            self.control_plane.get_client(&name)
        })
        .await?;

        Ok(client.map(|c| DeviceRegistration::from_client(device_id, c)))
    }

    /// Whether a device has a registration
    pub async fn exists(&self, device_id: &str) -> Result<bool> {
        Ok(self.get(device_id).await?.is_some())
    }

    /// Ids of every registered device
    ///
    /// Clients that were not created for a device are skipped.
    pub async fn list(&self) -> Result<BTreeSet<String>> {
        let clients = retry_with_backoff(&self.retry, "list_clients", || {
            self.control_plane.list_clients()
        })
        .await?;

        let total = clients.len();
        let devices: BTreeSet<String> = clients
            .iter()
            .filter_map(|c| device_id_from_client_name(&c.name))
            .map(str::to_string)
            .collect();

        if devices.len() < total {
            debug!(
                skipped = total - devices.len(),
                "Ignored clients that are not devices"
            );
        }
        Ok(devices)
    }

    /// Remove a device's registration
    ///
    /// Fails with `NotFound` if the device was not registered.
    pub async fn unregister(&self, device_id: &str) -> Result<()> {
        let name = client_name(device_id);
        let attempts = AtomicU32::new(0);

        retry_with_backoff(&self.retry, "delete_client", || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let name = name.as_str();
            async move {
                match self.control_plane.delete_client(name).await {
                    Err(RegistryError::NotFound { .. }) if attempt > 1 => {
                        debug!(
                            client = %name,
                            attempt = attempt,
                            "Client already gone on retry, treating as removed"
                        );
                        Ok(())
                    }
                    other => other,
                }
            }
        })
        .await?;

        info!(device_id = %device_id, client = %name, "Unregistered device client");
        Ok(())
    }

    /// Remove every registered device, best effort
    ///
    /// Fails only if the device list cannot be read; individual removal
    /// failures are collected into the report.
    pub async fn unregister_all(&self) -> Result<UnregisterAllReport> {
        let devices = self.list().await?;
        let total = devices.len();

        let outcomes: Vec<(String, Result<()>)> = stream::iter(devices)
            .map(|device_id| async move {
                let outcome = self.unregister(&device_id).await;
                (device_id, outcome)
            })
            .buffer_unordered(UNREGISTER_ALL_CONCURRENCY)
            .collect()
            .await;

        let mut report = UnregisterAllReport::default();
        for (device_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.removed_count += 1,
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Failed to unregister device");
                    report.errors.push(DeviceFailure {
                        device_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report.errors.sort_by(|a, b| a.device_id.cmp(&b.device_id));

        info!(
            total = total,
            removed = report.removed_count,
            failed = report.errors.len(),
            "Unregistered all devices"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mockall::Sequence;

    use crate::control_plane::MockControlPlane;
    use crate::memory::{Fault, InMemoryControlPlane, Operation};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn device(id: &str) -> ClientResource {
        ClientResource::for_device(&client_name(id), &format!("{}-authnID", id), id)
    }

    fn registry_with(plane: Arc<InMemoryControlPlane>) -> DeviceRegistry {
        DeviceRegistry::new(plane, fast_retry())
    }

    #[tokio::test]
    async fn register_is_attempted_once() {
        let mut mock = MockControlPlane::new();
        mock.expect_create_client()
            .times(1)
            .returning(|_| Err(RegistryError::transient("create_client", "HTTP 503")));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        let err = registry
            .register("sensor-001", "sensor-001-authnID")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Transient { .. }));
    }

    #[tokio::test]
    async fn register_sends_deterministic_names() {
        let mut mock = MockControlPlane::new();
        mock.expect_create_client()
            .withf(|c| {
                c.name == "device-sensor-001"
                    && c.authentication_name == "sensor-001-authnID"
                    && c.device_id.as_deref() == Some("sensor-001")
                    && c.state == ClientState::Enabled
            })
            .times(1)
            .returning(|c| Ok(c.clone()));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        let registration = registry
            .register("sensor-001", "sensor-001-authnID")
            .await
            .unwrap();
        assert_eq!(registration.client_name, "device-sensor-001");
        assert_eq!(registration.device_id, "sensor-001");
    }

    #[tokio::test]
    async fn reads_retry_transient_failures() {
        let mut mock = MockControlPlane::new();
        let mut seq = Sequence::new();
        mock.expect_get_client()
            .withf(|name| name == "device-sensor-001")
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(RegistryError::transient("get_client", "HTTP 429")));
        mock.expect_get_client()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(device("sensor-001"))));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        assert!(registry.exists("sensor-001").await.unwrap());
    }

    #[tokio::test]
    async fn reads_give_up_after_max_attempts() {
        let mut mock = MockControlPlane::new();
        mock.expect_list_clients()
            .times(3)
            .returning(|| Err(RegistryError::transient("list_clients", "timeout")));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        assert!(registry.list().await.is_err());
    }

    #[tokio::test]
    async fn reads_do_not_retry_rejections() {
        let mut mock = MockControlPlane::new();
        mock.expect_get_client()
            .times(1)
            .returning(|_| Err(RegistryError::rejected("get_client", "forbidden")));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        assert!(registry.get("sensor-001").await.is_err());
    }

    #[tokio::test]
    async fn list_strips_prefix_and_skips_foreign_clients() {
        let plane = Arc::new(InMemoryControlPlane::new());
        plane.seed(device("sensor-001"));
        plane.seed(device("cam_02"));
        for foreign in ["grafana", "device-", "device-x", "device-has space", "devices-abc"] {
            plane.seed(ClientResource::for_device(foreign, foreign, foreign));
        }

        let devices = registry_with(plane).list().await.unwrap();
        assert_eq!(
            devices.into_iter().collect::<Vec<_>>(),
            vec!["cam_02".to_string(), "sensor-001".to_string()]
        );
    }

    #[tokio::test]
    async fn unregister_missing_device_is_not_found() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let err = registry_with(plane.clone())
            .unregister("sensor-001")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(plane.calls(Operation::Delete), 1);
    }

    #[tokio::test]
    async fn unregister_treats_not_found_on_retry_as_success() {
        let plane = Arc::new(InMemoryControlPlane::new());
        plane.seed(device("sensor-001"));
        plane.fail_next(Operation::Delete, Fault::LostResponse);

        registry_with(plane.clone())
            .unregister("sensor-001")
            .await
            .unwrap();
        assert_eq!(plane.calls(Operation::Delete), 2);
        assert!(plane.client_names().is_empty());
    }

    #[tokio::test]
    async fn unregister_retries_transient_failures() {
        let mut mock = MockControlPlane::new();
        let mut seq = Sequence::new();
        mock.expect_delete_client()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RegistryError::transient("delete_client", "HTTP 500")));
        mock.expect_delete_client()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let registry = DeviceRegistry::new(Arc::new(mock), fast_retry());
        registry.unregister("sensor-001").await.unwrap();
    }

    #[tokio::test]
    async fn unregister_all_reports_partial_success() {
        let plane = Arc::new(InMemoryControlPlane::new());
        for id in ["aaa", "bbb", "ccc"] {
            plane.seed(device(id));
        }
        plane.fail_always(Operation::Delete, "device-bbb", Fault::Rejected);

        let report = registry_with(plane.clone()).unregister_all().await.unwrap();

        assert_eq!(report.removed_count, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].device_id, "bbb");
        assert_eq!(plane.client_names(), vec!["device-bbb".to_string()]);
    }

    #[tokio::test]
    async fn unregister_all_on_empty_registry() {
        let plane = Arc::new(InMemoryControlPlane::new());
        let report = registry_with(plane).unregister_all().await.unwrap();
        assert_eq!(report, UnregisterAllReport::default());
    }

    #[tokio::test]
    async fn unregister_all_fails_when_listing_fails() {
        let plane = Arc::new(InMemoryControlPlane::new());
        plane.seed(device("aaa"));
        plane.fail_always(Operation::List, "", Fault::Rejected);

        assert!(registry_with(plane.clone()).unregister_all().await.is_err());
        assert_eq!(plane.calls(Operation::Delete), 0);
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = UnregisterAllReport {
            removed_count: 2,
            errors: vec![DeviceFailure {
                device_id: "bbb".into(),
                error: "boom".into(),
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["removedCount"], 2);
        assert_eq!(json["errors"][0]["deviceId"], "bbb");
    }
}
