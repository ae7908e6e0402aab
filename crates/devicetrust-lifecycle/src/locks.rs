//! Per-device async locks
//!
//! Serializes the check-then-create sequence for one device id while letting
//! different devices proceed in parallel. Entries are dropped from the map
//! once the last holder or waiter is gone.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Lock registry keyed by device id
#[derive(Debug, Default, Clone)]
pub struct DeviceLocks {
    locks: Arc<LockMap>,
}

/// Exclusive hold on one device id
///
/// Owned and `Send`, so it can move into a spawned task.
#[derive(Debug)]
pub struct DeviceGuard {
    device_id: String,
    locks: Arc<LockMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl DeviceLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `device_id`
    pub async fn acquire(&self, device_id: &str) -> DeviceGuard {
        let mutex = Arc::clone(&self.locks.entry(device_id.to_string()).or_default());
        let guard = mutex.lock_owned().await;

        DeviceGuard {
            device_id: device_id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Number of device ids currently held or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no device id is held or waited on
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl DeviceGuard {
    /// The device id this guard holds
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        // release first so our own Arc no longer counts
        self.guard.take();
        self.locks
            .remove_if(&self.device_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_id_is_exclusive() {
        let locks = DeviceLocks::new();
        let first = locks.acquire("sensor-001").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move { locks2.acquire("sensor-001").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.device_id(), "sensor-001");
    }

    #[tokio::test]
    async fn different_ids_do_not_block() {
        let locks = DeviceLocks::new();
        let _a = locks.acquire("sensor-001").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("sensor-002")).await;
        assert!(b.is_ok());
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn entries_are_removed_after_release() {
        let locks = DeviceLocks::new();
        {
            let _guard = locks.acquire("sensor-001").await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn entry_survives_while_someone_waits() {
        let locks = DeviceLocks::new();
        let first = locks.acquire("sensor-001").await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _g = locks2.acquire("sensor-001").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(first);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
