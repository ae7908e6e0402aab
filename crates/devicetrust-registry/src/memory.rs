//! In-process control plane
//!
//! Keeps client resources in a map and can be told to fail specific calls.
//! Used for local runs without a broker namespace and as the remote side in
//! coordinator tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::control_plane::{ClientResource, ControlPlane};
use crate::error::{RegistryError, Result};

/// Control-plane call kinds, for fault injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_client`
    Create,
    /// `get_client`
    Get,
    /// `list_clients`
    List,
    /// `delete_client`
    Delete,
}

/// A failure to inject
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a retryable error
    Transient,
    /// Fail with a permanent rejection
    Rejected,
    /// Perform the call, then report a transient error as if the response
    /// was lost
    LostResponse,
}

impl Fault {
    fn error(&self, operation: Operation) -> RegistryError {
        let op = format!("{:?}", operation).to_lowercase();
        match self {
            Fault::Transient | Fault::LostResponse => {
                RegistryError::transient(op, "injected transient failure")
            }
            Fault::Rejected => RegistryError::Rejected {
                operation: op,
                status: Some(400),
                message: "injected rejection".to_string(),
            },
        }
    }
}

#[derive(Default)]
struct State {
    clients: BTreeMap<String, ClientResource>,
    /// One-shot faults consumed in order, per operation
    queued: HashMap<Operation, VecDeque<Fault>>,
    /// Faults applied to every call for a client name
    sticky: HashMap<(Operation, String), Fault>,
    calls: HashMap<Operation, usize>,
}

/// Control plane backed by an in-memory map
#[derive(Default)]
pub struct InMemoryControlPlane {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl std::fmt::Debug for InMemoryControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryControlPlane")
            .field("clients", &self.state.lock().clients.len())
            .field("latency", &self.latency)
            .finish()
    }
}

impl InMemoryControlPlane {
    /// Create an empty control plane
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Insert a client directly, bypassing faults and counters
    pub fn seed(&self, client: ClientResource) {
        self.state.lock().clients.insert(client.name.clone(), client);
    }

    /// Fail the next call of `operation` with `fault`
    pub fn fail_next(&self, operation: Operation, fault: Fault) {
        self.state
            .lock()
            .queued
            .entry(operation)
            .or_default()
            .push_back(fault);
    }

    /// Fail every call of `operation` on `client_name` with `fault`
    pub fn fail_always(&self, operation: Operation, client_name: &str, fault: Fault) {
        self.state
            .lock()
            .sticky
            .insert((operation, client_name.to_string()), fault);
    }

    /// Number of calls made for `operation`
    pub fn calls(&self, operation: Operation) -> usize {
        self.state.lock().calls.get(&operation).copied().unwrap_or(0)
    }

    /// Names of every stored client
    pub fn client_names(&self) -> Vec<String> {
        self.state.lock().clients.keys().cloned().collect()
    }

    /// Record the call and pick the fault, if any, to apply
    async fn enter(&self, operation: Operation, name: &str) -> Option<Fault> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        *state.calls.entry(operation).or_default() += 1;

        if let Some(fault) = state.sticky.get(&(operation, name.to_string())) {
            return Some(fault.clone());
        }
        state
            .queued
            .get_mut(&operation)
            .and_then(|faults| faults.pop_front())
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn create_client(&self, client: &ClientResource) -> Result<ClientResource> {
        let fault = self.enter(Operation::Create, &client.name).await;
        if let Some(fault @ (Fault::Transient | Fault::Rejected)) = &fault {
            return Err(fault.error(Operation::Create));
        }

        let mut state = self.state.lock();
        if state.clients.contains_key(&client.name) {
            return Err(RegistryError::conflict(&client.name));
        }
        state.clients.insert(client.name.clone(), client.clone());
        debug!(client = %client.name, "Stored client");

        match fault {
            Some(fault) => Err(fault.error(Operation::Create)),
            None => Ok(client.clone()),
        }
    }

    async fn get_client(&self, name: &str) -> Result<Option<ClientResource>> {
        if let Some(fault) = self.enter(Operation::Get, name).await {
            return Err(fault.error(Operation::Get));
        }
        Ok(self.state.lock().clients.get(name).cloned())
    }

    async fn list_clients(&self) -> Result<Vec<ClientResource>> {
        if let Some(fault) = self.enter(Operation::List, "").await {
            return Err(fault.error(Operation::List));
        }
        Ok(self.state.lock().clients.values().cloned().collect())
    }

    async fn delete_client(&self, name: &str) -> Result<()> {
        let fault = self.enter(Operation::Delete, name).await;
        if let Some(fault @ (Fault::Transient | Fault::Rejected)) = &fault {
            return Err(fault.error(Operation::Delete));
        }

        let removed = self.state.lock().clients.remove(name);
        if removed.is_none() {
            return Err(RegistryError::not_found(name));
        }
        debug!(client = %name, "Removed client");

        match fault {
            Some(fault) => Err(fault.error(Operation::Delete)),
            None => Ok(()),
        }
    }
}
