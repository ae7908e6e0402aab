//! Broker control-plane abstraction
//!
//! Provides a trait over the broker's client registry, allowing tests to
//! mock or simulate the remote side while production code talks to the
//! Event Grid management API.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::error::Result;

/// Whether the broker accepts connections for a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientState {
    /// Client may connect
    #[default]
    Enabled,
    /// Client exists but is refused
    Disabled,
}

/// A client resource in the broker's registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResource {
    /// Resource name (`device-{id}` for devices)
    pub name: String,
    /// Name the TLS client certificate subject must match
    pub authentication_name: String,
    /// Connection state
    pub state: ClientState,
    /// Free-form description
    pub description: Option<String>,
    /// `deviceId` attribute, if the client was created for a device
    pub device_id: Option<String>,
}

impl ClientResource {
    /// Describe a new enabled device client
    pub fn for_device(client_name: &str, authentication_name: &str, device_id: &str) -> Self {
        Self {
            name: client_name.to_string(),
            authentication_name: authentication_name.to_string(),
            state: ClientState::Enabled,
            description: Some(format!("IoT device client for {}", device_id)),
            device_id: Some(device_id.to_string()),
        }
    }
}

/// Trait abstracting the broker's client registry
///
/// Implementations classify every failure into a [`crate::RegistryError`]
/// variant; they never retry on their own.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Create a client; fails with `Conflict` if the name is taken
    async fn create_client(&self, client: &ClientResource) -> Result<ClientResource>;

    /// Fetch a client by name, `None` if absent
    async fn get_client(&self, name: &str) -> Result<Option<ClientResource>>;

    /// List every client in the namespace, devices or not
    async fn list_clients(&self) -> Result<Vec<ClientResource>>;

    /// Delete a client; fails with `NotFound` if absent
    async fn delete_client(&self, name: &str) -> Result<()>;
}
