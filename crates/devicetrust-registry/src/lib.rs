//! Broker control-plane proxy for device client registrations
//!
//! The broker's client registry is the only record of which devices are
//! registered. This crate talks to it through the [`ControlPlane`] trait and
//! layers device naming and retry policy on top in [`DeviceRegistry`].
//!
//! Implementations:
//! - [`EventGridControlPlane`]: Azure Event Grid namespace clients via ARM
//! - [`InMemoryControlPlane`]: process-local map with fault injection

#![deny(missing_docs)]

pub mod auth;
pub mod control_plane;
pub mod error;
pub mod eventgrid;
pub mod memory;
pub mod registry;

pub use auth::{ClientCredentials, StaticToken, TokenProvider};
pub use control_plane::{ClientResource, ClientState, ControlPlane};
pub use error::{RegistryError, Result};
pub use eventgrid::EventGridControlPlane;
pub use memory::{Fault, InMemoryControlPlane, Operation};
pub use registry::{DeviceFailure, DeviceRegistration, DeviceRegistry, UnregisterAllReport};
