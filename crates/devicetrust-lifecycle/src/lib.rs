//! Device registration lifecycle for devicetrust
//!
//! Ties certificate issuance to broker client registration so a device either
//! ends up with both a certificate and a broker client, or with neither.

#![deny(missing_docs)]

pub mod coordinator;
pub mod error;
pub mod locks;
pub mod response;

pub use coordinator::{CoordinatorOptions, DeviceLifecycleCoordinator};
pub use error::{LifecycleError, RemoteState, Result};
pub use locks::{DeviceGuard, DeviceLocks};
pub use response::{ConnectionInstructions, DeviceStatus, DeviceTopics, RegistrationResponse};
