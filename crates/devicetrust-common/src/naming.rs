//! Deterministic names derived from a device id
//!
//! The broker knows a device by two names: the client resource name
//! (`device-{id}`) and the authentication name the TLS subject must match
//! (`{id}-authnID` unless overridden).

use crate::validation::is_valid_device_id;

/// Prefix of every broker client resource created for a device
pub const CLIENT_NAME_PREFIX: &str = "device-";

/// Suffix of the default authentication name
pub const AUTHENTICATION_NAME_SUFFIX: &str = "-authnID";

/// Broker client resource name for a device
pub fn client_name(device_id: &str) -> String {
    format!("{}{}", CLIENT_NAME_PREFIX, device_id)
}

/// Default authentication name (certificate CN) for a device
pub fn default_authentication_name(device_id: &str) -> String {
    format!("{}{}", device_id, AUTHENTICATION_NAME_SUFFIX)
}

/// Resolve the authentication name, preferring an explicit override
pub fn authentication_name(device_id: &str, explicit: Option<&str>) -> String {
    match explicit {
        Some(name) => name.to_string(),
        None => default_authentication_name(device_id),
    }
}

/// Recover the device id from a broker client name
///
/// Returns `None` for clients that were not created for a device: names
/// without the prefix, or whose remainder is not a valid device id.
pub fn device_id_from_client_name(client_name: &str) -> Option<&str> {
    client_name
        .strip_prefix(CLIENT_NAME_PREFIX)
        .filter(|id| is_valid_device_id(id))
}
