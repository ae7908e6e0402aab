//! Input validation for device identifiers and broker authentication names
//!
//! Every check here runs before any cryptographic or remote work begins.
//! Device ids are 3-50 characters of `[A-Za-z0-9_-]`. Authentication names
//! become the certificate subject CN, so they are bounded by the X.509
//! common-name upper limit of 64 characters.

use crate::{Error, Result};

/// Minimum device id length
pub const DEVICE_ID_MIN_LEN: usize = 3;

/// Maximum device id length
pub const DEVICE_ID_MAX_LEN: usize = 50;

/// Minimum authentication name length
pub const AUTHENTICATION_NAME_MIN_LEN: usize = 3;

/// Maximum authentication name length (X.509 ub-common-name)
pub const AUTHENTICATION_NAME_MAX_LEN: usize = 64;

/// Check whether a string is a well-formed device id
pub fn is_valid_device_id(device_id: &str) -> bool {
    validate_device_id(device_id).is_ok()
}

/// Validate a caller-supplied device id
pub fn validate_device_id(device_id: &str) -> Result<()> {
    let len = device_id.chars().count();
    if !(DEVICE_ID_MIN_LEN..=DEVICE_ID_MAX_LEN).contains(&len) {
        return Err(Error::validation_for_field(
            "deviceId",
            format!(
                "device id '{}' must be {}-{} characters, got {}",
                device_id, DEVICE_ID_MIN_LEN, DEVICE_ID_MAX_LEN, len
            ),
        ));
    }

    if let Some(bad) = device_id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(Error::validation_for_field(
            "deviceId",
            format!(
                "device id '{}' contains invalid character '{}', allowed: A-Z a-z 0-9 - _",
                device_id, bad
            ),
        ));
    }

    Ok(())
}

/// Validate an explicit authentication name override
///
/// The broker matches the certificate subject against this name, so it must
/// be encodable as a CN and free of characters that would change how the
/// subject is rendered (`,`, `=`, `+`, whitespace).
pub fn validate_authentication_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if !(AUTHENTICATION_NAME_MIN_LEN..=AUTHENTICATION_NAME_MAX_LEN).contains(&len) {
        return Err(Error::validation_for_field(
            "authenticationName",
            format!(
                "authentication name must be {}-{} characters, got {}",
                AUTHENTICATION_NAME_MIN_LEN, AUTHENTICATION_NAME_MAX_LEN, len
            ),
        ));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')))
    {
        return Err(Error::validation_for_field(
            "authenticationName",
            format!(
                "authentication name '{}' contains invalid character '{}', allowed: A-Z a-z 0-9 - _ . :",
                name, bad
            ),
        ));
    }

    Ok(())
}
