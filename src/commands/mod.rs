//! CLI commands
//!
//! Each command returns its rendered output so the caller decides where it
//! goes. Structured results are pretty-printed JSON; PEM is returned as is.

use serde::Serialize;

use crate::Result;

pub mod ca;
pub mod inspect;
pub mod register;
pub mod status;
pub mod unregister;

/// Render a value as pretty-printed JSON
pub fn render_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}
