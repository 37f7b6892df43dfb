//! Channel name handling
//!
//! Channel names are plain identifiers (`[A-Za-z0-9_]+`). Anything else a
//! client sends is stripped before the name reaches the database; two names
//! that collapse to the same identifier share one channel.

use crate::error::{RelayError, Result};

/// Strip every character outside `[A-Za-z0-9_]`
pub fn sanitize_channel(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Sanitize a user supplied name, rejecting names with nothing left
pub fn checked_channel(name: &str) -> Result<String> {
    let channel = sanitize_channel(name);
    if channel.is_empty() {
        return Err(RelayError::invalid_channel(name));
    }
    Ok(channel)
}

/// Whether `name` is already a valid channel identifier
pub fn is_valid_channel(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
