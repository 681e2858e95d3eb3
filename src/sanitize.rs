//! Validation and quoting of user-supplied tokens.
//!
//! Network names, interface names, configuration names and passwords are
//! checked here before they reach any external command.

use crate::error::{NetError, Result};

/// Default capacity for [`shell_escape`], including a terminating byte.
pub const ESCAPE_BUFFER: usize = 512;

/// Quotes `s` for a POSIX shell: `'...'` with every `'` written as `'\''`.
///
/// Returns `None` when the quoted form would not fit in [`ESCAPE_BUFFER`].
pub fn shell_escape(s: &str) -> Option<String> {
    shell_escape_bounded(s, ESCAPE_BUFFER)
}

/// Like [`shell_escape`] with an explicit buffer capacity.
pub fn shell_escape_bounded(s: &str, capacity: usize) -> Option<String> {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');

    // One byte is reserved for the terminator legacy buffers carry.
    if out.len() >= capacity {
        return None;
    }
    Some(out)
}

/// Whether `s` can appear on a command line without quoting.
pub fn is_shell_safe(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b':' | b',' | b'='))
}

/// Network names: 1 to 32 bytes, no NUL.
pub fn validate_identity(ssid: &str) -> Result<()> {
    if ssid.is_empty() {
        return Err(NetError::InvalidInput("network name is empty".to_string()));
    }
    if ssid.len() > 32 {
        return Err(NetError::InvalidInput(format!(
            "network name is {} bytes, the maximum is 32",
            ssid.len()
        )));
    }
    if ssid.contains('\0') {
        return Err(NetError::InvalidInput("network name contains a NUL byte".to_string()));
    }
    Ok(())
}

/// Interface names: 1 to 15 characters of `[A-Za-z0-9_-]`, not starting with `-`.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 15 {
        return Err(NetError::InvalidInput(format!(
            "interface name '{}' must be 1-15 characters",
            name
        )));
    }
    if name.starts_with('-') {
        return Err(NetError::InvalidInput(format!(
            "interface name '{}' must not start with '-'",
            name
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(NetError::InvalidInput(format!(
            "interface name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Configuration and profile names: 1 to 64 characters of `[A-Za-z0-9_.-]`.
pub fn validate_config_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(NetError::InvalidInput(format!(
            "configuration name '{}' must be 1-64 characters",
            name
        )));
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(NetError::InvalidInput(format!(
            "configuration name '{}' contains invalid characters",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(NetError::InvalidInput(format!(
            "configuration name '{}' is reserved",
            name
        )));
    }
    Ok(())
}

/// Checks a password against the network's security descriptor.
///
/// WPA/WPA2/WPA3 passphrases are 8 to 63 characters, WEP keys are 5, 13, 16
/// or 29 characters, and open networks take anything.
pub fn validate_password(password: &str, security: &str) -> Result<()> {
    let security = security.to_uppercase();
    let len = password.chars().count();

    if password.contains('\0') {
        return Err(NetError::InvalidInput("password contains a NUL byte".to_string()));
    }

    if security.contains("WPA") || security.contains("SAE") {
        if !(8..=63).contains(&len) {
            return Err(NetError::InvalidInput(
                "WPA passwords must be 8-63 characters".to_string(),
            ));
        }
    } else if security.contains("WEP") && ![5, 13, 16, 29].contains(&len) {
        return Err(NetError::InvalidInput(
            "WEP keys must be 5, 13, 16 or 29 characters".to_string(),
        ));
    }
    Ok(())
}

/// Whether a security descriptor from a scan means a password is needed.
pub fn requires_password(security: &str) -> bool {
    let security = security.to_uppercase();
    ["WPA", "WEP", "802.1X", "SAE", "ENTERPRISE"]
        .iter()
        .any(|marker| security.contains(marker))
}
