use std::fmt;

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("No network control plane available: {0}")]
    ControlPlaneUnavailable(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind}: {message}")]
    Network { kind: ErrorKind, message: String },

    /// A non-zero exit with nothing on stdout or stderr.
    #[error("{} {} and no output", .program, exit_text(.status))]
    SilentExit { program: String, status: Option<i32> },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Hotspot '{0}' not found")]
    HotspotNotFound(String),

    #[error("Hotspot '{0}' already exists")]
    HotspotExists(String),

    #[error("Invalid record: {0}")]
    Record(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

fn exit_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exited with status {}", code),
        None => "was terminated by a signal".to_string(),
    }
}

impl NetError {
    /// Builds a network error whose kind is classified from the diagnostic text.
    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        NetError::Network {
            kind: ErrorKind::classify(&message),
            message,
        }
    }

    /// The classified kind, for errors that carry control-plane diagnostics.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetError::Network { kind, .. } => *kind,
            NetError::ControlPlaneUnavailable(_) => ErrorKind::ControlPlaneUnavailable,
            NetError::Timeout(_) => ErrorKind::Timeout,
            NetError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            NetError::Spawn { .. } => ErrorKind::ControlPlaneUnavailable,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Best-effort classification of a control-plane failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    NetworkUnavailable,
    Timeout,
    WifiDisabled,
    PermissionDenied,
    DhcpTimeout,
    ControlPlaneUnavailable,
    Unknown,
}

impl ErrorKind {
    /// Classifies diagnostic text by case-insensitive keyword matching.
    ///
    /// Never fails: text without a known keyword is `Unknown`.
    pub fn classify(text: &str) -> Self {
        let text = text.to_lowercase();
        let has = |needle: &str| text.contains(needle);

        if has("authentication")
            || has("invalid key")
            || has("wrong password")
            || has("secrets were required")
            || has("psk")
        {
            ErrorKind::AuthFailed
        } else if has("no network") || has("not found") || has("unavailable") {
            ErrorKind::NetworkUnavailable
        } else if has("timeout") || has("timed out") {
            ErrorKind::Timeout
        } else if has("permission denied") || has("not authorized") || has("insufficient privileges") {
            ErrorKind::PermissionDenied
        } else if has("wifi") && (has("disabled") || has(" off")) {
            ErrorKind::WifiDisabled
        } else if has("networkmanager") || has("nm-") {
            ErrorKind::ControlPlaneUnavailable
        } else if has("dhcp") || has("ip address") || has("ip configuration") {
            ErrorKind::DhcpTimeout
        } else {
            ErrorKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "authentication failed",
            ErrorKind::NetworkUnavailable => "network unavailable",
            ErrorKind::Timeout => "timed out",
            ErrorKind::WifiDisabled => "wifi disabled",
            ErrorKind::PermissionDenied => "permission denied",
            ErrorKind::DhcpTimeout => "no IP address assigned",
            ErrorKind::ControlPlaneUnavailable => "network control plane unavailable",
            ErrorKind::Unknown => "network error",
        }
    }

    /// A short hint for the operator.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "Check the password and try again",
            ErrorKind::NetworkUnavailable => "Move closer to the access point or rescan",
            ErrorKind::Timeout => "The network may be busy; try again",
            ErrorKind::WifiDisabled => "Enable the radio with `netpilot radio on`",
            ErrorKind::PermissionDenied => "Run with sudo or as a user allowed to manage networking",
            ErrorKind::DhcpTimeout => "The access point did not hand out an address; reconnect or check its DHCP server",
            ErrorKind::ControlPlaneUnavailable => "Start NetworkManager: sudo systemctl start NetworkManager",
            ErrorKind::Unknown => "Run with -v for details",
        }
    }

    /// Whether retrying the same request without changes may succeed.
    pub fn can_retry(&self) -> bool {
        !matches!(self, ErrorKind::AuthFailed | ErrorKind::PermissionDenied)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
