//! The capability set every network control plane backend provides.
//!
//! Higher layers depend only on [`Backend`]; the concrete implementation is
//! chosen once at startup by [`select`] and handed to them through
//! [`NetContext`](crate::NetContext).

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{NetError, Result};
use crate::exec::CommandRunner;
use crate::hotspot::{HotspotConfig, HotspotState};
use crate::interface::WifiInterface;
use crate::iw::Station;
use crate::scan::Network;

pub mod nmcli;
pub mod parse;

pub use nmcli::NmcliBackend;

/// State of a connection profile as reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileState {
    Activating,
    Activated,
    Deactivating,
    Deactivated,
    Unknown,
}

impl ProfileState {
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "activating" => ProfileState::Activating,
            "activated" => ProfileState::Activated,
            "deactivating" => ProfileState::Deactivating,
            "deactivated" => ProfileState::Deactivated,
            _ => ProfileState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileState::Activating => "activating",
            ProfileState::Activated => "activated",
            ProfileState::Deactivating => "deactivating",
            ProfileState::Deactivated => "deactivated",
            ProfileState::Unknown => "unknown",
        }
    }
}

/// An entry of the active-connection listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveConnection {
    pub name: String,
    /// Profile type, e.g. `802-11-wireless`.
    pub kind: String,
    pub device: Option<String>,
    pub state: ProfileState,
}

impl ActiveConnection {
    pub fn is_wifi(&self) -> bool {
        self.kind == parse::WIFI_TYPE || self.kind == "wifi"
    }
}

/// A saved connection profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub name: String,
    pub kind: String,
}

impl Profile {
    pub fn is_wifi(&self) -> bool {
        self.kind == parse::WIFI_TYPE || self.kind == "wifi"
    }
}

/// Point-in-time view of the WiFi connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    pub profile: Option<String>,
    pub device: Option<String>,
    pub ip_address: Option<String>,
}

/// Network operations implemented against one control plane.
///
/// Every method issues one or more external commands and returns as soon as
/// they exit; none of them polls.
pub trait Backend: Send + Sync {
    /// Short name used in logs, e.g. `nmcli`.
    fn name(&self) -> &'static str;

    /// Whether the control plane is installed and running.
    fn is_available(&self) -> bool;

    // ── Scanning ──

    /// Networks from the most recent scan.
    fn scan_networks(&self) -> Result<Vec<Network>>;

    /// Requests a fresh scan.
    fn rescan(&self) -> Result<()>;

    // ── Station connections ──

    /// Connects to an open network.
    fn connect_open(&self, ssid: &str) -> Result<()>;

    /// Creates a WPA-PSK profile named after `ssid` and activates it.
    fn connect_secured(&self, ssid: &str, psk: &str) -> Result<()>;

    fn profile_exists(&self, name: &str) -> Result<bool>;
    fn activate_profile(&self, name: &str) -> Result<()>;
    fn deactivate_profile(&self, name: &str) -> Result<()>;
    fn delete_profile(&self, name: &str) -> Result<()>;

    /// Device-level disconnect, independent of any profile.
    fn disconnect_device(&self, iface: &str) -> Result<()>;

    /// Hands the interface to, or takes it from, the control plane.
    fn set_managed(&self, iface: &str, managed: bool) -> Result<()>;

    fn active_connections(&self) -> Result<Vec<ActiveConnection>>;

    /// SSID of the visible network marked active, as seen by `iface` when given.
    fn active_ssid(&self, iface: Option<&str>) -> Result<Option<String>>;

    /// IPv4 address of an active profile.
    fn query_ip_address(&self, profile: &str) -> Result<Option<String>>;

    /// Whether an active WiFi entry is a client connection rather than an access point.
    ///
    /// An unreadable mode counts as a station.
    fn is_station(&self, conn: &ActiveConnection) -> bool {
        match self.profile_mode(&conn.name) {
            Ok(mode) => mode.as_deref() != Some("ap"),
            Err(e) => {
                debug!("mode of {} unknown: {}", conn.name, e);
                true
            }
        }
    }

    /// One read of the active station connection. Hotspots are not reported.
    fn query_connection_status(&self) -> Result<ConnectionStatus> {
        let active = self.active_connections()?;
        let Some(wifi) = active
            .into_iter()
            .find(|c| c.is_wifi() && c.state == ProfileState::Activated && self.is_station(c))
        else {
            return Ok(ConnectionStatus::default());
        };

        let ssid = self.active_ssid(wifi.device.as_deref())?;
        let ip_address = self.query_ip_address(&wifi.name)?;
        Ok(ConnectionStatus {
            connected: true,
            ssid: ssid.or_else(|| Some(wifi.name.clone())),
            profile: Some(wifi.name),
            device: wifi.device,
            ip_address,
        })
    }

    fn wifi_enabled(&self) -> Result<bool>;
    fn set_wifi_enabled(&self, enabled: bool) -> Result<()>;

    // ── Profiles and hotspots ──

    fn list_profiles(&self) -> Result<Vec<Profile>>;

    /// The `802-11-wireless.mode` of a profile (`infrastructure`, `ap`, ...).
    fn profile_mode(&self, name: &str) -> Result<Option<String>>;
    fn profile_ssid(&self, name: &str) -> Result<Option<String>>;

    /// Creates an AP-mode profile with auto-connect disabled.
    fn create_hotspot(&self, config: &HotspotConfig) -> Result<()>;

    /// Rewrites IPv4 sharing, address, band and channel on an existing profile.
    fn modify_hotspot(&self, config: &HotspotConfig) -> Result<()>;

    fn start_hotspot(&self, name: &str) -> Result<()>;
    fn stop_hotspot(&self, name: &str) -> Result<()>;
    fn delete_hotspot(&self, name: &str) -> Result<()>;
    fn query_hotspot_status(&self, name: &str) -> Result<HotspotState>;

    /// Names of active AP-mode profiles.
    fn list_active_hotspots(&self) -> Result<Vec<String>>;
    fn list_hotspot_clients(&self, name: &str) -> Result<Vec<Station>>;

    // ── Interfaces ──

    fn check_ap_mode_support(&self, iface: &str) -> Result<bool>;
    fn list_wifi_interfaces(&self) -> Result<Vec<WifiInterface>>;
}

/// The built-in backends, most preferred first.
///
/// `interface` pins scans and station connections to one device.
pub fn known_backends(
    runner: Arc<dyn CommandRunner>,
    interface: Option<String>,
) -> Vec<Arc<dyn Backend>> {
    vec![Arc::new(NmcliBackend::new(runner).with_interface(interface))]
}

/// Picks the first available backend.
pub fn select(candidates: Vec<Arc<dyn Backend>>) -> Result<Arc<dyn Backend>> {
    let mut tried = Vec::new();
    for backend in candidates {
        if backend.is_available() {
            info!(backend = backend.name(), "selected network backend");
            return Ok(backend);
        }
        debug!(backend = backend.name(), "backend not available");
        tried.push(backend.name());
    }
    Err(NetError::ControlPlaneUnavailable(if tried.is_empty() {
        "no backends are compiled in".to_string()
    } else {
        format!("none of [{}] is running; install and start NetworkManager", tried.join(", "))
    }))
}
