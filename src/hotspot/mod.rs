//! Hotspot configurations and their lifecycle.
//!
//! [`HotspotManager`] keeps the named configurations this host owns, mirrors
//! each to a [`RecordStore`] record, and drives the control plane and the NAT
//! rules when a hotspot starts or stops. AP-mode profiles created outside
//! netpilot show up in [`HotspotManager::list`] as [`Ownership::External`].

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::diagnostics::DiagnosticQueue;
use crate::error::{NetError, Result};
use crate::exec::CommandRunner;
use crate::interface::{WifiInterface, resolve_interface};
use crate::iw::{Iw, Station};
use crate::nat::{NatReconciler, NatReport, Subnet};
use crate::sanitize::{validate_config_name, validate_identity, validate_interface_name};

pub mod gateway;
pub mod record;

pub use record::RecordStore;

/// Name of the configuration used by [`HotspotManager::quick_start`].
pub const QUICK_NAME: &str = "quick";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityType {
    None,
    #[default]
    Wpa2,
    Wpa3,
}

impl SecurityType {
    /// nmcli `wifi-sec.key-mgmt` value, `None` for an open hotspot.
    pub fn key_mgmt(&self) -> Option<&'static str> {
        match self {
            SecurityType::None => None,
            SecurityType::Wpa2 => Some("wpa-psk"),
            SecurityType::Wpa3 => Some("sae"),
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SecurityType::None => "open",
            SecurityType::Wpa2 => "WPA2",
            SecurityType::Wpa3 => "WPA3",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Band {
    /// 2.4 GHz
    #[default]
    Bg,
    /// 5 GHz
    A,
}

impl Band {
    pub fn as_nmcli(&self) -> &'static str {
        match self {
            Band::Bg => "bg",
            Band::A => "a",
        }
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Band::Bg => "2.4GHz",
            Band::A => "5GHz",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotspotConfig {
    pub name: String,
    pub ssid: String,
    pub security: SecurityType,
    pub password: String,
    pub wifi_interface: String,
    /// Uplink to share; the default-route interface when unset.
    pub internet_interface: Option<String>,
    /// Unset until first start, then stable.
    pub gateway: Option<Ipv4Addr>,
    /// 0 lets the driver pick.
    pub channel: u8,
    pub band: Band,
    pub hidden: bool,
    pub client_isolation: bool,
    pub share_internet: bool,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            ssid: String::new(),
            security: SecurityType::Wpa2,
            password: String::new(),
            wifi_interface: "wlan0".to_string(),
            internet_interface: None,
            gateway: None,
            channel: 6,
            band: Band::Bg,
            hidden: false,
            client_isolation: false,
            share_internet: true,
        }
    }
}

impl HotspotConfig {
    /// `gateway/24`, once a gateway is assigned.
    pub fn gateway_cidr(&self) -> Option<String> {
        self.gateway.map(|gw| format!("{}/24", gw))
    }

    pub fn subnet(&self) -> Option<Subnet> {
        self.gateway.map(Subnet::from_gateway)
    }
}

/// Checks a configuration before it is stored or applied.
pub fn validate(config: &HotspotConfig) -> Result<()> {
    validate_config_name(&config.name)?;
    validate_identity(&config.ssid)?;

    if config.security != SecurityType::None {
        let len = config.password.chars().count();
        if !(8..=63).contains(&len) {
            return Err(NetError::InvalidInput(format!(
                "{} hotspots need a password of 8-63 characters",
                config.security
            )));
        }
    }

    if config.wifi_interface.is_empty() {
        return Err(NetError::InvalidInput("a WiFi interface is required".to_string()));
    }
    validate_interface_name(&config.wifi_interface)?;
    if let Some(inet) = &config.internet_interface {
        validate_interface_name(inet)?;
    }

    if config.channel > 165 {
        return Err(NetError::InvalidInput(format!(
            "channel {} is out of range 0-165",
            config.channel
        )));
    }
    match (config.band, config.channel) {
        (Band::Bg, 15..) => Err(NetError::InvalidInput(format!(
            "channel {} is not a 2.4GHz channel",
            config.channel
        ))),
        (Band::A, 1..=14) => Err(NetError::InvalidInput(format!(
            "channel {} is not a 5GHz channel",
            config.channel
        ))),
        _ => Ok(()),
    }
}

/// Lifecycle: Stopped → Starting → Active → Stopping → Stopped, Error from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HotspotState {
    Stopped,
    Starting,
    Active,
    Stopping,
    Error,
}

impl HotspotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HotspotState::Stopped => "stopped",
            HotspotState::Starting => "starting",
            HotspotState::Active => "active",
            HotspotState::Stopping => "stopping",
            HotspotState::Error => "error",
        }
    }
}

impl fmt::Display for HotspotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recomputed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotspotStatus {
    pub name: String,
    pub ssid: String,
    pub state: HotspotState,
    pub message: String,
    pub client_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ownership {
    Owned,
    /// An AP-mode profile found on the control plane.
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotListing {
    pub config: HotspotConfig,
    pub ownership: Ownership,
}

pub struct HotspotManager {
    backend: Arc<dyn Backend>,
    runner: Arc<dyn CommandRunner>,
    queue: Arc<DiagnosticQueue>,
    nat: NatReconciler,
    store: RecordStore,
    configs: BTreeMap<String, HotspotConfig>,
    settle: Duration,
}

impl HotspotManager {
    /// A manager holding the configurations already persisted in `store`.
    pub fn load(
        backend: Arc<dyn Backend>,
        runner: Arc<dyn CommandRunner>,
        queue: Arc<DiagnosticQueue>,
        store: RecordStore,
    ) -> Result<Self> {
        let configs = store
            .load_all()?
            .into_iter()
            .map(|c| (c.name.clone(), c))
            .collect();
        Ok(Self {
            nat: NatReconciler::new(Arc::clone(&runner), Arc::clone(&queue)),
            backend,
            runner,
            queue,
            store,
            configs,
            settle: Duration::from_millis(1500),
        })
    }

    pub fn with_nat(mut self, nat: NatReconciler) -> Self {
        self.nat = nat;
        self
    }

    /// Pause after taking the interface off its station network.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn get(&self, name: &str) -> Option<&HotspotConfig> {
        self.configs.get(name)
    }

    pub fn validate(&self, config: &HotspotConfig) -> Result<()> {
        validate(config)
    }

    /// Queues a failure before handing it back.
    fn reported<T>(&self, context: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.queue.report(context, e);
        }
        result
    }

    /// Stores a new configuration. Nothing is sent to the control plane yet.
    pub fn create(&mut self, config: HotspotConfig) -> Result<()> {
        let context = format!("Could not create hotspot '{}'", config.name);
        let result = self.insert(config);
        self.reported(&context, result)
    }

    fn insert(&mut self, config: HotspotConfig) -> Result<()> {
        validate(&config)?;
        if self.configs.contains_key(&config.name) {
            return Err(NetError::HotspotExists(config.name));
        }
        self.check_radio(&config)?;

        self.store.save(&config)?;
        info!(name = %config.name, ssid = %config.ssid, "hotspot created");
        self.configs.insert(config.name.clone(), config);
        Ok(())
    }

    /// Replaces a stored configuration, keeping its assigned gateway.
    pub fn update(&mut self, name: &str, config: HotspotConfig) -> Result<()> {
        let result = self.replace(name, config);
        self.reported(&format!("Could not update hotspot '{}'", name), result)
    }

    fn replace(&mut self, name: &str, mut config: HotspotConfig) -> Result<()> {
        let Some(existing) = self.configs.get(name) else {
            return Err(NetError::HotspotNotFound(name.to_string()));
        };
        if config.name != name {
            return Err(NetError::InvalidInput(format!(
                "cannot rename hotspot '{}' to '{}'",
                name, config.name
            )));
        }
        if existing.gateway.is_some() {
            config.gateway = existing.gateway;
        }
        validate(&config)?;
        self.check_radio(&config)?;

        self.store.save(&config)?;
        if self.backend.profile_exists(name).unwrap_or(false) {
            if let Err(e) = self.backend.modify_hotspot(&config) {
                self.queue
                    .push_warning(&format!("Saved '{}' but could not update its profile: {}", name, e));
            }
        }
        info!(name, "hotspot updated");
        self.configs.insert(name.to_string(), config);
        Ok(())
    }

    /// 5 GHz is a hard requirement; AP mode is only warned about since the check can be wrong.
    fn check_radio(&self, config: &HotspotConfig) -> Result<()> {
        let iw = Iw::new(Arc::clone(&self.runner));
        if config.band == Band::A {
            match iw.supports_5ghz(&config.wifi_interface) {
                Ok(true) => {}
                Ok(false) => {
                    return Err(NetError::InvalidInput(format!(
                        "{} does not support 5GHz",
                        config.wifi_interface
                    )));
                }
                Err(e) => self.queue.push_warning(&format!(
                    "Could not verify 5GHz support on {}: {}",
                    config.wifi_interface, e
                )),
            }
        }
        if let Ok(false) = self.backend.check_ap_mode_support(&config.wifi_interface) {
            self.queue.push_warning(&format!(
                "{} does not report AP mode support",
                config.wifi_interface
            ));
        }
        Ok(())
    }

    /// Brings a stored hotspot up and shares the uplink.
    pub fn start(&mut self, name: &str) -> Result<HotspotStatus> {
        let result = self.bring_up(name);
        self.reported(&format!("Failed to start hotspot '{}'", name), result)
    }

    fn bring_up(&mut self, name: &str) -> Result<HotspotStatus> {
        let mut config = self
            .configs
            .get(name)
            .cloned()
            .ok_or_else(|| NetError::HotspotNotFound(name.to_string()))?;
        validate(&config)?;

        if config.gateway.is_none() {
            let host = gateway::host_addresses(self.runner.as_ref()).unwrap_or_else(|e| {
                warn!("could not read host addresses: {}", e);
                Vec::new()
            });
            let gw = gateway::choose_gateway(&host);
            config.gateway = Some(gw);
            self.store.save(&config)?;
            self.configs.insert(name.to_string(), config.clone());
            info!(name, gateway = %gw, "assigned hotspot gateway");
        }

        // A radio cannot be a station and an access point at the same time
        if let Err(e) = self.backend.disconnect_device(&config.wifi_interface) {
            debug!("{} was not connected: {}", config.wifi_interface, e);
        }
        if !self.settle.is_zero() {
            thread::sleep(self.settle);
        }

        let prepared = if self.backend.profile_exists(name)? {
            self.backend.modify_hotspot(&config)
        } else {
            self.backend.create_hotspot(&config)
        };
        prepared.and_then(|()| self.backend.start_hotspot(name))?;
        info!(name, ssid = %config.ssid, "hotspot active");

        let message = self.share_internet(&config);
        Ok(HotspotStatus {
            name: config.name.clone(),
            ssid: config.ssid.clone(),
            state: HotspotState::Active,
            message,
            client_count: 0,
        })
    }

    fn share_internet(&self, config: &HotspotConfig) -> String {
        if !config.share_internet {
            return "internet sharing disabled".to_string();
        }
        let Some(subnet) = config.subnet() else {
            return "no gateway assigned".to_string();
        };
        let uplink = config.internet_interface.clone().or_else(|| {
            gateway::default_route_interface(self.runner.as_ref())
                .ok()
                .flatten()
        });
        let Some(uplink) = uplink.filter(|u| *u != config.wifi_interface) else {
            self.queue
                .push_warning(&format!("No uplink found; '{}' runs without internet", config.name));
            return "running without internet (no uplink)".to_string();
        };

        match self.nat.setup(&config.wifi_interface, &uplink, &subnet) {
            Ok(NatReport::Applied { .. }) => format!("sharing internet from {}", uplink),
            Ok(NatReport::Skipped) => {
                self.queue
                    .push_warning("Internet sharing rules need root; hotspot runs without them");
                "running without NAT rules (not root)".to_string()
            }
            Err(e) => {
                self.queue.push_warning(&format!(
                    "Hotspot '{}' is up but internet sharing failed: {}",
                    config.name, e
                ));
                "running without internet sharing".to_string()
            }
        }
    }

    fn stop_quietly(&self, name: &str) -> Result<()> {
        if let Some(config) = self.configs.get(name) {
            if let Some(subnet) = config.subnet() {
                if let Err(e) = self.nat.cleanup(&config.wifi_interface, &subnet) {
                    self.queue
                        .push_warning(&format!("NAT cleanup for '{}' failed: {}", name, e));
                }
            }
        }
        self.backend.stop_hotspot(name)
    }

    /// Takes a hotspot down and removes its sharing rules.
    pub fn stop(&mut self, name: &str) -> Result<()> {
        let result = self.stop_quietly(name);
        self.reported(&format!("Failed to stop hotspot '{}'", name), result)?;
        info!(name, "hotspot stopped");
        Ok(())
    }

    /// Stops every active AP-mode profile. Returns how many were stopped.
    pub fn stop_all(&mut self) -> Result<usize> {
        let active = self.backend.list_active_hotspots();
        let mut stopped = 0;
        for name in self.reported("Could not list running hotspots", active)? {
            if self.stop(&name).is_ok() {
                stopped += 1;
            }
        }
        Ok(stopped)
    }

    /// Stops and forgets a hotspot.
    ///
    /// The control-plane profile is removed when possible; failing to remove
    /// it only produces a warning.
    pub fn delete(&mut self, name: &str) -> Result<()> {
        let result = self.remove(name);
        self.reported(&format!("Could not delete hotspot '{}'", name), result)
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let owned = self.configs.contains_key(name);
        let on_control_plane = self.backend.profile_exists(name).unwrap_or(false);
        if !owned && !on_control_plane {
            return Err(NetError::HotspotNotFound(name.to_string()));
        }

        if let Err(e) = self.stop_quietly(name) {
            debug!("'{}' was not running: {}", name, e);
        }

        if owned {
            self.store.remove(name)?;
            self.configs.remove(name);
        }

        if on_control_plane {
            if let Err(e) = self.backend.delete_hotspot(name) {
                self.queue
                    .push_warning(&format!("Could not remove profile '{}': {}", name, e));
            }
        }
        info!(name, "hotspot deleted");
        Ok(())
    }

    /// Owned configurations plus AP-mode profiles found on the control plane.
    pub fn list(&self) -> Result<Vec<HotspotListing>> {
        let mut listings: Vec<HotspotListing> = self
            .configs
            .values()
            .map(|config| HotspotListing {
                config: config.clone(),
                ownership: Ownership::Owned,
            })
            .collect();

        let profiles = match self.backend.list_profiles() {
            Ok(profiles) => profiles,
            Err(e) => {
                self.queue
                    .push_warning(&format!("Could not list control-plane profiles: {}", e));
                return Ok(listings);
            }
        };

        for profile in profiles
            .into_iter()
            .filter(|p| p.is_wifi() && !self.configs.contains_key(&p.name))
        {
            match self.backend.profile_mode(&profile.name) {
                Ok(Some(mode)) if mode == "ap" => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!("skipping profile {}: {}", profile.name, e);
                    continue;
                }
            }
            let ssid = self
                .backend
                .profile_ssid(&profile.name)
                .ok()
                .flatten()
                .unwrap_or_else(|| profile.name.clone());
            listings.push(HotspotListing {
                config: HotspotConfig {
                    name: profile.name,
                    ssid,
                    wifi_interface: String::new(),
                    ..HotspotConfig::default()
                },
                ownership: Ownership::External,
            });
        }
        Ok(listings)
    }

    pub fn status(&self, name: &str) -> Result<HotspotStatus> {
        let result = self.read_status(name);
        self.reported(&format!("Could not read status of hotspot '{}'", name), result)
    }

    fn read_status(&self, name: &str) -> Result<HotspotStatus> {
        let ssid = match self.configs.get(name) {
            Some(config) => config.ssid.clone(),
            None => {
                if !self.backend.profile_exists(name)? {
                    return Err(NetError::HotspotNotFound(name.to_string()));
                }
                self.backend
                    .profile_ssid(name)
                    .ok()
                    .flatten()
                    .unwrap_or_else(|| name.to_string())
            }
        };

        let (state, message) = match self.backend.query_hotspot_status(name) {
            Ok(state) => (state, format!("hotspot is {}", state)),
            Err(e) => (HotspotState::Error, e.to_string()),
        };
        let client_count = if state == HotspotState::Active {
            self.backend
                .list_hotspot_clients(name)
                .map(|clients| clients.len())
                .unwrap_or(0)
        } else {
            0
        };

        Ok(HotspotStatus {
            name: name.to_string(),
            ssid,
            state,
            message,
            client_count,
        })
    }

    pub fn clients(&self, name: &str) -> Result<Vec<Station>> {
        self.backend.list_hotspot_clients(name)
    }

    /// Creates or replaces the `quick` configuration and starts it.
    ///
    /// Without `wifi_interface` a USB adapter is preferred, then the first WiFi device.
    pub fn quick_start(
        &mut self,
        ssid: &str,
        password: Option<&str>,
        wifi_interface: Option<&str>,
        internet_interface: Option<&str>,
    ) -> Result<HotspotStatus> {
        let radio = resolve_interface(self.backend.as_ref(), wifi_interface)
            .inspect_err(|e| self.queue.report("No interface for the quick hotspot", e))?;
        let config = HotspotConfig {
            name: QUICK_NAME.to_string(),
            ssid: ssid.to_string(),
            security: if password.is_some() {
                SecurityType::Wpa2
            } else {
                SecurityType::None
            },
            password: password.unwrap_or_default().to_string(),
            wifi_interface: radio.name,
            internet_interface: internet_interface.map(str::to_string),
            ..HotspotConfig::default()
        };

        if self.configs.contains_key(QUICK_NAME) {
            self.update(QUICK_NAME, config)?;
        } else {
            self.create(config)?;
        }
        self.start(QUICK_NAME)
    }

    /// WiFi interfaces with whether each can run an access point.
    pub fn available_interfaces(&self) -> Result<Vec<(WifiInterface, bool)>> {
        Ok(self
            .backend
            .list_wifi_interfaces()?
            .into_iter()
            .map(|iface| {
                let ap = self
                    .backend
                    .check_ap_mode_support(&iface.name)
                    .unwrap_or(false);
                (iface, ap)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NmcliBackend;
    use crate::exec::fake::{FakeRunner, fail, ok};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    struct Harness {
        fake: Arc<FakeRunner>,
        queue: Arc<DiagnosticQueue>,
        manager: HotspotManager,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let fake = Arc::new(FakeRunner::new());
        let queue = Arc::new(DiagnosticQueue::active(32));
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn Backend> = Arc::new(NmcliBackend::new(fake.clone()));
        let manager = HotspotManager::load(
            backend,
            fake.clone(),
            Arc::clone(&queue),
            RecordStore::new(dir.path()),
        )
        .unwrap()
        .with_nat(NatReconciler::new(fake.clone(), Arc::clone(&queue)).with_privileged(true))
        .with_settle(Duration::ZERO);
        Harness {
            fake,
            queue,
            manager,
            _dir: dir,
        }
    }

    fn config(name: &str) -> HotspotConfig {
        HotspotConfig {
            name: name.into(),
            ssid: format!("{}-ssid", name),
            password: "password1".into(),
            wifi_interface: "wlan1".into(),
            ..HotspotConfig::default()
        }
    }

    fn names(listings: &[HotspotListing]) -> Vec<&str> {
        listings.iter().map(|l| l.config.name.as_str()).collect()
    }

    #[test]
    fn test_validate() {
        assert!(validate(&config("ok")).is_ok());
        assert!(validate(&HotspotConfig { name: String::new(), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { ssid: String::new(), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { ssid: "s".repeat(33), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { password: "short".into(), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { password: "p".repeat(64), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig {
            security: SecurityType::None,
            password: String::new(),
            ..config("x")
        })
        .is_ok());
        assert!(validate(&HotspotConfig { wifi_interface: String::new(), ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { channel: 166, band: Band::A, ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { channel: 36, band: Band::Bg, ..config("x") }).is_err());
        assert!(validate(&HotspotConfig { channel: 0, band: Band::A, ..config("x") }).is_ok());
    }

    #[test]
    fn test_create_list_delete() {
        let mut h = harness();
        h.manager.create(config("lab")).unwrap();

        let listings = h.manager.list().unwrap();
        assert_eq!(names(&listings).iter().filter(|n| **n == "lab").count(), 1);
        assert_eq!(listings[0].ownership, Ownership::Owned);

        h.manager.delete("lab").unwrap();
        let listings = h.manager.list().unwrap();
        assert_eq!(names(&listings).iter().filter(|n| **n == "lab").count(), 0);
    }

    #[test]
    fn test_create_rejects_duplicates_and_invalid() {
        let mut h = harness();
        h.manager.create(config("lab")).unwrap();
        assert!(matches!(
            h.manager.create(config("lab")),
            Err(NetError::HotspotExists(_))
        ));
        assert!(matches!(
            h.manager.create(HotspotConfig { password: "short".into(), ..config("other") }),
            Err(NetError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_rejections_are_queued() {
        let mut h = harness();
        assert!(h
            .manager
            .create(HotspotConfig { ssid: String::new(), ..config("lab") })
            .is_err());
        let diagnostic = h.queue.pop().unwrap();
        assert_eq!(diagnostic.severity, crate::diagnostics::Severity::Error);
        assert!(diagnostic.message.starts_with("Could not create hotspot 'lab'"));

        h.queue.clear();
        assert!(h.manager.delete("ghost").is_err());
        assert!(h.manager.status("ghost").is_err());
        assert!(h.manager.start("ghost").is_err());
        assert_eq!(h.queue.len(), 3);
        assert!(h.queue.drain().iter().all(|d| d.message.contains("'ghost'")));
    }

    #[test]
    fn test_records_survive_reload() {
        let h = harness();
        let mut manager = h.manager;
        manager.create(config("lab")).unwrap();

        let reloaded = HotspotManager::load(
            manager.backend.clone(),
            h.fake.clone(),
            Arc::clone(&h.queue),
            manager.store.clone(),
        )
        .unwrap();
        assert_eq!(reloaded.get("lab"), Some(&config("lab")));
    }

    #[test]
    fn test_list_includes_external_ap_profiles() {
        let h = harness();
        h.fake
            .on(
                "nmcli -t -f NAME,TYPE connection show",
                ok("Home:802-11-wireless\nShared:802-11-wireless\nWired:802-3-ethernet\n"),
            )
            .on("nmcli -t -g 802-11-wireless.mode connection show id Home", ok("infrastructure\n"))
            .on("nmcli -t -g 802-11-wireless.mode connection show id Shared", ok("ap\n"))
            .on("nmcli -t -g 802-11-wireless.ssid connection show id Shared", ok("Shared AP\n"));

        let listings = h.manager.list().unwrap();
        assert_eq!(names(&listings), vec!["Shared"]);
        assert_eq!(listings[0].ownership, Ownership::External);
        assert_eq!(listings[0].config.ssid, "Shared AP");
    }

    #[test]
    fn test_start_backfills_gateway_and_creates_profile() {
        let mut h = harness();
        h.fake
            .on(
                "ip -4 -o addr show scope global",
                ok("2: eth0    inet 10.0.42.3/24 brd 10.0.42.255 scope global eth0\n"),
            )
            .on("ip route show default", ok("default via 10.0.42.1 dev eth0\n"))
            .on("iptables -t nat -C", fail(1, "does a matching rule exist"))
            .on("iptables -t filter -C", fail(1, "does a matching rule exist"));
        h.manager.create(config("lab")).unwrap();

        let status = h.manager.start("lab").unwrap();
        assert_eq!(status.state, HotspotState::Active);
        assert_eq!(status.message, "sharing internet from eth0");

        let gateway = Some(Ipv4Addr::new(10, 43, 0, 1));
        assert_eq!(h.manager.get("lab").unwrap().gateway, gateway);
        assert_eq!(h.manager.store.load("lab").unwrap().gateway, gateway);

        let calls = h.fake.calls();
        let disconnect = calls.iter().position(|c| c == "nmcli device disconnect wlan1").unwrap();
        let add = calls
            .iter()
            .position(|c| c.starts_with("nmcli connection add type wifi ifname wlan1 con-name lab"))
            .unwrap();
        let up = calls.iter().position(|c| c == "nmcli connection up id lab").unwrap();
        assert!(disconnect < add && add < up);
        assert!(calls[add].contains("autoconnect no"));
        assert!(calls[add].contains("ipv4.addresses 10.43.0.1/24"));
        assert!(calls.iter().any(|c| c.starts_with(
            "iptables -t nat -A POSTROUTING -s 10.43.0.0/24 ! -d 10.43.0.0/24 -j MASQUERADE"
        )));
    }

    #[test]
    fn test_start_modifies_existing_profile() {
        let mut h = harness();
        h.fake
            .on("nmcli -t -f NAME,TYPE connection show", ok("lab:802-11-wireless\n"));
        h.manager
            .create(HotspotConfig {
                gateway: Some(Ipv4Addr::new(192, 168, 12, 1)),
                share_internet: false,
                ..config("lab")
            })
            .unwrap();

        let status = h.manager.start("lab").unwrap();
        assert_eq!(status.message, "internet sharing disabled");
        assert_eq!(h.fake.count("nmcli connection modify id lab"), 1);
        assert_eq!(h.fake.count("nmcli connection add"), 0);
        assert_eq!(h.fake.count("ip -4"), 0);
    }

    #[test]
    fn test_start_failure_is_queued() {
        let mut h = harness();
        h.fake.on(
            "nmcli connection up id lab",
            fail(4, "Error: Connection activation failed: No suitable device found"),
        );
        h.manager
            .create(HotspotConfig {
                gateway: Some(Ipv4Addr::new(192, 168, 12, 1)),
                ..config("lab")
            })
            .unwrap();
        h.queue.clear();

        assert!(h.manager.start("lab").is_err());
        let diagnostic = h.queue.pop().unwrap();
        assert!(diagnostic.message.contains("No suitable device"));
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let mut h = harness();
        assert!(matches!(
            h.manager.delete("ghost"),
            Err(NetError::HotspotNotFound(_))
        ));
    }

    #[test]
    fn test_delete_tolerates_stopped_hotspot() {
        let mut h = harness();
        h.fake
            .on("nmcli connection down", fail(10, "Error: 'lab' is not an active connection."));
        h.manager.create(config("lab")).unwrap();
        h.manager.delete("lab").unwrap();
        assert!(h.manager.get("lab").is_none());
    }

    #[test]
    fn test_update_keeps_gateway() {
        let mut h = harness();
        h.manager
            .create(HotspotConfig {
                gateway: Some(Ipv4Addr::new(10, 42, 0, 1)),
                ..config("lab")
            })
            .unwrap();
        h.manager
            .update("lab", HotspotConfig { ssid: "Renamed".into(), ..config("lab") })
            .unwrap();
        let stored = h.manager.get("lab").unwrap();
        assert_eq!(stored.ssid, "Renamed");
        assert_eq!(stored.gateway, Some(Ipv4Addr::new(10, 42, 0, 1)));
        assert!(h.manager.update("ghost", config("ghost")).is_err());
    }

    #[test]
    fn test_status_counts_clients() {
        let mut h = harness();
        h.fake
            .on("nmcli -t -g GENERAL.STATE connection show id lab", ok("activated\n"))
            .on("nmcli -t -g connection.interface-name connection show id lab", ok("wlan1\n"))
            .on(
                "iw dev wlan1 station dump",
                ok("Station 11:22:33:44:55:66 (on wlan1)\nStation 66:55:44:33:22:11 (on wlan1)\n"),
            );
        h.manager.create(config("lab")).unwrap();

        let status = h.manager.status("lab").unwrap();
        assert_eq!(status.state, HotspotState::Active);
        assert_eq!(status.client_count, 2);
    }

    #[test]
    fn test_stop_all_stops_active_ap_profiles() {
        let mut h = harness();
        h.fake
            .on(
                "nmcli -t -f NAME,TYPE,DEVICE,STATE connection show --active",
                ok("lab:802-11-wireless:wlan1:activated\n"),
            )
            .on("nmcli -t -g 802-11-wireless.mode connection show id lab", ok("ap\n"));
        assert_eq!(h.manager.stop_all().unwrap(), 1);
        assert_eq!(h.fake.count("nmcli connection down id lab"), 1);
    }

    #[test]
    fn test_quick_start_creates_open_hotspot() {
        let mut h = harness();
        h.fake.on(
            "nmcli -t -f DEVICE,TYPE,STATE device",
            ok("wltest0:wifi:connected\nwlan1:wifi:disconnected\n"),
        );
        let status = h.manager.quick_start("Party", None, Some("wlan1"), Some("eth0")).unwrap();
        assert_eq!(status.name, QUICK_NAME);
        let stored = h.manager.get(QUICK_NAME).unwrap();
        assert_eq!(stored.security, SecurityType::None);
        assert!(!h.fake.calls().iter().any(|c| c.contains("wifi-sec.psk")));

        // A second quick start replaces the configuration instead of failing
        h.manager
            .quick_start("Party2", Some("password1"), Some("wlan1"), None)
            .unwrap();
        assert_eq!(h.manager.get(QUICK_NAME).unwrap().ssid, "Party2");
    }

    #[test]
    fn test_quick_start_picks_an_interface() {
        let mut h = harness();
        h.fake.on(
            "nmcli -t -f DEVICE,TYPE,STATE device",
            ok("eth0:ethernet:connected\nwltest0:wifi:disconnected\n"),
        );
        h.manager.quick_start("Party", None, None, None).unwrap();
        assert_eq!(h.manager.get(QUICK_NAME).unwrap().wifi_interface, "wltest0");

        h.queue.clear();
        assert!(h.manager.quick_start("Party", None, Some("eth0"), None).is_err());
        assert!(h.queue.has_pending());
    }
}
