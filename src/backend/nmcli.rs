//! NetworkManager backend.
//!
//! Drives NetworkManager through `nmcli` in terse mode and uses `iw` for
//! the radio capabilities and station lists nmcli does not expose.
//!
//! # Requirements
//!
//! - NetworkManager must be installed and running
//! - The `nmcli` command must be available in PATH
//! - User must have permission to manage network connections

use std::sync::Arc;

use tracing::{debug, info};

use super::parse::{
    parse_active_connections, parse_active_ssid, parse_ip4_address, parse_profiles, single_value,
};
use super::{ActiveConnection, Backend, Profile};
use crate::error::Result;
use crate::exec::{CommandOutput, CommandRunner};
use crate::hotspot::{HotspotConfig, HotspotState};
use crate::interface::{WifiInterface, parse_device_status};
use crate::iw::{Iw, Station};
use crate::sanitize::{validate_config_name, validate_identity, validate_interface_name};
use crate::scan::{Network, parse_wifi_list};

pub struct NmcliBackend {
    runner: Arc<dyn CommandRunner>,
    iw: Iw,
    /// Restricts station connections to one device.
    interface: Option<String>,
}

impl NmcliBackend {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            iw: Iw::new(Arc::clone(&runner)),
            runner,
            interface: None,
        }
    }

    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    /// Runs nmcli and turns a non-zero exit into a classified error.
    fn nmcli(&self, args: &[&str]) -> Result<CommandOutput> {
        self.runner.run("nmcli", args)?.into_result("nmcli")
    }

    fn nmcli_owned(&self, args: &[String]) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.nmcli(&args)
    }

    fn get_value(&self, field: &str, name: &str) -> Result<Option<String>> {
        let output = self.nmcli(&["-t", "-g", field, "connection", "show", "id", name])?;
        Ok(single_value(&output.stdout))
    }

    /// The `802-11-wireless*` and `ipv4.*` settings shared by create and modify.
    fn hotspot_settings(config: &HotspotConfig) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "802-11-wireless.mode".into(),
            "ap".into(),
            "802-11-wireless.band".into(),
            config.band.as_nmcli().into(),
            "ipv4.method".into(),
            "shared".into(),
        ];

        if let Some(cidr) = config.gateway_cidr() {
            args.extend(["ipv4.addresses".into(), cidr]);
        }
        if config.channel > 0 {
            args.extend(["802-11-wireless.channel".into(), config.channel.to_string()]);
        }
        if config.hidden {
            args.extend(["802-11-wireless.hidden".into(), "yes".into()]);
        }
        if config.client_isolation {
            args.extend(["802-11-wireless.ap-isolation".into(), "true".into()]);
        }
        if let Some(key_mgmt) = config.security.key_mgmt() {
            args.extend([
                "wifi-sec.key-mgmt".into(),
                key_mgmt.into(),
                "wifi-sec.psk".into(),
                config.password.clone(),
            ]);
        }
        args
    }
}

impl Backend for NmcliBackend {
    fn name(&self) -> &'static str {
        "nmcli"
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f RUNNING general
    /// ```
    fn is_available(&self) -> bool {
        if !self.runner.exists("nmcli") {
            return false;
        }
        match self.runner.run("nmcli", &["-t", "-f", "RUNNING", "general"]) {
            Ok(output) => output.success() && output.stdout.trim() == "running",
            Err(e) => {
                debug!("nmcli availability check failed: {}", e);
                false
            }
        }
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f IN-USE,SSID,SECURITY,SIGNAL device wifi list --rescan no [ifname <interface>]
    /// ```
    fn scan_networks(&self) -> Result<Vec<Network>> {
        let mut args = vec![
            "-t",                            // Terse output (machine-readable)
            "-f",                            // Specify fields to output
            "IN-USE,SSID,SECURITY,SIGNAL",   // Fields we want
            "device",
            "wifi",
            "list",
            "--rescan",
            "no",                            // rescan() is issued separately
        ];
        if let Some(iface) = &self.interface {
            args.extend(["ifname", iface.as_str()]);
        }
        let output = self.nmcli(&args)?;
        Ok(parse_wifi_list(&output.stdout))
    }

    fn rescan(&self) -> Result<()> {
        let mut args = vec!["device", "wifi", "rescan"];
        if let Some(iface) = &self.interface {
            args.extend(["ifname", iface.as_str()]);
        }
        self.nmcli(&args)?;
        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// nmcli device wifi connect <ssid> [ifname <interface>]
    /// ```
    fn connect_open(&self, ssid: &str) -> Result<()> {
        validate_identity(ssid)?;
        let mut args = vec!["device", "wifi", "connect", ssid];
        if let Some(iface) = &self.interface {
            args.extend(["ifname", iface.as_str()]);
        }
        self.nmcli(&args)?;
        info!(ssid, "open network activation issued");
        Ok(())
    }

    /// Creates a profile holding the PSK, then activates it.
    ///
    /// # Commands Executed
    /// ```bash
    /// nmcli connection add type wifi con-name <ssid> ssid <ssid> [ifname <interface>] \
    ///     wifi-sec.key-mgmt wpa-psk wifi-sec.psk <psk>
    /// nmcli connection up id <ssid>
    /// ```
    fn connect_secured(&self, ssid: &str, psk: &str) -> Result<()> {
        validate_identity(ssid)?;
        let mut args = vec!["connection", "add", "type", "wifi", "con-name", ssid, "ssid", ssid];
        if let Some(iface) = &self.interface {
            args.extend(["ifname", iface.as_str()]);
        }
        args.extend(["wifi-sec.key-mgmt", "wpa-psk", "wifi-sec.psk", psk]);
        self.nmcli(&args)?;

        self.nmcli(&["connection", "up", "id", ssid])?;
        info!(ssid, "secured network activation issued");
        Ok(())
    }

    fn profile_exists(&self, name: &str) -> Result<bool> {
        Ok(self
            .list_profiles()?
            .iter()
            .any(|p| p.is_wifi() && p.name == name))
    }

    fn activate_profile(&self, name: &str) -> Result<()> {
        self.nmcli(&["connection", "up", "id", name])?;
        Ok(())
    }

    fn deactivate_profile(&self, name: &str) -> Result<()> {
        self.nmcli(&["connection", "down", "id", name])?;
        Ok(())
    }

    fn delete_profile(&self, name: &str) -> Result<()> {
        self.nmcli(&["connection", "delete", "id", name])?;
        Ok(())
    }

    fn disconnect_device(&self, iface: &str) -> Result<()> {
        validate_interface_name(iface)?;
        self.nmcli(&["device", "disconnect", iface])?;
        Ok(())
    }

    fn set_managed(&self, iface: &str, managed: bool) -> Result<()> {
        validate_interface_name(iface)?;
        let value = if managed { "yes" } else { "no" };
        self.nmcli(&["device", "set", iface, "managed", value])?;
        Ok(())
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f NAME,TYPE,DEVICE,STATE connection show --active
    /// ```
    fn active_connections(&self) -> Result<Vec<ActiveConnection>> {
        let output = self.nmcli(&[
            "-t",
            "-f",
            "NAME,TYPE,DEVICE,STATE",
            "connection",
            "show",
            "--active",
        ])?;
        Ok(parse_active_connections(&output.stdout))
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -f ACTIVE,SSID device wifi list --rescan no [ifname <iface>]
    /// ```
    fn active_ssid(&self, iface: Option<&str>) -> Result<Option<String>> {
        let mut args = vec!["-t", "-f", "ACTIVE,SSID", "device", "wifi", "list", "--rescan", "no"];
        if let Some(iface) = iface {
            validate_interface_name(iface)?;
            args.extend(["ifname", iface]);
        }
        let output = self.nmcli(&args)?;
        Ok(parse_active_ssid(&output.stdout))
    }

    /// # Command Executed
    /// ```bash
    /// nmcli -t -g IP4.ADDRESS connection show id <profile>
    /// ```
    fn query_ip_address(&self, profile: &str) -> Result<Option<String>> {
        let output =
            self.nmcli(&["-t", "-g", "IP4.ADDRESS", "connection", "show", "id", profile])?;
        Ok(parse_ip4_address(&output.stdout))
    }

    fn wifi_enabled(&self) -> Result<bool> {
        let output = self.nmcli(&["radio", "wifi"])?;
        Ok(output.stdout.trim() == "enabled")
    }

    fn set_wifi_enabled(&self, enabled: bool) -> Result<()> {
        self.nmcli(&["radio", "wifi", if enabled { "on" } else { "off" }])?;
        Ok(())
    }

    fn list_profiles(&self) -> Result<Vec<Profile>> {
        let output = self.nmcli(&["-t", "-f", "NAME,TYPE", "connection", "show"])?;
        Ok(parse_profiles(&output.stdout))
    }

    fn profile_mode(&self, name: &str) -> Result<Option<String>> {
        self.get_value("802-11-wireless.mode", name)
    }

    fn profile_ssid(&self, name: &str) -> Result<Option<String>> {
        self.get_value("802-11-wireless.ssid", name)
    }

    /// # Command Executed
    /// ```bash
    /// nmcli connection add type wifi ifname <iface> con-name <name> autoconnect no ssid <ssid> \
    ///     802-11-wireless.mode ap 802-11-wireless.band <bg|a> ipv4.method shared \
    ///     ipv4.addresses <gateway>/24 [802-11-wireless.channel <n>] \
    ///     [wifi-sec.key-mgmt <wpa-psk|sae> wifi-sec.psk <password>]
    /// ```
    fn create_hotspot(&self, config: &HotspotConfig) -> Result<()> {
        validate_config_name(&config.name)?;
        validate_identity(&config.ssid)?;
        validate_interface_name(&config.wifi_interface)?;

        let mut args: Vec<String> = vec![
            "connection".into(),
            "add".into(),
            "type".into(),
            "wifi".into(),
            "ifname".into(),
            config.wifi_interface.clone(),
            "con-name".into(),
            config.name.clone(),
            "autoconnect".into(),
            "no".into(),
            "ssid".into(),
            config.ssid.clone(),
        ];
        args.extend(Self::hotspot_settings(config));
        self.nmcli_owned(&args)?;
        info!(name = %config.name, "hotspot profile created");
        Ok(())
    }

    fn modify_hotspot(&self, config: &HotspotConfig) -> Result<()> {
        validate_config_name(&config.name)?;
        validate_identity(&config.ssid)?;
        validate_interface_name(&config.wifi_interface)?;

        let mut args: Vec<String> = vec![
            "connection".into(),
            "modify".into(),
            "id".into(),
            config.name.clone(),
            "connection.interface-name".into(),
            config.wifi_interface.clone(),
            "connection.autoconnect".into(),
            "no".into(),
            "802-11-wireless.ssid".into(),
            config.ssid.clone(),
        ];
        args.extend(Self::hotspot_settings(config));
        self.nmcli_owned(&args)?;
        info!(name = %config.name, "hotspot profile updated");
        Ok(())
    }

    fn start_hotspot(&self, name: &str) -> Result<()> {
        self.activate_profile(name)
    }

    fn stop_hotspot(&self, name: &str) -> Result<()> {
        self.deactivate_profile(name)
    }

    fn delete_hotspot(&self, name: &str) -> Result<()> {
        self.delete_profile(name)
    }

    fn query_hotspot_status(&self, name: &str) -> Result<HotspotState> {
        let state = self.get_value("GENERAL.STATE", name)?;
        Ok(match state.as_deref() {
            Some("activated") => HotspotState::Active,
            Some("activating") => HotspotState::Starting,
            Some("deactivating") => HotspotState::Stopping,
            _ => HotspotState::Stopped,
        })
    }

    fn list_active_hotspots(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for conn in self.active_connections()?.into_iter().filter(|c| c.is_wifi()) {
            if self.profile_mode(&conn.name)?.as_deref() == Some("ap") {
                names.push(conn.name);
            }
        }
        Ok(names)
    }

    /// # Commands Executed
    /// ```bash
    /// nmcli -t -g connection.interface-name connection show id <name>
    /// iw dev <iface> station dump
    /// ```
    fn list_hotspot_clients(&self, name: &str) -> Result<Vec<Station>> {
        match self.get_value("connection.interface-name", name)? {
            Some(iface) => self.iw.stations(&iface),
            None => Ok(Vec::new()),
        }
    }

    fn check_ap_mode_support(&self, iface: &str) -> Result<bool> {
        validate_interface_name(iface)?;
        match self.iw.supports_ap(iface) {
            Ok(supported) => Ok(supported),
            Err(e) => {
                // Without iw, any WiFi device NetworkManager knows is worth a try
                debug!("iw capability query failed for {}: {}", iface, e);
                Ok(self.list_wifi_interfaces()?.iter().any(|i| i.name == iface))
            }
        }
    }

    fn list_wifi_interfaces(&self) -> Result<Vec<WifiInterface>> {
        let output = self.nmcli(&["-t", "-f", "DEVICE,TYPE,STATE", "device"])?;
        Ok(parse_device_status(&output.stdout))
    }
}
