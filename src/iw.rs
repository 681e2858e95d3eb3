//! Kernel-level wireless diagnostics through `iw`.
//!
//! `iw` reports what the driver sees, independent of NetworkManager. It is used
//! to detect association the control plane does not report, radio
//! capabilities (AP mode, 5 GHz) and the stations attached to a hotspot.

use std::sync::Arc;

use serde::Serialize;

use crate::error::Result;
use crate::exec::CommandRunner;
use crate::sanitize::validate_interface_name;

/// Current association of a station interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub bssid: String,
    pub ssid: Option<String>,
    pub frequency_mhz: Option<u32>,
    pub signal_dbm: Option<i32>,
    pub rx_bitrate: Option<String>,
    pub tx_bitrate: Option<String>,
}

/// A client attached to an AP interface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Station {
    pub mac: String,
    pub signal_dbm: Option<i32>,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
    pub connected_secs: Option<u64>,
}

#[derive(Clone)]
pub struct Iw {
    runner: Arc<dyn CommandRunner>,
}

impl Iw {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub fn is_available(&self) -> bool {
        self.runner.exists("iw")
    }

    /// Wireless interfaces known to the kernel.
    pub fn interfaces(&self) -> Result<Vec<String>> {
        let output = self.runner.run("iw", &["dev"])?.into_result("iw")?;
        Ok(parse_interfaces(&output.stdout))
    }

    /// The interface's association, `None` when not connected.
    pub fn link(&self, iface: &str) -> Result<Option<LinkInfo>> {
        validate_interface_name(iface)?;
        let output = self
            .runner
            .run("iw", &["dev", iface, "link"])?
            .into_result("iw")?;
        Ok(parse_link(&output.stdout))
    }

    pub fn is_associated(&self, iface: &str) -> Result<bool> {
        Ok(self.link(iface)?.is_some())
    }

    /// Index of the radio behind `iface` (`phyN`).
    pub fn phy_index(&self, iface: &str) -> Result<Option<u32>> {
        validate_interface_name(iface)?;
        let output = self
            .runner
            .run("iw", &["dev", iface, "info"])?
            .into_result("iw")?;
        Ok(parse_wiphy(&output.stdout))
    }

    fn phy_info(&self, iface: &str) -> Result<Option<String>> {
        let Some(index) = self.phy_index(iface)? else {
            return Ok(None);
        };
        let phy = format!("phy{}", index);
        let output = self
            .runner
            .run("iw", &["phy", &phy, "info"])?
            .into_result("iw")?;
        Ok(Some(output.stdout))
    }

    /// Whether the radio lists `AP` among its supported interface modes.
    pub fn supports_ap(&self, iface: &str) -> Result<bool> {
        Ok(self
            .phy_info(iface)?
            .is_some_and(|info| supported_modes(&info).iter().any(|m| m == "AP")))
    }

    /// Whether the radio has a 5 GHz band.
    pub fn supports_5ghz(&self, iface: &str) -> Result<bool> {
        Ok(self.phy_info(iface)?.is_some_and(|info| has_5ghz_band(&info)))
    }

    pub fn stations(&self, iface: &str) -> Result<Vec<Station>> {
        validate_interface_name(iface)?;
        let output = self
            .runner
            .run("iw", &["dev", iface, "station", "dump"])?
            .into_result("iw")?;
        Ok(parse_station_dump(&output.stdout))
    }
}

fn parse_interfaces(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("Interface "))
        .map(|name| name.trim().to_string())
        .collect()
}

fn parse_link(stdout: &str) -> Option<LinkInfo> {
    let mut lines = stdout.lines();
    let first = lines.next()?.trim();
    let rest = first.strip_prefix("Connected to ")?;
    let mut info = LinkInfo {
        bssid: rest.split_whitespace().next().unwrap_or_default().to_string(),
        ..Default::default()
    };

    for line in lines {
        let Some((key, value)) = line.trim().split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "SSID" => info.ssid = Some(value.to_string()),
            "freq" => info.frequency_mhz = value.split('.').next().and_then(|f| f.parse().ok()),
            "signal" => info.signal_dbm = leading_number(value),
            "rx bitrate" => info.rx_bitrate = Some(value.to_string()),
            "tx bitrate" => info.tx_bitrate = Some(value.to_string()),
            _ => {}
        }
    }
    Some(info)
}

fn parse_wiphy(stdout: &str) -> Option<u32> {
    stdout.lines().find_map(|line| {
        line.trim()
            .strip_prefix("wiphy ")
            .and_then(|n| n.trim().parse().ok())
    })
}

fn supported_modes(phy_info: &str) -> Vec<String> {
    let mut modes = Vec::new();
    let mut in_block = false;
    for line in phy_info.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Supported interface modes") {
            in_block = true;
            continue;
        }
        if in_block {
            match trimmed.strip_prefix("* ") {
                Some(mode) => modes.push(mode.trim().to_string()),
                None => break,
            }
        }
    }
    modes
}

fn has_5ghz_band(phy_info: &str) -> bool {
    phy_info.lines().any(|line| line.trim().starts_with("Band 2:"))
}

fn parse_station_dump(stdout: &str) -> Vec<Station> {
    let mut stations: Vec<Station> = Vec::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Station ") {
            stations.push(Station {
                mac: rest.split_whitespace().next().unwrap_or_default().to_string(),
                ..Default::default()
            });
            continue;
        }
        let Some(station) = stations.last_mut() else {
            continue;
        };
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "signal" => station.signal_dbm = leading_number(value),
            "rx bytes" => station.rx_bytes = value.parse().ok(),
            "tx bytes" => station.tx_bytes = value.parse().ok(),
            "connected time" => station.connected_secs = leading_number(value),
            _ => {}
        }
    }
    stations
}

fn leading_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.split_whitespace().next()?.parse().ok()
}
