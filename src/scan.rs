//! WiFi network scanning module.
//!
//! This module provides the types describing networks seen by a scan and the
//! parsing of the control plane's network listing.
//!
//! # Scanning Process
//!
//! 1. Triggers a rescan through the selected [`Backend`]
//! 2. Waits briefly for the scan to complete (500ms)
//! 3. Retrieves the list of discovered networks
//! 4. Parses and deduplicates the results
//! 5. Sorts networks by signal strength (strongest first)
//!
//! # Example
//!
//! ```no_run
//! use netpilot::{NetContext, config::Config, scan::{scan, display_networks}};
//!
//! let ctx = NetContext::detect(&Config::default())?;
//! let networks = scan(ctx.backend().as_ref())?;
//! display_networks(&networks);
//! # Ok::<(), netpilot::NetError>(())
//! ```

use std::collections::HashSet;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::backend::{Backend, parse::split_terse};
use crate::error::Result;
use crate::sanitize;

/// The name and security descriptor of a network.
///
/// An empty security descriptor means an open network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NetworkIdentity {
    /// The SSID. Up to 32 bytes.
    pub ssid: String,

    /// Security as reported by the control plane (e.g., "WPA2", "WPA1 WPA2 802.1X", "").
    pub security: String,
}

impl NetworkIdentity {
    pub fn new(ssid: impl Into<String>, security: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            security: security.into(),
        }
    }

    /// An identity with no security.
    pub fn open(ssid: impl Into<String>) -> Self {
        Self::new(ssid, "")
    }

    pub fn is_open(&self) -> bool {
        !self.requires_password()
    }

    pub fn requires_password(&self) -> bool {
        sanitize::requires_password(&self.security)
    }
}

/// Represents a discovered WiFi network from a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub identity: NetworkIdentity,

    /// Signal strength as a percentage (0-100).
    pub signal: u8,

    /// Whether the host is currently connected to this network.
    pub in_use: bool,
}

/// Scans for WiFi networks with a fresh rescan.
///
/// The rescan may fail if the radio is already scanning; cached results are
/// returned in that case.
pub fn scan(backend: &dyn Backend) -> Result<Vec<Network>> {
    if let Err(e) = backend.rescan() {
        debug!("rescan failed, using cached results: {}", e);
    }

    // 500ms is usually enough for the adapter to report new results
    thread::sleep(Duration::from_millis(500));

    backend.scan_networks()
}

/// Parses `nmcli -t -f IN-USE,SSID,SECURITY,SIGNAL device wifi list` output.
///
/// Hidden networks (empty SSID) are skipped, duplicate SSIDs keep the strongest
/// entry, and the result is sorted by signal, strongest first.
pub fn parse_wifi_list(stdout: &str) -> Vec<Network> {
    let mut networks: Vec<Network> = Vec::new();

    for line in stdout.lines() {
        let fields = split_terse(line);
        if fields.len() < 4 {
            continue;
        }

        let ssid = fields[1].clone();
        if ssid.is_empty() {
            continue;
        }

        // nmcli prints "--" for networks without security
        let security = match fields[2].trim() {
            "--" => String::new(),
            other => other.to_string(),
        };

        let network = Network {
            identity: NetworkIdentity { ssid, security },
            signal: fields[3].trim().parse().unwrap_or(0),
            in_use: fields[0].trim() == "*",
        };

        match networks
            .iter_mut()
            .find(|n| n.identity.ssid == network.identity.ssid)
        {
            Some(existing) => {
                existing.in_use |= network.in_use;
                if network.signal > existing.signal {
                    existing.signal = network.signal;
                    existing.identity.security = network.identity.security;
                }
            }
            None => networks.push(network),
        }
    }

    networks.sort_by(|a, b| b.signal.cmp(&a.signal));
    networks
}

/// Displays a list of networks in a formatted table.
///
/// # Output Format
/// ```text
///   SSID                             SIGNAL SECURITY
/// ------------------------------------------------------------
/// * MyHomeNetwork                      95% ████ WPA2
///   OpenCafe                           45% ██░░ (open)
/// ```
pub fn display_networks(networks: &[Network]) {
    if networks.is_empty() {
        println!("No networks found.");
        return;
    }

    println!("  {:<32} {:>6} {}", "SSID", "SIGNAL", "SECURITY");
    println!("{}", "-".repeat(60));

    let mut seen = HashSet::new();
    for network in networks {
        if !seen.insert(&network.identity.ssid) {
            continue;
        }
        let security = if network.identity.security.is_empty() {
            "(open)"
        } else {
            network.identity.security.as_str()
        };
        println!(
            "{} {:<32} {:>3}% {} {}",
            if network.in_use { "*" } else { " " },
            truncate_ssid(&network.identity.ssid, 32),
            network.signal,
            signal_to_bar(network.signal),
            security
        );
    }
}

fn truncate_ssid(ssid: &str, max_len: usize) -> String {
    if ssid.chars().count() > max_len {
        let head: String = ssid.chars().take(max_len - 3).collect();
        format!("{}...", head)
    } else {
        ssid.to_string()
    }
}

/// Converts a signal percentage into a 4-segment bar.
fn signal_to_bar(signal: u8) -> &'static str {
    match signal {
        80..=100 => "████",
        60..=79 => "███░",
        40..=59 => "██░░",
        20..=39 => "█░░░",
        _ => "░░░░",
    }
}
