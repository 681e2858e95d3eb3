//! Application settings, read from `~/.config/netpilot/config.toml`.
//!
//! Every key is optional. A missing file yields [`Config::default`].

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::PollSettings;

/// Named poll cadences for connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollProfile {
    /// 100 ms × 150
    #[default]
    Interactive,
    /// 1 s × 13
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WiFi interface for station connections. Auto-detected when unset.
    pub interface: Option<String>,
    pub poll_profile: PollProfile,
    /// Overrides the profile's interval.
    pub poll_interval_ms: Option<u64>,
    /// Overrides the profile's ceiling.
    pub max_poll_iterations: Option<u32>,
    /// Wait for an IPv4 address on open networks too.
    pub require_ip_for_open: bool,
    pub settle_ms: u64,
    /// Where hotspot records live. Defaults next to this file.
    pub hotspot_dir: Option<PathBuf>,
    pub diagnostics_capacity: usize,
    /// Fetched by `status --check-internet`.
    pub connectivity_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            poll_profile: PollProfile::Interactive,
            poll_interval_ms: None,
            max_poll_iterations: None,
            require_ip_for_open: false,
            settle_ms: 1500,
            hotspot_dir: None,
            diagnostics_capacity: 32,
            connectivity_url: "http://connectivitycheck.gstatic.com/generate_204".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn poll_settings(&self) -> PollSettings {
        let base = match self.poll_profile {
            PollProfile::Interactive => PollSettings::interactive(),
            PollProfile::Batch => PollSettings::batch(),
        };
        PollSettings {
            interval: self
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(base.interval),
            max_iterations: self.max_poll_iterations.unwrap_or(base.max_iterations),
            require_ip_for_open: self.require_ip_for_open,
            settle: Duration::from_millis(self.settle_ms),
        }
    }

    pub fn hotspot_dir(&self) -> Result<PathBuf> {
        match &self.hotspot_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(config_dir()?.join("hotspots")),
        }
    }
}

fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?;
    Ok(config_dir.join("netpilot"))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}
