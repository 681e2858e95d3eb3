//! WiFi connection and hotspot orchestration on top of NetworkManager
//!
//! This library drives a host's WiFi through the tools already installed on
//! it: `nmcli` does the configuration, `iw` reports what the kernel sees and
//! `iptables` shares the uplink with hotspot clients. It adds the parts those
//! tools leave to the caller: cancellable connection attempts with a bounded
//! poll, a connection status that reconciles disagreeing sources, and hotspot
//! configurations with idempotent NAT rules.
//!
//! # Modules
//!
//! - [`connection`] - Connection attempts, cancellation and disconnect
//! - [`status`] - Connected / not connected / indeterminate classification
//! - [`hotspot`] - Hotspot configurations, records and lifecycle
//! - [`nat`] - Internet sharing rules
//! - [`backend`] - The control-plane capability table and its nmcli implementation
//! - [`server`] - HTTP dashboard and JSON API
//!
//! # Example Usage
//!
//! ```no_run
//! use netpilot::{NetContext, config::Config};
//!
//! let ctx = NetContext::detect(&Config::default())?;
//! let status = ctx.orchestrator().status()?;
//! println!("Connected: {} ({:?})", status.connected, status.ssid);
//!
//! let hotspots = ctx.hotspots()?;
//! for listing in hotspots.list()? {
//!     println!("{} -> {}", listing.config.name, listing.config.ssid);
//! }
//! # Ok::<(), netpilot::NetError>(())
//! ```

/// Control-plane capability table.
/// Declares every network operation once; the nmcli backend implements it.
pub mod backend;

/// Configuration module for application settings.
/// Handles reading/writing the TOML config file.
pub mod config;

/// Cancellable connection attempts and verified disconnects.
pub mod connection;

/// Internet reachability check.
pub mod connectivity;

/// Shared runner, backend and diagnostic queue.
pub mod context;

/// Bounded queue of user-facing warnings and errors.
pub mod diagnostics;

/// Error module defining the library's error type and failure classification.
/// Uses `thiserror` for ergonomic error handling.
pub mod error;

/// External command execution.
pub mod exec;

/// Hotspot configurations, persistence and lifecycle.
pub mod hotspot;

/// Interface module for WiFi adapter discovery.
/// Handles listing interfaces, detecting USB adapters, and interface resolution.
pub mod interface;

/// Kernel wireless state through `iw`.
pub mod iw;

/// Tracing subscriber setup.
pub mod logging;

/// iptables rules for hotspot internet sharing.
pub mod nat;

/// Argument validation and shell quoting.
pub mod sanitize;

/// Scan module for discovering available WiFi networks.
/// Triggers rescans and parses network information from nmcli output.
pub mod scan;

/// HTTP server exposing status and hotspot control.
pub mod server;

/// Connection status classification.
pub mod status;

pub use connection::{ConnectionHandle, ConnectionOutcome, Credential, Orchestrator, PollSettings};
pub use context::NetContext;
pub use error::{ErrorKind, NetError, Result};
pub use hotspot::{HotspotConfig, HotspotManager, HotspotState, HotspotStatus};
pub use interface::{WifiInterface, resolve_interface};
pub use scan::{Network, NetworkIdentity, display_networks};
pub use status::{Classification, Readiness, StatusDetector};
