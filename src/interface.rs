use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::backend::{Backend, parse::split_terse};
use crate::error::{NetError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WifiInterface {
    pub name: String,
    pub state: String,
    pub is_usb: bool,
}

/// Parses `nmcli -t -f DEVICE,TYPE,STATE device`, keeping WiFi devices.
pub fn parse_device_status(stdout: &str) -> Vec<WifiInterface> {
    let mut interfaces = Vec::new();

    for line in stdout.lines() {
        let parts = split_terse(line);
        // p2p-dev-* entries are type "wifi-p2p" and are skipped here
        if parts.len() >= 3 && parts[1] == "wifi" {
            let name = parts[0].clone();
            let is_usb = is_usb_interface(&name);
            interfaces.push(WifiInterface {
                name,
                state: parts[2].clone(),
                is_usb,
            });
        }
    }

    interfaces
}

/// Whether the device behind `name` hangs off a USB bus, judged from sysfs.
fn is_usb_interface(name: &str) -> bool {
    let device = Path::new("/sys/class/net").join(name).join("device");
    fs::read_link(&device).is_ok_and(|bus_path| bus_path.to_string_lossy().contains("usb"))
        || fs::read_to_string(device.join("uevent")).is_ok_and(|uevent| uevent.contains("usb"))
}

/// Get a specific interface by name, verifying it's a WiFi interface
pub fn get_interface(backend: &dyn Backend, name: &str) -> Result<WifiInterface> {
    backend
        .list_wifi_interfaces()?
        .into_iter()
        .find(|i| i.name == name)
        .ok_or_else(|| NetError::InvalidInput(format!("'{}' is not a WiFi interface", name)))
}

/// Resolve interface: use the provided name, else prefer a USB adapter, else the first one
pub fn resolve_interface(backend: &dyn Backend, interface: Option<&str>) -> Result<WifiInterface> {
    if let Some(name) = interface {
        return get_interface(backend, name);
    }

    let mut interfaces = backend.list_wifi_interfaces()?;
    if let Some(pos) = interfaces.iter().position(|i| i.is_usb) {
        return Ok(interfaces.swap_remove(pos));
    }
    interfaces
        .into_iter()
        .next()
        .ok_or_else(|| NetError::InvalidInput("no WiFi interface found".to_string()))
}
