//! Three-way connection classification.
//!
//! The control plane's active-connection listing is the primary source. When
//! it shows no WiFi entry, `iw` is asked whether the kernel still holds an
//! association; a link NetworkManager does not know about is a zombie and is
//! reported as [`Classification::Indeterminate`], never as disconnected.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::backend::{ActiveConnection, Backend, ProfileState};
use crate::exec::CommandRunner;
use crate::iw::Iw;
use crate::scan::NetworkIdentity;

/// What counts as "connected" for a given attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Associated with the network; an address is optional.
    Associated,
    /// Associated and holding an IPv4 address.
    IpAssigned,
}

impl Readiness {
    /// Secured networks need an address; open ones only when asked.
    pub fn for_identity(identity: &NetworkIdentity, require_ip_for_open: bool) -> Self {
        if identity.is_open() && !require_ip_for_open {
            Readiness::Associated
        } else {
            Readiness::IpAssigned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Classification {
    Connected { ssid: String, ip: Option<String> },
    NotConnected,
    /// The sources disagree or could not be read.
    Indeterminate,
}

impl Classification {
    pub fn is_connected_to(&self, ssid: &str) -> bool {
        matches!(self, Classification::Connected { ssid: s, .. } if s == ssid)
    }
}

/// One classification plus the state of the profile being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub classification: Classification,
    /// `None` when the profile is absent from the listing, or the listing failed.
    pub profile_state: Option<ProfileState>,
    /// Whether the active-connection listing could be read at all.
    pub listed: bool,
}

impl Observation {
    /// The listing was read and the profile is no longer in it, or is going down.
    pub fn profile_dropped(&self) -> bool {
        match self.profile_state {
            Some(ProfileState::Deactivating | ProfileState::Deactivated) => true,
            None => self.listed,
            _ => false,
        }
    }
}

pub struct StatusDetector {
    backend: Arc<dyn Backend>,
    iw: Iw,
    interface: Option<String>,
}

impl StatusDetector {
    pub fn new(backend: Arc<dyn Backend>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            backend,
            iw: Iw::new(runner),
            interface: None,
        }
    }

    /// Restricts both sources to one device.
    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface;
        self
    }

    pub fn classify(&self, readiness: Readiness) -> Classification {
        self.observe(readiness, None).classification
    }

    /// Classifies and reports `profile`'s state from the same listing.
    pub fn observe(&self, readiness: Readiness, profile: Option<&str>) -> Observation {
        let active = match self.backend.active_connections() {
            Ok(active) => active,
            Err(e) => {
                debug!("active connection listing failed: {}", e);
                return Observation {
                    classification: Classification::Indeterminate,
                    profile_state: None,
                    listed: false,
                };
            }
        };

        let wifi: Vec<&ActiveConnection> = active
            .iter()
            .filter(|c| c.is_wifi() && self.on_interface(c))
            .filter(|c| c.state != ProfileState::Deactivated)
            .filter(|c| self.backend.is_station(c))
            .collect();
        let profile_state = profile.and_then(|name| {
            active
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.state)
        });

        let classification = if wifi.is_empty() {
            self.kernel_view()
        } else {
            self.control_plane_view(&wifi, readiness)
        };
        Observation {
            classification,
            profile_state,
            listed: true,
        }
    }

    fn on_interface(&self, conn: &ActiveConnection) -> bool {
        match &self.interface {
            Some(iface) => conn.device.as_deref() == Some(iface.as_str()),
            None => true,
        }
    }

    fn control_plane_view(&self, wifi: &[&ActiveConnection], readiness: Readiness) -> Classification {
        let Some(conn) = wifi.iter().find(|c| c.state == ProfileState::Activated) else {
            // activating, deactivating or unknown
            return Classification::Indeterminate;
        };

        // Several radios can each have an active network
        let ssid = match self.backend.active_ssid(conn.device.as_deref()) {
            Ok(Some(ssid)) => ssid,
            Ok(None) => {
                debug!(profile = %conn.name, "active profile but no active SSID");
                return Classification::Indeterminate;
            }
            Err(e) => {
                debug!("active SSID query failed: {}", e);
                return Classification::Indeterminate;
            }
        };

        let ip = match self.backend.query_ip_address(&conn.name) {
            Ok(ip) => ip,
            Err(e) => {
                debug!("address query for {} failed: {}", conn.name, e);
                None
            }
        };
        if readiness == Readiness::IpAssigned && ip.is_none() {
            return Classification::Indeterminate;
        }
        Classification::Connected { ssid, ip }
    }

    fn kernel_view(&self) -> Classification {
        if !self.iw.is_available() {
            return Classification::NotConnected;
        }
        let interfaces = match &self.interface {
            Some(iface) => vec![iface.clone()],
            None => match self.iw.interfaces() {
                Ok(interfaces) => interfaces,
                Err(e) => {
                    debug!("iw interface listing failed: {}", e);
                    return Classification::Indeterminate;
                }
            },
        };

        for iface in &interfaces {
            match self.iw.is_associated(iface) {
                Ok(false) => {}
                Ok(true) => {
                    debug!(iface = %iface, "kernel reports an association the control plane does not");
                    return Classification::Indeterminate;
                }
                Err(e) => {
                    debug!("iw link query for {} failed: {}", iface, e);
                    return Classification::Indeterminate;
                }
            }
        }
        Classification::NotConnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NmcliBackend;
    use crate::exec::fake::{FakeRunner, fail, ok};
    use crate::scan::NetworkIdentity;

    const ACTIVE: &str = "nmcli -t -f NAME,TYPE,DEVICE,STATE connection show --active";
    const SSID: &str = "nmcli -t -f ACTIVE,SSID device wifi list --rescan no";
    const ADDRESS: &str = "nmcli -t -g IP4.ADDRESS connection show id Home";

    fn setup() -> (Arc<FakeRunner>, StatusDetector) {
        let fake = Arc::new(FakeRunner::new());
        let backend = Arc::new(NmcliBackend::new(fake.clone()));
        (fake.clone(), StatusDetector::new(backend, fake))
    }

    #[test]
    fn test_readiness_by_security() {
        let open = NetworkIdentity::open("Cafe");
        let secured = NetworkIdentity::new("Home", "WPA2");
        assert_eq!(Readiness::for_identity(&open, false), Readiness::Associated);
        assert_eq!(Readiness::for_identity(&open, true), Readiness::IpAssigned);
        assert_eq!(Readiness::for_identity(&secured, false), Readiness::IpAssigned);
    }

    #[test]
    fn test_connected_with_address() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("Home:802-11-wireless:wlan0:activated\n"))
            .on(SSID, ok("no:Other\nyes:Home\n"))
            .on(ADDRESS, ok("192.168.1.50/24\n"));

        let observation = detector.observe(Readiness::IpAssigned, Some("Home"));
        assert_eq!(
            observation.classification,
            Classification::Connected {
                ssid: "Home".into(),
                ip: Some("192.168.1.50".into())
            }
        );
        assert_eq!(observation.profile_state, Some(ProfileState::Activated));
    }

    #[test]
    fn test_missing_address_depends_on_readiness() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("Home:802-11-wireless:wlan0:activated\n"))
            .on(SSID, ok("yes:Home\n"))
            .on(ADDRESS, ok("\n"));

        assert_eq!(detector.classify(Readiness::IpAssigned), Classification::Indeterminate);
        assert!(detector.classify(Readiness::Associated).is_connected_to("Home"));
    }

    #[test]
    fn test_activating_is_indeterminate() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("Home:802-11-wireless:wlan0:activating\n"));
        let observation = detector.observe(Readiness::Associated, Some("Home"));
        assert_eq!(observation.classification, Classification::Indeterminate);
        assert_eq!(observation.profile_state, Some(ProfileState::Activating));
    }

    #[test]
    fn test_listing_failure_is_indeterminate() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, fail(8, "Error: NetworkManager is not running."));
        let observation = detector.observe(Readiness::Associated, Some("Home"));
        assert_eq!(observation.classification, Classification::Indeterminate);
        assert!(!observation.listed);
        assert!(!observation.profile_dropped());

        fake.on(ACTIVE, ok(""));
        assert!(detector.observe(Readiness::Associated, Some("Home")).profile_dropped());
    }

    #[test]
    fn test_disagreeing_listings_are_indeterminate() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("Home:802-11-wireless:wlan0:activated\n"))
            .on(SSID, ok("no:Home\n"));
        assert_eq!(detector.classify(Readiness::Associated), Classification::Indeterminate);
    }

    #[test]
    fn test_nothing_anywhere_is_not_connected() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("Wired:802-3-ethernet:eth0:activated\n"))
            .on("iw dev", ok("phy#0\n\tInterface wlan0\n\t\ttype managed\n"))
            .on("iw dev wlan0 link", ok("Not connected.\n"));
        assert_eq!(detector.classify(Readiness::Associated), Classification::NotConnected);
    }

    #[test]
    fn test_missing_iw_counts_as_not_connected() {
        let (fake, detector) = setup();
        fake.missing("iw");
        assert_eq!(detector.classify(Readiness::Associated), Classification::NotConnected);
        assert_eq!(fake.count("iw"), 0);
    }

    #[test]
    fn test_zombie_association_is_indeterminate() {
        let (fake, detector) = setup();
        let detector = detector.with_interface(Some("wlan0".into()));
        fake.on(
            "iw dev wlan0 link",
            ok("Connected to aa:bb:cc:dd:ee:ff (on wlan0)\n\tSSID: Home\n\tfreq: 2437\n"),
        );
        assert_eq!(detector.classify(Readiness::Associated), Classification::Indeterminate);
    }

    #[test]
    fn test_ssid_comes_from_the_pinned_radio() {
        let (fake, detector) = setup();
        let detector = detector.with_interface(Some("wlan1".into()));
        fake.on(
            ACTIVE,
            ok("Home:802-11-wireless:wlan0:activated\nTarget:802-11-wireless:wlan1:activated\n"),
        )
        .on(SSID, ok("yes:Home\nyes:Target\n"))
        .on(&format!("{} ifname wlan1", SSID), ok("no:Home\nyes:Target\n"));

        let classification = detector.classify(Readiness::Associated);
        assert!(classification.is_connected_to("Target"));
        assert_eq!(fake.count(&format!("{} ifname wlan0", SSID)), 0);
    }

    #[test]
    fn test_running_hotspot_is_not_a_connection() {
        let (fake, detector) = setup();
        fake.on(ACTIVE, ok("lab:802-11-wireless:wlan1:activated\n"))
            .on("nmcli -t -g 802-11-wireless.mode connection show id lab", ok("ap\n"))
            .on("iw dev", ok("phy#0\n\tInterface wlan1\n\t\ttype AP\n"))
            .on("iw dev wlan1 link", ok("Not connected.\n"));
        assert_eq!(detector.classify(Readiness::Associated), Classification::NotConnected);
    }

    #[test]
    fn test_interface_filter_ignores_other_devices() {
        let (fake, detector) = setup();
        let detector = detector.with_interface(Some("wlan1".into()));
        fake.on(ACTIVE, ok("Home:802-11-wireless:wlan0:activated\n"))
            .on("iw dev wlan1 link", ok("Not connected.\n"));
        assert_eq!(detector.classify(Readiness::Associated), Classification::NotConnected);
    }
}
