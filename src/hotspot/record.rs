//! One persisted record per hotspot configuration.
//!
//! Records are flat TOML tables (`key = value` lines) named `<name>.toml`.
//! Keys missing from a record take their defaults; a missing `gateway` is
//! backfilled when the hotspot starts.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::HotspotConfig;
use crate::error::{NetError, Result};
use crate::sanitize::validate_config_name;

const EXTENSION: &str = "toml";

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_config_name(name)?;
        Ok(self.dir.join(format!("{}.{}", name, EXTENSION)))
    }

    pub fn save(&self, config: &HotspotConfig) -> Result<()> {
        let path = self.path_for(&config.name)?;
        fs::create_dir_all(&self.dir)?;

        let content = toml::to_string(config)
            .map_err(|e| NetError::Record(format!("{}: {}", config.name, e)))?;
        fs::write(&path, content)?;
        restrict_permissions(&path)?;

        debug!(path = %path.display(), "hotspot record saved");
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<HotspotConfig> {
        let path = self.path_for(name)?;
        let content = fs::read_to_string(&path)?;
        let mut config: HotspotConfig = toml::from_str(&content)
            .map_err(|e| NetError::Record(format!("{}: {}", path.display(), e)))?;
        // The file name is authoritative
        config.name = name.to_string();
        Ok(config)
    }

    /// Loads every readable record, skipping malformed ones.
    pub fn load_all(&self) -> Result<Vec<HotspotConfig>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut configs = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(name) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("skipping hotspot record {}: {}", path.display(), e),
            }
        }
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    /// Removes a record. Returns whether a file existed.
    pub fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    // Records hold the hotspot password
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotspot::{Band, SecurityType};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let config = HotspotConfig {
            name: "lab".into(),
            ssid: "Lab AP".into(),
            password: "supersecret".into(),
            gateway: Some(Ipv4Addr::new(10, 42, 0, 1)),
            band: Band::A,
            ..HotspotConfig::default()
        };

        store.save(&config).unwrap();
        assert_eq!(store.load("lab").unwrap(), config);
        assert_eq!(store.load_all().unwrap(), vec![config]);

        assert!(store.remove("lab").unwrap());
        assert!(!store.remove("lab").unwrap());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("legacy.toml"),
            "ssid = \"Old\"\npassword = \"12345678\"\nwifi_interface = \"wlan1\"\n",
        )
        .unwrap();
        let store = RecordStore::new(dir.path());

        let config = store.load("legacy").unwrap();
        assert_eq!(config.name, "legacy");
        assert_eq!(config.gateway, None);
        assert_eq!(config.security, SecurityType::Wpa2);
        assert_eq!(config.channel, 6);
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.toml"), "ssid = [").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let store = RecordStore::new(dir.path());
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("absent"));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        assert!(store.load("../etc/passwd").is_err());
    }
}
