//! Configuration types

use crate::netfilter::Backend;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_STATE_DIR: &str = "/var/lib/policyd";
pub const DEFAULT_RECONCILE_INTERVAL: u64 = 60;

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub interfaces: InterfacesConfig,
    #[serde(default)]
    pub netfilter: NetfilterConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    pub state_dir: Option<PathBuf>,
    pub devices: Option<String>,
    pub zones: Option<String>,
    pub firewall: Option<String>,
    pub dhcp: Option<String>,
}

/// Interfaces by role. Names are used verbatim in map keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfacesConfig {
    #[serde(default)]
    pub wan: Vec<String>,
    #[serde(default)]
    pub lan: Vec<String>,
    #[serde(default)]
    pub wireguard: Vec<String>,
}

impl InterfacesConfig {
    pub fn is_wan(&self, iface: &str) -> bool {
        self.wan.iter().any(|w| w == iface)
    }

    /// LAN and WireGuard interfaces, the ones LAN ping is opened on.
    pub fn internal(&self) -> impl Iterator<Item = &String> {
        self.lan.iter().chain(self.wireguard.iter())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetfilterConfig {
    /// "netlink" or "memory"
    pub backend: Option<String>,
    /// Seconds between drift checks in `run`.
    pub reconcile_interval: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<String>,
}

// ============================================================================
// Lock file types (generated, includes all defaults)
// ============================================================================

/// Generated lock file with all defaults filled in
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLock {
    pub generated_at: String,
    pub paths: PathsLock,
    pub interfaces: InterfacesConfig,
    pub netfilter: NetfilterLock,
    pub logging: LoggingLock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsLock {
    pub devices: PathBuf,
    pub zones: PathBuf,
    pub firewall: PathBuf,
    pub dhcp: PathBuf,
}

impl PathsLock {
    /// Default file names under `dir`.
    pub fn under(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            devices: dir.join("devices.json"),
            zones: dir.join("zones.json"),
            firewall: dir.join("firewall.json"),
            dhcp: dir.join("dhcp.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetfilterLock {
    pub backend: Backend,
    pub reconcile_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingLock {
    pub level: String,
    pub format: String,
}

pub fn parse_backend(name: &str) -> Result<Backend> {
    match name {
        "netlink" => Ok(Backend::Netlink),
        "memory" => Ok(Backend::Memory),
        other => Err(Error::Config(format!(
            "unknown netfilter backend '{}' (expected netlink or memory)",
            other
        ))),
    }
}

impl ConfigLock {
    pub fn from_config(config: &Config) -> Result<Self> {
        let dir = config
            .paths
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR));
        let defaults = PathsLock::under(&dir);
        let file = |name: &Option<String>, default: PathBuf| {
            name.as_ref().map(|n| dir.join(n)).unwrap_or(default)
        };
        let paths = PathsLock {
            devices: file(&config.paths.devices, defaults.devices),
            zones: file(&config.paths.zones, defaults.zones),
            firewall: file(&config.paths.firewall, defaults.firewall),
            dhcp: file(&config.paths.dhcp, defaults.dhcp),
        };

        let backend = match &config.netfilter.backend {
            Some(name) => parse_backend(name)?,
            None => Backend::default(),
        };

        let logging = config.logging.as_ref();
        Ok(ConfigLock {
            generated_at: chrono::Utc::now().to_rfc3339(),
            paths,
            interfaces: config.interfaces.clone(),
            netfilter: NetfilterLock {
                backend,
                reconcile_interval: config
                    .netfilter
                    .reconcile_interval
                    .unwrap_or(DEFAULT_RECONCILE_INTERVAL),
            },
            logging: LoggingLock {
                level: logging
                    .and_then(|l| l.level.clone())
                    .unwrap_or_else(|| "info".to_string()),
                format: logging
                    .and_then(|l| l.format.clone())
                    .unwrap_or_else(|| "pretty".to_string()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_defaults() {
        let lock = ConfigLock::from_config(&Config::default()).unwrap();
        assert_eq!(lock.paths, PathsLock::under(DEFAULT_STATE_DIR));
        assert_eq!(lock.netfilter.backend, Backend::Netlink);
        assert_eq!(lock.netfilter.reconcile_interval, DEFAULT_RECONCILE_INTERVAL);
        assert_eq!(lock.logging.level, "info");
        assert_eq!(lock.logging.format, "pretty");
    }

    #[test]
    fn test_lock_overrides() {
        let config: Config = toml::from_str(
            r#"
            [paths]
            state_dir = "/tmp/state"
            zones = "groups.json"

            [interfaces]
            wan = ["eth0"]
            lan = ["wlan0"]

            [netfilter]
            backend = "memory"
            reconcile_interval = 5
            "#,
        )
        .unwrap();
        let lock = ConfigLock::from_config(&config).unwrap();
        assert_eq!(lock.paths.zones, PathBuf::from("/tmp/state/groups.json"));
        assert_eq!(lock.paths.devices, PathBuf::from("/tmp/state/devices.json"));
        assert_eq!(lock.netfilter.backend, Backend::Memory);
        assert!(lock.interfaces.is_wan("eth0"));
        assert!(!lock.interfaces.is_wan("wlan0"));
    }

    #[test]
    fn test_lock_round_trips_through_toml() {
        let lock = ConfigLock::from_config(&Config::default()).unwrap();
        let text = toml::to_string_pretty(&lock).unwrap();
        let back: ConfigLock = toml::from_str(&text).unwrap();
        assert_eq!(back.paths, lock.paths);
        assert_eq!(back.netfilter.backend, lock.netfilter.backend);
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = Config::default();
        config.netfilter.backend = Some("iptables".into());
        assert!(ConfigLock::from_config(&config).is_err());
    }
}
