//! Configuration validation

use super::{parse_backend, Config};
use crate::types::is_valid_ifname;

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_interfaces(config, &mut result);
    validate_netfilter(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_interfaces(config: &Config, result: &mut ValidationResult) {
    let ifaces = &config.interfaces;

    if ifaces.wan.is_empty() {
        result.warn("interfaces.wan: no WAN interface, DHCP will be served on every interface");
    }

    for (role, names) in [
        ("wan", &ifaces.wan),
        ("lan", &ifaces.lan),
        ("wireguard", &ifaces.wireguard),
    ] {
        for name in names {
            if !is_valid_ifname(name) {
                result.error(format!(
                    "interfaces.{}: '{}' is not a valid interface name",
                    role, name
                ));
            }
        }
    }

    for name in &ifaces.lan {
        if ifaces.wan.contains(name) {
            result.error(format!(
                "interfaces: '{}' is listed as both wan and lan",
                name
            ));
        }
    }

    for name in &ifaces.wireguard {
        if !name.starts_with("wg") {
            result.warn(format!(
                "interfaces.wireguard: '{}' does not start with wg, its entries will not be isolated from other interfaces",
                name
            ));
        }
    }
}

fn validate_netfilter(config: &Config, result: &mut ValidationResult) {
    if let Some(ref backend) = config.netfilter.backend {
        if let Err(e) = parse_backend(backend) {
            result.error(format!("netfilter.backend: {}", e));
        }
    }

    if config.netfilter.reconcile_interval == Some(0) {
        result.error("netfilter.reconcile_interval: must be at least 1 second");
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    let Some(ref logging) = config.logging else {
        return;
    };
    if let Some(ref format) = logging.format {
        if !matches!(format.as_str(), "pretty" | "compact" | "json") {
            result.warn(format!(
                "logging.format: unknown format '{}', using pretty",
                format
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterfacesConfig, LoggingConfig, NetfilterConfig};

    fn make_config() -> Config {
        Config {
            interfaces: InterfacesConfig {
                wan: vec!["eth0".to_string()],
                lan: vec!["wlan0".to_string()],
                wireguard: vec!["wg0".to_string()],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_minimal_config() {
        let config = make_config();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_wan_warns() {
        let mut config = make_config();
        config.interfaces.wan.clear();
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("no WAN interface")));
    }

    #[test]
    fn test_bad_interface_name() {
        let mut config = make_config();
        config.interfaces.lan.push("eth1;reboot".to_string());
        let result = validate(&config);
        assert!(result.has_errors());
        assert!(result.errors.iter().any(|e| e.contains("eth1;reboot")));
    }

    #[test]
    fn test_wan_lan_overlap() {
        let mut config = make_config();
        config.interfaces.lan.push("eth0".to_string());
        let result = validate(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("both wan and lan")));
    }

    #[test]
    fn test_unknown_backend() {
        let mut config = make_config();
        config.netfilter = NetfilterConfig {
            backend: Some("iptables".to_string()),
            reconcile_interval: None,
        };
        let result = validate(&config);
        assert!(result.errors.iter().any(|e| e.contains("iptables")));
    }

    #[test]
    fn test_zero_reconcile_interval() {
        let mut config = make_config();
        config.netfilter.reconcile_interval = Some(0);
        let result = validate(&config);
        assert!(result.has_errors());
    }

    #[test]
    fn test_unknown_log_format_warns() {
        let mut config = make_config();
        config.logging = Some(LoggingConfig {
            level: None,
            format: Some("xml".to_string()),
        });
        let result = validate(&config);
        assert!(!result.has_errors());
        assert!(result.warnings.iter().any(|w| w.contains("xml")));
    }
}
