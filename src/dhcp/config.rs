//! Address pool configuration

use crate::{Error, Result};
use ipnet::Ipv4Net;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_TINY_NET: &str = "192.168.2.0/24";
pub const DEFAULT_LEASE_TIME: &str = "24h0m0s";

const MIN_PREFIX: u8 = 8;
const MAX_PREFIX: u8 = 24;

const LEASE_TIME_PATTERN: &str = r"^(\d{1,2})h(\d{1,2})m(\d{1,2})s$";

fn lease_time_re() -> Result<Regex> {
    Regex::new(LEASE_TIME_PATTERN).map_err(|e| Error::Config(e.to_string()))
}

/// Persisted DHCP settings (`dhcp.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhcpConfig {
    /// Pools carved into /30 blocks, in allocation order.
    #[serde(default)]
    pub tiny_nets: Vec<String>,
    /// Informational; handed to the DHCP server as-is.
    #[serde(default)]
    pub lease_time: String,
}

impl Default for DhcpConfig {
    fn default() -> Self {
        Self {
            tiny_nets: vec![DEFAULT_TINY_NET.to_string()],
            lease_time: DEFAULT_LEASE_TIME.to_string(),
        }
    }
}

impl DhcpConfig {
    /// Check an incoming config. An empty lease time is accepted; the
    /// caller keeps the previous value.
    pub fn validate(&self) -> Result<()> {
        if self.tiny_nets.is_empty() {
            return Err(Error::validation("TinyNets", "need at least one subnet"));
        }
        for net in &self.tiny_nets {
            parse_tiny_net(net)?;
        }
        if !self.lease_time.is_empty() && !lease_time_re()?.is_match(&self.lease_time) {
            return Err(Error::validation(
                "LeaseTime",
                format!("{:?} is not of the form <h>h<m>m<s>s", self.lease_time),
            ));
        }
        Ok(())
    }

    /// Parsed pools. Entries that fail to parse are skipped with a warning.
    pub fn nets(&self) -> Vec<Ipv4Net> {
        self.tiny_nets
            .iter()
            .filter_map(|s| match parse_tiny_net(s) {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!("Skipping TinyNet {}: {}", s, e);
                    None
                }
            })
            .collect()
    }

    pub fn lease_duration(&self) -> Option<Duration> {
        let re = lease_time_re().ok()?;
        let caps = re.captures(&self.lease_time)?;
        let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u64>().ok());
        Some(Duration::from_secs(
            part(1)? * 3600 + part(2)? * 60 + part(3)?,
        ))
    }
}

/// Parse an `a.b.c.d/len` pool with a prefix between /8 and /24.
pub fn parse_tiny_net(s: &str) -> Result<Ipv4Net> {
    let net: Ipv4Net = s
        .parse()
        .map_err(|_| Error::validation("TinyNets", format!("{:?} is not an IPv4 CIDR", s)))?;
    if !(MIN_PREFIX..=MAX_PREFIX).contains(&net.prefix_len()) {
        return Err(Error::validation(
            "TinyNets",
            format!("invalid prefix length {}", net.prefix_len()),
        ));
    }
    Ok(net.trunc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DhcpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_duration(), Some(Duration::from_secs(86400)));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&DhcpConfig::default()).unwrap();
        assert_eq!(
            json,
            r#"{"TinyNets":["192.168.2.0/24"],"LeaseTime":"24h0m0s"}"#
        );
    }

    #[test]
    fn test_prefix_bounds() {
        assert!(parse_tiny_net("10.0.0.0/8").is_ok());
        assert!(parse_tiny_net("10.0.0.0/24").is_ok());
        assert!(parse_tiny_net("10.0.0.0/7").is_err());
        assert!(parse_tiny_net("10.0.0.0/25").is_err());
        assert!(parse_tiny_net("10.0.0.0").is_err());
        assert!(parse_tiny_net("fd00::/64").is_err());
    }

    #[test]
    fn test_host_bits_truncated() {
        let net = parse_tiny_net("192.168.2.1/24").unwrap();
        assert_eq!(net.to_string(), "192.168.2.0/24");
    }

    #[test]
    fn test_validate_rejects_empty_pools() {
        let config = DhcpConfig {
            tiny_nets: vec![],
            lease_time: String::new(),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("TinyNets"));
    }

    #[test]
    fn test_validate_lease_time() {
        let mut config = DhcpConfig::default();
        config.lease_time = "1h30m0s".into();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease_duration(), Some(Duration::from_secs(5400)));

        config.lease_time = "90m".into();
        assert!(config.validate().is_err());

        config.lease_time = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nets_skips_garbage() {
        let config = DhcpConfig {
            tiny_nets: vec!["bogus".into(), "10.1.0.0/16".into()],
            lease_time: DEFAULT_LEASE_TIME.into(),
        };
        let nets = config.nets();
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].to_string(), "10.1.0.0/16");
    }
}
