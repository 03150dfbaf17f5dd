//! Firewall rule variants
//!
//! Rules have no identity beyond their fields. Each variant validates (and
//! canonicalises) itself before it is stored; see [`Rule`].

use crate::netfilter::codec::{parse_ipv4_or_cidr, parse_port_range};
use crate::netfilter::Transport;
use crate::types::{is_valid_ifname, normalize_list};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Port value meaning "no port component".
pub const ANY_PORT: &str = "any";
/// Full port range.
pub const ALL_PORTS: &str = "0-65535";

/// Custom interface policies that install verdict map entries.
pub mod policy {
    pub const WAN: &str = "wan";
    pub const LAN: &str = "lan";
    pub const DNS: &str = "dns";
    pub const LAN_UPSTREAM: &str = "lan_upstream";

    /// Every policy name a rule may carry.
    pub const ALL: &[&str] = &[
        WAN,
        LAN,
        DNS,
        LAN_UPSTREAM,
        "api",
        "disabled",
        "quarantine",
        "dns:family",
    ];

    pub fn is_valid(name: &str) -> bool {
        ALL.contains(&name)
    }
}

/// Fields shared by every rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BaseRule {
    #[serde(default)]
    pub rule_name: String,
    #[serde(default)]
    pub disabled: bool,
}

fn transport(protocol: &str) -> Result<Transport> {
    protocol.parse()
}

fn check_net(field: &'static str, value: &str) -> Result<()> {
    parse_ipv4_or_cidr(value)
        .map(|_| ())
        .map_err(|_| Error::validation(field, format!("'{}' is not an IP or CIDR", value)))
}

fn check_addr(field: &'static str, value: &str) -> Result<Ipv4Addr> {
    value
        .parse()
        .map_err(|_| Error::validation(field, format!("'{}' is not an IP address", value)))
}

fn check_port(field: &'static str, value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::validation(field, format!("'{}' is not a port number", value)))
}

fn check_port_range(field: &'static str, value: &str) -> Result<()> {
    parse_port_range(value)
        .map(|_| ())
        .map_err(|_| Error::validation(field, format!("'{}' is not a port or port range", value)))
}

/// Destination NAT: traffic to `SrcIP[:SrcPort]` is sent to `DstIP[:DstPort]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingRule {
    #[serde(flatten)]
    pub base: BaseRule,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(rename = "DstPort")]
    pub dst_port: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    #[serde(rename = "SrcPort")]
    pub src_port: String,
}

impl ForwardingRule {
    pub fn transport(&self) -> Result<Transport> {
        transport(&self.protocol)
    }

    /// Whether the rule forwards all ports.
    pub fn is_any_port(&self) -> bool {
        self.dst_port == ANY_PORT
    }
}

/// Drop traffic between two networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRule {
    #[serde(flatten)]
    pub base: BaseRule,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
}

/// Drop traffic the router itself originates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBlockRule {
    #[serde(flatten)]
    pub base: BaseRule,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(rename = "DstPort", default)]
    pub dst_port: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
}

/// Drop (and log) forwarded traffic to a port range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingBlockRule {
    #[serde(flatten)]
    pub base: BaseRule,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "DstIP")]
    pub dst_ip: String,
    #[serde(rename = "DstPort", default)]
    pub dst_port: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
}

/// A port on the router opened to the LAN, and optionally upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServicePort {
    #[serde(flatten)]
    pub base: BaseRule,
    pub protocol: String,
    pub port: String,
    #[serde(default)]
    pub upstream_enabled: bool,
}

/// A multicast (UDP) port relayed on the LAN, and optionally upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MulticastPort {
    #[serde(flatten)]
    pub base: BaseRule,
    pub port: String,
    #[serde(default)]
    pub upstream: bool,
}

/// A destination that devices carrying one of `Tags` may reach.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(flatten)]
    pub base: BaseRule,
    #[serde(rename = "Protocol")]
    pub protocol: String,
    #[serde(rename = "IP", default)]
    pub ip: String,
    #[serde(rename = "Domain", default)]
    pub domain: String,
    #[serde(rename = "Port")]
    pub port: String,
    #[serde(rename = "Tags", default)]
    pub tags: Vec<String>,
}

impl Endpoint {
    pub fn transport(&self) -> Result<Transport> {
        transport(&self.protocol)
    }

    /// Endpoints given only by domain are resolved elsewhere and install
    /// nothing here.
    pub fn has_ip(&self) -> bool {
        !self.ip.is_empty()
    }
}

/// Traffic policy for addresses behind a non-device interface
/// (containers, VPN uplinks).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomInterfaceRule {
    #[serde(flatten)]
    pub base: BaseRule,
    pub interface: String,
    #[serde(rename = "SrcIP")]
    pub src_ip: String,
    #[serde(default)]
    pub route_dst: String,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CustomInterfaceRule {
    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.iter().any(|p| p == name)
    }

    /// Whether two rules address the same source behind the same interface.
    pub fn same_source(&self, other: &Self) -> bool {
        self.interface == other.interface && self.src_ip == other.src_ip
    }

    /// Move legacy Groups entries that name a policy into Policies.
    /// Returns whether anything moved.
    pub fn migrate_groups(&mut self) -> bool {
        let (moved, kept): (Vec<String>, Vec<String>) = self
            .groups
            .drain(..)
            .partition(|g| policy::is_valid(g));
        self.groups = kept;
        if moved.is_empty() {
            return false;
        }
        let mut policies = std::mem::take(&mut self.policies);
        policies.extend(moved);
        self.policies = normalize_list(&policies);
        true
    }
}

/// The persisted firewall configuration (`firewall.json`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FirewallConfig {
    #[serde(default)]
    pub forwarding_rules: Vec<ForwardingRule>,
    #[serde(default)]
    pub block_rules: Vec<BlockRule>,
    #[serde(default)]
    pub output_block_rules: Vec<OutputBlockRule>,
    #[serde(default)]
    pub forwarding_block_rules: Vec<ForwardingBlockRule>,
    #[serde(default)]
    pub custom_interface_rules: Vec<CustomInterfaceRule>,
    #[serde(default)]
    pub service_ports: Vec<ServicePort>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub multicast_ports: Vec<MulticastPort>,
    #[serde(default)]
    pub ping_lan: bool,
    #[serde(default)]
    pub ping_wan: bool,
    #[serde(rename = "SystemDNSOverride", default)]
    pub system_dns_override: String,
}

/// Rule variant names, as used on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Forwarding,
    Block,
    OutputBlock,
    ForwardingBlock,
    ServicePort,
    Endpoint,
    Multicast,
    CustomInterface,
}

impl RuleKind {
    pub const ALL: [RuleKind; 8] = [
        RuleKind::Forwarding,
        RuleKind::Block,
        RuleKind::OutputBlock,
        RuleKind::ForwardingBlock,
        RuleKind::ServicePort,
        RuleKind::Endpoint,
        RuleKind::Multicast,
        RuleKind::CustomInterface,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RuleKind::Forwarding => "forwarding",
            RuleKind::Block => "block",
            RuleKind::OutputBlock => "output-block",
            RuleKind::ForwardingBlock => "forwarding-block",
            RuleKind::ServicePort => "service-port",
            RuleKind::Endpoint => "endpoint",
            RuleKind::Multicast => "multicast",
            RuleKind::CustomInterface => "custom-interface",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        RuleKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Parse(format!("unknown rule kind '{}'", s)))
    }
}

/// Behaviour shared by every rule variant.
pub trait Rule:
    fmt::Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + 'static
{
    const KIND: RuleKind;

    fn base(&self) -> &BaseRule;

    /// Check every field and bring the rule into canonical form.
    fn validate(&mut self) -> Result<()>;

    /// Check what a delete request needs to identify the stored rule.
    fn validate_delete(&mut self) -> Result<()> {
        self.validate()
    }

    /// Whether `other` is the stored rule this one replaces or deletes.
    fn same_slot(&self, other: &Self) -> bool {
        self == other
    }

    /// Reject an insert that clashes with a stored rule.
    fn check_conflict(&self, _existing: &Self) -> Result<()> {
        Ok(())
    }

    fn list(config: &FirewallConfig) -> &Vec<Self>;

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self>;

    fn is_enabled(&self) -> bool {
        !self.base().disabled
    }
}

impl Rule for ForwardingRule {
    const KIND: RuleKind = RuleKind::Forwarding;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        self.transport()?;
        if self.src_port != ANY_PORT {
            check_port_range("SrcPort", &self.src_port)?;
        }
        if self.dst_port != ANY_PORT {
            check_port("DstPort", &self.dst_port)?;
        }
        check_net("SrcIP", &self.src_ip)?;
        check_addr("DstIP", &self.dst_ip)?;
        if self.is_any_port() && self.src_ip.contains('/') {
            return Err(Error::validation(
                "SrcIP",
                "a CIDR source needs a specific DstPort",
            ));
        }
        Ok(())
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.forwarding_rules
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.forwarding_rules
    }
}

impl Rule for BlockRule {
    const KIND: RuleKind = RuleKind::Block;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        transport(&self.protocol)?;
        check_net("SrcIP", &self.src_ip)?;
        check_net("DstIP", &self.dst_ip)
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.block_rules
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.block_rules
    }
}

impl Rule for OutputBlockRule {
    const KIND: RuleKind = RuleKind::OutputBlock;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        transport(&self.protocol)?;
        check_net("SrcIP", &self.src_ip)?;
        check_net("DstIP", &self.dst_ip)
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.output_block_rules
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.output_block_rules
    }
}

impl Rule for ForwardingBlockRule {
    const KIND: RuleKind = RuleKind::ForwardingBlock;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        transport(&self.protocol)?;
        if self.dst_port.is_empty() {
            self.dst_port = ALL_PORTS.to_string();
        }
        check_port_range("DstPort", &self.dst_port)?;
        check_net("SrcIP", &self.src_ip)?;
        check_net("DstIP", &self.dst_ip)
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.forwarding_block_rules
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.forwarding_block_rules
    }
}

impl Rule for ServicePort {
    const KIND: RuleKind = RuleKind::ServicePort;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        transport(&self.protocol)?;
        check_port("Port", &self.port)?;
        Ok(())
    }

    fn same_slot(&self, other: &Self) -> bool {
        self.protocol == other.protocol && self.port == other.port
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.service_ports
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.service_ports
    }
}

impl Rule for MulticastPort {
    const KIND: RuleKind = RuleKind::Multicast;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        check_port("Port", &self.port)?;
        Ok(())
    }

    fn same_slot(&self, other: &Self) -> bool {
        self.port == other.port
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.multicast_ports
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.multicast_ports
    }
}

impl Rule for Endpoint {
    const KIND: RuleKind = RuleKind::Endpoint;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        if self.base.rule_name.is_empty() {
            return Err(Error::validation("RuleName", "an endpoint needs a name"));
        }
        match (self.ip.is_empty(), self.domain.is_empty()) {
            (true, true) => {
                return Err(Error::validation("IP", "one of IP or Domain is required"))
            }
            (false, false) => {
                return Err(Error::validation("Domain", "IP and Domain are exclusive"))
            }
            (false, true) => check_net("IP", &self.ip)?,
            (true, false) => {}
        }
        self.transport()?;
        if self.port == ANY_PORT {
            self.port = ALL_PORTS.to_string();
        }
        check_port_range("Port", &self.port)?;
        let raw = self.tags.len();
        self.tags = normalize_list(&self.tags);
        if raw > 0 && self.tags.is_empty() {
            return Err(Error::validation("Tags", "tags must not be blank"));
        }
        Ok(())
    }

    fn validate_delete(&mut self) -> Result<()> {
        if self.base.rule_name.is_empty() {
            return Err(Error::validation("RuleName", "an endpoint needs a name"));
        }
        Ok(())
    }

    fn same_slot(&self, other: &Self) -> bool {
        self.base.rule_name == other.base.rule_name
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.endpoints
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.endpoints
    }
}

impl Rule for CustomInterfaceRule {
    const KIND: RuleKind = RuleKind::CustomInterface;

    fn base(&self) -> &BaseRule {
        &self.base
    }

    fn validate(&mut self) -> Result<()> {
        check_net("SrcIP", &self.src_ip)?;
        if !self.route_dst.is_empty() {
            check_addr("RouteDst", &self.route_dst)?;
        }
        if !is_valid_ifname(&self.interface) {
            return Err(Error::validation(
                "Interface",
                format!("'{}' is not an interface name", self.interface),
            ));
        }

        self.groups = normalize_list(&self.groups);
        self.policies = normalize_list(&self.policies);
        self.tags = normalize_list(&self.tags);

        if let Some(bad) = self.policies.iter().find(|p| !policy::is_valid(p)) {
            return Err(Error::validation(
                "Policies",
                format!("unknown policy '{}'", bad),
            ));
        }
        for group in &self.groups {
            crate::identity::validate_zone_name(group)
                .map_err(|_| Error::validation("Groups", format!("invalid zone name '{}'", group)))?;
        }
        let ranged = self.src_ip.contains('/');
        if ranged && self.has_policy(policy::LAN_UPSTREAM) {
            return Err(Error::validation(
                "Policies",
                "lan_upstream is not supported with a SrcIP range",
            ));
        }
        if ranged && !self.tags.is_empty() {
            return Err(Error::validation(
                "Tags",
                "tags are not supported with a SrcIP range",
            ));
        }
        Ok(())
    }

    fn check_conflict(&self, existing: &Self) -> Result<()> {
        if self.same_source(existing) && self.route_dst == existing.route_dst {
            return Err(Error::Conflict(format!(
                "a rule for {} on {} already exists",
                self.src_ip, self.interface
            )));
        }
        Ok(())
    }

    fn list(config: &FirewallConfig) -> &Vec<Self> {
        &config.custom_interface_rules
    }

    fn list_mut(config: &mut FirewallConfig) -> &mut Vec<Self> {
        &mut config.custom_interface_rules
    }
}
