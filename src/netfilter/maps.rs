//! Catalog of the maps the policy model writes to
//!
//! Names and key layouts match the base ruleset loaded at boot. The shapes
//! here are also what a map is created with when it is missing, and what is
//! assumed when the kernel shape cannot be read back.

use super::codec::{self, FieldType, KeyBuilder, Transport};
use super::Family;
use std::fmt;

pub const TABLE_FILTER: &str = "filter";
pub const TABLE_NAT: &str = "nat";

/// Chain holding one lookup rule per custom zone.
pub const CUSTOM_GROUPS_CHAIN: &str = "CUSTOM_GROUPS";
/// Chain that logs and drops blocked forwards.
pub const FWD_DROP_CHAIN: &str = "PFWDROPLOG";

/// `NFT_DATA_VERDICT`
pub const NFT_DATA_VERDICT: u32 = 0xffff_ff00;

/// `NFT_SET_*` flags
pub mod flags {
    pub const INTERVAL: u32 = 0x4;
    pub const MAP: u32 = 0x8;
    pub const CONCAT: u32 = 0x80;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Verdict,
    Fields(Vec<FieldType>),
}

/// Shape of a named map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapSpec {
    pub family: Family,
    pub table: String,
    pub name: String,
    pub key: Vec<FieldType>,
    pub data: DataType,
    pub interval: bool,
}

impl MapSpec {
    pub fn new(table: &str, name: impl Into<String>, key: Vec<FieldType>, data: DataType) -> Self {
        Self {
            family: Family::Inet,
            table: table.to_string(),
            name: name.into(),
            key,
            data,
            interval: false,
        }
    }

    fn vmap(table: &str, name: impl Into<String>, key: Vec<FieldType>) -> Self {
        Self::new(table, name, key, DataType::Verdict)
    }

    /// Mark as an interval map. Only concatenated keys use intervals here.
    pub fn with_interval(mut self) -> Self {
        self.interval = self.key.len() > 1;
        self
    }

    pub fn key_len(&self) -> usize {
        codec::fields_len(&self.key)
    }

    /// Data length in bytes; zero for verdict maps.
    pub fn data_len(&self) -> usize {
        match &self.data {
            DataType::Verdict => 0,
            DataType::Fields(f) => codec::fields_len(f),
        }
    }

    pub fn is_concat(&self) -> bool {
        self.key.len() > 1
    }

    pub fn is_verdict_map(&self) -> bool {
        self.data == DataType::Verdict
    }

    pub fn key_type(&self) -> u32 {
        codec::concat_type(&self.key)
    }

    pub fn data_type(&self) -> u32 {
        match &self.data {
            DataType::Verdict => NFT_DATA_VERDICT,
            DataType::Fields(f) => codec::concat_type(f),
        }
    }

    /// NFTA_SET_FLAGS for creation.
    pub fn set_flags(&self) -> u32 {
        let mut f = flags::MAP;
        if self.interval {
            f |= flags::INTERVAL;
        }
        if self.is_concat() {
            f |= flags::CONCAT;
        }
        f
    }

    /// A key builder sized for this map's key.
    pub fn key_builder(&self) -> KeyBuilder {
        KeyBuilder::new(self.key.len())
    }

    pub fn has_field(&self, field: FieldType) -> bool {
        self.key.contains(&field)
    }
}

impl fmt::Display for MapSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |fields: &[FieldType]| {
            fields
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(" . ")
        };
        let data = match &self.data {
            DataType::Verdict => "verdict".to_string(),
            DataType::Fields(d) => join(d),
        };
        write!(
            f,
            "{} {} {} {{ type {} : {}{} }}",
            self.family,
            self.table,
            self.name,
            join(&self.key),
            data,
            if self.interval { "; flags interval" } else { "" }
        )
    }
}

/// LAN or WAN side of a port/interface map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Lan,
    Wan,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Lan => "lan",
            Side::Wan => "wan",
        }
    }
}

use FieldType::{EtherAddr, Ifname, InetProto, InetService, Ipv4Addr};

/// `ip . ifname . mac : return` gate for every admitted device.
pub fn ethernet_filter() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "ethernet_filter", vec![Ipv4Addr, Ifname, EtherAddr])
}

/// `ifname . mac : accept` for devices allowed to speak DHCP.
pub fn dhcp_access() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "dhcp_access", vec![Ifname, EtherAddr])
}

pub fn internet_access() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "internet_access", vec![Ipv4Addr, Ifname])
}

pub fn dns_access() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "dns_access", vec![Ipv4Addr, Ifname]).with_interval()
}

pub fn lan_access() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "lan_access", vec![Ipv4Addr, Ifname])
}

/// `srcIP . srcPort : dstIP . dstPort`
pub fn forward(proto: Transport) -> MapSpec {
    MapSpec::new(
        TABLE_NAT,
        format!("{}fwd", proto),
        vec![Ipv4Addr, InetService],
        DataType::Fields(vec![Ipv4Addr, InetService]),
    )
    .with_interval()
}

/// `srcIP : dstIP`, all ports
pub fn any_forward(proto: Transport) -> MapSpec {
    MapSpec::new(
        TABLE_NAT,
        format!("{}anyfwd", proto),
        vec![Ipv4Addr],
        DataType::Fields(vec![Ipv4Addr]),
    )
}

pub fn block() -> MapSpec {
    MapSpec::vmap(TABLE_NAT, "block", vec![Ipv4Addr, Ipv4Addr, InetProto]).with_interval()
}

pub fn output_block() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "output_block", vec![Ipv4Addr, Ipv4Addr, InetProto])
        .with_interval()
}

pub fn forward_block() -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        "fwd_block",
        vec![Ipv4Addr, Ipv4Addr, InetProto, InetService],
    )
    .with_interval()
}

/// `port : accept` for services on the router itself.
pub fn port_accept(side: Side, proto: Transport) -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        format!("{}_{}_accept", side.as_str(), proto),
        vec![InetService],
    )
}

/// `deviceIP . endpointIP . port : accept`
pub fn endpoint_forward(proto: Transport) -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        format!("ept_{}fwd", proto),
        vec![Ipv4Addr, Ipv4Addr, InetService],
    )
    .with_interval()
}

pub fn multicast_accept(side: Side) -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        format!("multicast_{}_udp_accept", side.as_str()),
        vec![InetService],
    )
}

/// `ifname . srcIP : accept`
pub fn forward_interface(side: Side) -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        format!("fwd_iface_{}", side.as_str()),
        vec![Ifname, Ipv4Addr],
    )
    .with_interval()
}

pub fn ping_rules() -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, "ping_rules", vec![Ipv4Addr, Ifname]).with_interval()
}

/// `<zone>_dst_access`: `ip . ifname : continue`
pub fn zone_destination(zone: &str) -> MapSpec {
    MapSpec::vmap(TABLE_FILTER, format!("{}_dst_access", zone), vec![Ipv4Addr, Ifname])
        .with_interval()
}

/// `<zone>_mac_src_access`: `ip . ifname . mac : accept`
pub fn zone_source(zone: &str) -> MapSpec {
    MapSpec::vmap(
        TABLE_FILTER,
        format!("{}_mac_src_access", zone),
        vec![Ipv4Addr, Ifname, EtherAddr],
    )
    .with_interval()
}

/// Built-in verdict maps holding per-device entries.
pub fn device_access_maps() -> Vec<MapSpec> {
    vec![
        ethernet_filter(),
        dhcp_access(),
        internet_access(),
        dns_access(),
        lan_access(),
    ]
}

/// Resolve a map name to its shape.
pub fn lookup(name: &str) -> Option<MapSpec> {
    let proto = |s: &str| s.parse::<Transport>().ok();
    let side = |s: &str| match s {
        "lan" => Some(Side::Lan),
        "wan" => Some(Side::Wan),
        _ => None,
    };

    match name {
        "ethernet_filter" => return Some(ethernet_filter()),
        "dhcp_access" => return Some(dhcp_access()),
        "internet_access" => return Some(internet_access()),
        "dns_access" => return Some(dns_access()),
        "lan_access" => return Some(lan_access()),
        "block" => return Some(block()),
        "output_block" => return Some(output_block()),
        "fwd_block" => return Some(forward_block()),
        "ping_rules" => return Some(ping_rules()),
        _ => {}
    }

    if let Some(rest) = name.strip_prefix("ept_").and_then(|r| r.strip_suffix("fwd")) {
        return proto(rest).map(endpoint_forward);
    }
    if let Some(p) = name.strip_suffix("anyfwd") {
        return proto(p).map(any_forward);
    }
    if let Some(p) = name.strip_suffix("fwd") {
        if let Some(p) = proto(p) {
            return Some(forward(p));
        }
    }
    if let Some(s) = name.strip_prefix("fwd_iface_") {
        return side(s).map(forward_interface);
    }
    if let Some(s) = name
        .strip_prefix("multicast_")
        .and_then(|r| r.strip_suffix("_udp_accept"))
    {
        return side(s).map(multicast_accept);
    }
    if let Some(rest) = name.strip_suffix("_accept") {
        if let Some((s, p)) = rest.split_once('_') {
            if let (Some(s), Some(p)) = (side(s), proto(p)) {
                return Some(port_accept(s, p));
            }
        }
    }
    if let Some(zone) = name.strip_suffix("_mac_src_access") {
        return Some(zone_source(zone));
    }
    if let Some(zone) = name.strip_suffix("_dst_access") {
        return Some(zone_destination(zone));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_names() {
        assert_eq!(lookup("tcpfwd"), Some(forward(Transport::Tcp)));
        assert_eq!(lookup("udpanyfwd"), Some(any_forward(Transport::Udp)));
        assert_eq!(lookup("ept_tcpfwd"), Some(endpoint_forward(Transport::Tcp)));
        assert_eq!(lookup("wan_udp_accept"), Some(port_accept(Side::Wan, Transport::Udp)));
        assert_eq!(lookup("multicast_lan_udp_accept"), Some(multicast_accept(Side::Lan)));
        assert_eq!(lookup("fwd_iface_wan"), Some(forward_interface(Side::Wan)));
        assert_eq!(lookup("guests_dst_access"), Some(zone_destination("guests")));
        assert_eq!(lookup("guests_mac_src_access"), Some(zone_source("guests")));
        assert_eq!(lookup("sctpfwd"), None);
        assert_eq!(lookup("nonsense"), None);
    }

    #[test]
    fn test_known_shapes() {
        let fwd = forward(Transport::Tcp);
        assert_eq!(fwd.table, TABLE_NAT);
        assert_eq!(fwd.key_len(), 8);
        assert_eq!(fwd.data_len(), 8);
        assert!(!fwd.is_verdict_map());

        let any = any_forward(Transport::Udp);
        assert_eq!(any.key_len(), 4);
        assert_eq!(any.data_len(), 4);

        let block = block();
        assert_eq!(block.key_len(), 12);
        assert!(block.interval);
        assert_eq!(block.data_type(), NFT_DATA_VERDICT);

        assert_eq!(forward_block().key_len(), 16);
        assert_eq!(ethernet_filter().key_len(), 28);
        assert_eq!(dhcp_access().key_len(), 24);
        assert_eq!(port_accept(Side::Lan, Transport::Tcp).key_len(), 2);
    }

    #[test]
    fn test_interval_only_for_concat() {
        let single = MapSpec::vmap(TABLE_FILTER, "x", vec![FieldType::InetService]).with_interval();
        assert!(!single.interval);
        assert_eq!(single.set_flags(), flags::MAP);

        let zone = zone_destination("guests");
        assert_eq!(
            zone.set_flags(),
            flags::MAP | flags::INTERVAL | flags::CONCAT
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            zone_source("kids").to_string(),
            "inet filter kids_mac_src_access { type ipv4_addr . ifname . ether_addr : verdict; flags interval }"
        );
    }
}
