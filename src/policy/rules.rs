//! Firewall rules as verdict map entries

use super::PolicyEngine;
use crate::firewall::rules::{policy, ALL_PORTS, ANY_PORT};
use crate::firewall::{
    BlockRule, CustomInterfaceRule, Endpoint, FirewallConfig, ForwardingBlockRule, ForwardingRule,
    MulticastPort, OutputBlockRule, Rule, ServicePort,
};
use crate::identity::{DeviceStore, ZoneList};
use crate::netfilter::maps::{self, Side, FWD_DROP_CHAIN};
use crate::netfilter::{Element, KeyBuilder, MapSpec, Transport, Value, Verdict};
use crate::types::MacAddr;
use crate::Result;
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// One element of one map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub map: MapSpec,
    pub element: Element,
}

impl Entry {
    fn verdict(map: MapSpec, key: crate::netfilter::Key, verdict: Verdict) -> Self {
        Self {
            map,
            element: Element::verdict(key, verdict),
        }
    }
}

/// A rule that maps onto packet filter entries.
pub trait Installable {
    /// Entries present while the rule is installed.
    fn entries(&self) -> Result<Vec<Entry>>;

    /// Entries that must be absent while the rule is installed.
    fn withdrawn(&self) -> Result<Vec<Entry>> {
        Ok(Vec::new())
    }
}

impl Installable for ForwardingRule {
    fn entries(&self) -> Result<Vec<Entry>> {
        let proto = self.transport()?;
        if self.is_any_port() {
            let map = maps::any_forward(proto);
            let key = map.key_builder().ipv4(&self.src_ip)?.build();
            let dst = KeyBuilder::new(1).ipv4(&self.dst_ip)?.build();
            return Ok(vec![Entry {
                map,
                element: Element::new(key, Value::Data(dst.bytes)),
            }]);
        }

        let src_port = match self.src_port.as_str() {
            ANY_PORT => ALL_PORTS,
            port => port,
        };
        let map = maps::forward(proto);
        let key = map
            .key_builder()
            .ipv4(&self.src_ip)?
            .port(src_port)?
            .build();
        let dst = KeyBuilder::new(2)
            .ipv4(&self.dst_ip)?
            .port(&self.dst_port)?
            .build();
        Ok(vec![Entry {
            map,
            element: Element::new(key, Value::Data(dst.bytes)),
        }])
    }
}

fn drop_entry(map: MapSpec, src: &str, dst: &str, proto: &str) -> Result<Entry> {
    let key = map
        .key_builder()
        .ipv4(src)?
        .ipv4(dst)?
        .proto(proto)?
        .build();
    Ok(Entry::verdict(map, key, Verdict::Drop))
}

impl Installable for BlockRule {
    fn entries(&self) -> Result<Vec<Entry>> {
        Ok(vec![drop_entry(
            maps::block(),
            &self.src_ip,
            &self.dst_ip,
            &self.protocol,
        )?])
    }
}

impl Installable for OutputBlockRule {
    fn entries(&self) -> Result<Vec<Entry>> {
        Ok(vec![drop_entry(
            maps::output_block(),
            &self.src_ip,
            &self.dst_ip,
            &self.protocol,
        )?])
    }
}

impl Installable for ForwardingBlockRule {
    fn entries(&self) -> Result<Vec<Entry>> {
        let map = maps::forward_block();
        let port = if self.dst_port.is_empty() {
            ALL_PORTS
        } else {
            &self.dst_port
        };
        let key = map
            .key_builder()
            .ipv4(&self.src_ip)?
            .ipv4(&self.dst_ip)?
            .proto(&self.protocol)?
            .port(port)?
            .build();
        Ok(vec![Entry::verdict(
            map,
            key,
            Verdict::Goto(FWD_DROP_CHAIN.to_string()),
        )])
    }
}

fn port_entry(map: MapSpec, port: &str) -> Result<Entry> {
    let key = map.key_builder().port(port)?.build();
    Ok(Entry::verdict(map, key, Verdict::Accept))
}

impl Installable for ServicePort {
    fn entries(&self) -> Result<Vec<Entry>> {
        let proto: Transport = self.protocol.parse()?;
        let mut out = vec![port_entry(maps::port_accept(Side::Lan, proto), &self.port)?];
        if self.upstream_enabled {
            out.push(port_entry(maps::port_accept(Side::Wan, proto), &self.port)?);
        }
        Ok(out)
    }

    fn withdrawn(&self) -> Result<Vec<Entry>> {
        if self.upstream_enabled {
            return Ok(Vec::new());
        }
        let proto: Transport = self.protocol.parse()?;
        Ok(vec![port_entry(maps::port_accept(Side::Wan, proto), &self.port)?])
    }
}

impl Installable for MulticastPort {
    fn entries(&self) -> Result<Vec<Entry>> {
        let mut out = vec![port_entry(maps::multicast_accept(Side::Lan), &self.port)?];
        if self.upstream {
            out.push(port_entry(maps::multicast_accept(Side::Wan), &self.port)?);
        }
        Ok(out)
    }

    fn withdrawn(&self) -> Result<Vec<Entry>> {
        if self.upstream {
            return Ok(Vec::new());
        }
        Ok(vec![port_entry(maps::multicast_accept(Side::Wan), &self.port)?])
    }
}

/// Something a custom interface rule grants its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grant {
    Policy(String),
    Zone(String),
}

impl Grant {
    fn held_by(&self, rule: &CustomInterfaceRule) -> bool {
        match self {
            Grant::Policy(p) => rule.has_policy(p),
            Grant::Zone(z) => rule.groups.iter().any(|g| g == z),
        }
    }
}

fn grants(rule: &CustomInterfaceRule) -> Result<Vec<(Grant, Entry)>> {
    let mut out = Vec::new();
    for name in &rule.policies {
        let entry = match name.as_str() {
            policy::WAN | policy::LAN => {
                let side = if name == policy::WAN { Side::Wan } else { Side::Lan };
                let map = maps::forward_interface(side);
                let key = map
                    .key_builder()
                    .ifname(&rule.interface)?
                    .ipv4(&rule.src_ip)?
                    .build();
                Entry::verdict(map, key, Verdict::Accept)
            }
            policy::DNS => {
                let map = maps::dns_access();
                let key = map
                    .key_builder()
                    .ipv4(&rule.src_ip)?
                    .ifname(&rule.interface)?
                    .build();
                Entry::verdict(map, key, Verdict::Accept)
            }
            _ => continue,
        };
        out.push((Grant::Policy(name.clone()), entry));
    }
    for zone in &rule.groups {
        let map = maps::zone_destination(zone);
        let key = map
            .key_builder()
            .ipv4(&rule.src_ip)?
            .ifname(&rule.interface)?
            .build();
        out.push((Grant::Zone(zone.clone()), Entry::verdict(map, key, Verdict::Continue)));
    }
    Ok(out)
}

impl Installable for CustomInterfaceRule {
    fn entries(&self) -> Result<Vec<Entry>> {
        Ok(grants(self)?.into_iter().map(|(_, e)| e).collect())
    }
}

/// `deviceIP . endpointIP . port : accept`
pub(super) fn endpoint_entry(device_ip: Ipv4Addr, endpoint: &Endpoint) -> Result<Entry> {
    let map = maps::endpoint_forward(endpoint.transport()?);
    let port = match endpoint.port.as_str() {
        "" | ANY_PORT => ALL_PORTS,
        port => port,
    };
    let key = map
        .key_builder()
        .addr(device_ip)
        .ipv4(&endpoint.ip)?
        .port(port)?
        .build();
    Ok(Entry::verdict(map, key, Verdict::Accept))
}

/// Outcome of [`PolicyEngine::apply_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub installed: usize,
    pub failed: usize,
    pub refreshed: usize,
    /// Devices without a known address or interface.
    pub skipped: usize,
}

impl PolicyEngine {
    /// Install a rule's entries. Disabled rules install nothing.
    pub fn install<R: Rule + Installable>(&self, rule: &R) -> Result<()> {
        if !rule.is_enabled() {
            debug!("{} rule {:?} is disabled", R::KIND, rule.base().rule_name);
            return Ok(());
        }
        let result = self.install_entries(rule);
        match &result {
            Ok(()) => self.metrics.rules_installed.inc(),
            Err(_) => self.metrics.rules_failed.inc(),
        }
        result
    }

    fn install_entries<R: Installable>(&self, rule: &R) -> Result<()> {
        for entry in rule.withdrawn()? {
            self.delete(&entry.map, &entry.element.key)?;
        }
        for entry in rule.entries()? {
            self.add(&entry.map, &entry.element)?;
        }
        Ok(())
    }

    /// Remove a rule's entries, including any it withdraws. A key an
    /// enabled rule in `remaining` still produces is written back with that
    /// rule's value instead. Disabled rules installed nothing and remove
    /// nothing.
    pub fn uninstall<R: Rule + Installable>(&self, rule: &R, remaining: &[R]) -> Result<()> {
        if !rule.is_enabled() {
            debug!("{} rule {:?} was disabled", R::KIND, rule.base().rule_name);
            return Ok(());
        }
        let mut kept = Vec::new();
        for other in remaining.iter().filter(|r| *r != rule && r.is_enabled()) {
            kept.extend(other.entries()?);
        }
        for entry in rule.entries()?.into_iter().chain(rule.withdrawn()?) {
            let shared = kept
                .iter()
                .find(|k| k.map == entry.map && k.element.key == entry.element.key);
            match shared {
                Some(k) => {
                    debug!("Keeping {:?} in {}, still used", k.element.key, k.map.name);
                    self.add(&k.map, &k.element)?;
                }
                None => {
                    self.delete(&entry.map, &entry.element.key)?;
                }
            }
        }
        debug!("Uninstalled {} rule {:?}", R::KIND, rule.base().rule_name);
        Ok(())
    }

    /// Remove a custom interface rule's entries, keeping any grant another
    /// enabled rule for the same interface and source still carries.
    pub fn uninstall_custom_interface(
        &self,
        rule: &CustomInterfaceRule,
        remaining: &[CustomInterfaceRule],
    ) -> Result<()> {
        for (grant, entry) in grants(rule)? {
            let kept = remaining
                .iter()
                .filter(|r| *r != rule && r.is_enabled() && r.same_source(rule))
                .any(|r| grant.held_by(r));
            if kept {
                debug!("Keeping {:?} for {} on {}", grant, rule.src_ip, rule.interface);
                continue;
            }
            self.delete(&entry.map, &entry.element.key)?;
        }
        Ok(())
    }

    /// Grant `endpoint` to every tagged device with a known address, and
    /// withdraw it from the rest.
    pub fn install_endpoint(&self, endpoint: &Endpoint, devices: &DeviceStore) -> Result<()> {
        if !endpoint.has_ip() {
            debug!("Endpoint {} has no IP, nothing to install", endpoint.base.rule_name);
            return Ok(());
        }
        let grant = endpoint.is_enabled();
        for (_, device) in devices.iter() {
            let Some(ip) = self.device_ip(device) else {
                continue;
            };
            let entry = endpoint_entry(ip, endpoint)?;
            if grant && device.has_any_tag(&endpoint.tags) {
                self.add(&entry.map, &entry.element)?;
            } else {
                self.delete(&entry.map, &entry.element.key)?;
            }
        }
        Ok(())
    }

    pub fn uninstall_endpoint(&self, endpoint: &Endpoint, devices: &DeviceStore) -> Result<()> {
        if !endpoint.has_ip() {
            return Ok(());
        }
        for (_, device) in devices.iter() {
            if let Some(ip) = self.device_ip(device) {
                let entry = endpoint_entry(ip, endpoint)?;
                self.delete(&entry.map, &entry.element.key)?;
            }
        }
        Ok(())
    }

    fn device_ip(&self, device: &crate::identity::Device) -> Option<Ipv4Addr> {
        device
            .recent_ip
            .or_else(|| device.mac.and_then(|mac| self.arp.lookup(mac)))
    }

    /// Allow ICMP echo to the router from internal interfaces and/or WAN.
    pub fn set_icmp(&self, lan: bool, wan: bool) -> Result<()> {
        let map = maps::ping_rules();
        self.flush(&map)?;

        let mut ifaces: Vec<&String> = Vec::new();
        if lan {
            ifaces.extend(self.interfaces.internal());
        }
        if wan {
            ifaces.extend(&self.interfaces.wan);
        }
        for iface in ifaces {
            let key = map
                .key_builder()
                .ipv4("0.0.0.0/0")?
                .ifname(iface)?
                .build();
            self.add(&map, &Element::verdict(key, Verdict::Accept))?;
        }
        info!("Ping rules set: lan={} wan={}", lan, wan);
        Ok(())
    }

    fn install_all<R: Rule + Installable>(&self, rules: &[R], summary: &mut ApplySummary) {
        for rule in rules.iter().filter(|r| r.is_enabled()) {
            match self.install(rule) {
                Ok(()) => summary.installed += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!("Failed to install {} rule {:?}: {}", R::KIND, rule, e);
                }
            }
        }
    }

    /// Install every persisted rule and refresh every device.
    ///
    /// Rule failures are counted and logged; the pass continues. Port and
    /// interface maps owned entirely by rules are flushed first so entries
    /// of deleted rules do not survive a restart.
    pub fn apply_all(
        &self,
        config: &FirewallConfig,
        devices: &DeviceStore,
        zones: &ZoneList,
        iface_hints: &HashMap<MacAddr, String>,
    ) -> Result<ApplySummary> {
        let mut summary = ApplySummary::default();

        self.install_all(&config.forwarding_rules, &mut summary);
        self.install_all(&config.block_rules, &mut summary);
        self.install_all(&config.output_block_rules, &mut summary);
        self.install_all(&config.forwarding_block_rules, &mut summary);

        for side in [Side::Lan, Side::Wan] {
            for proto in [Transport::Tcp, Transport::Udp] {
                self.flush(&maps::port_accept(side, proto))?;
            }
            self.flush(&maps::multicast_accept(side))?;
            self.flush(&maps::forward_interface(side))?;
        }
        self.install_all(&config.service_ports, &mut summary);
        self.install_all(&config.multicast_ports, &mut summary);
        self.set_icmp(config.ping_lan, config.ping_wan)?;
        self.install_all(&config.custom_interface_rules, &mut summary);

        for (_, device) in devices.iter() {
            let hint = device.mac.and_then(|mac| iface_hints.get(&mac));
            match self.refresh(device, hint.map(String::as_str), zones, &config.endpoints) {
                Ok(true) => summary.refreshed += 1,
                Ok(false) => summary.skipped += 1,
                Err(_) => summary.failed += 1,
            }
        }

        info!(
            "Applied firewall: {} rules installed, {} failed, {} devices refreshed, {} skipped",
            summary.installed, summary.failed, summary.refreshed, summary.skipped
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::make_engine;
    use super::*;
    use crate::firewall::BaseRule;
    use crate::identity::Device;
    use crate::netfilter::codec::{decode_key, KeyPart};

    fn make_block() -> BlockRule {
        BlockRule {
            protocol: "tcp".into(),
            src_ip: "192.168.1.0/24".into(),
            dst_ip: "8.8.8.8".into(),
            ..Default::default()
        }
    }

    fn make_cir(policies: &[&str], groups: &[&str]) -> CustomInterfaceRule {
        CustomInterfaceRule {
            interface: "docker0".into(),
            src_ip: "172.17.0.2".into(),
            policies: policies.iter().map(|p| p.to_string()).collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_block_entry_key() {
        let (filter, engine) = make_engine();
        engine.install(&make_block()).unwrap();

        let stored = filter.elements("nat", "block");
        assert_eq!(stored.len(), 1);
        let parts = decode_key(&maps::block().key, &stored[0].key.bytes).unwrap();
        assert_eq!(
            parts,
            vec![
                KeyPart::Ipv4("192.168.1.0".parse().unwrap()),
                KeyPart::Ipv4("8.8.8.8".parse().unwrap()),
                KeyPart::Proto(6),
            ]
        );
        assert_eq!(stored[0].value, Value::Verdict(Verdict::Drop));

        engine.uninstall(&make_block(), &[]).unwrap();
        assert!(filter.elements("nat", "block").is_empty());
    }

    #[test]
    fn test_uninstall_keeps_shared_key() {
        let (filter, engine) = make_engine();
        let first = make_block();
        let mut second = make_block();
        second.base.rule_name = "second".into();
        engine.install(&first).unwrap();
        engine.install(&second).unwrap();
        assert_eq!(filter.elements("nat", "block").len(), 1);

        engine.uninstall(&second, &[first.clone()]).unwrap();
        assert_eq!(filter.elements("nat", "block").len(), 1);

        let mut disabled = make_block();
        disabled.base.disabled = true;
        engine.uninstall(&disabled, &[]).unwrap();
        assert_eq!(filter.elements("nat", "block").len(), 1);

        engine.uninstall(&first, &[]).unwrap();
        assert!(filter.elements("nat", "block").is_empty());
    }

    #[test]
    fn test_disabled_rule_not_installed() {
        let (filter, engine) = make_engine();
        let mut rule = make_block();
        rule.base.disabled = true;
        engine.install(&rule).unwrap();
        assert!(filter.elements("nat", "block").is_empty());
    }

    #[test]
    fn test_forwarding_maps() {
        let (filter, engine) = make_engine();
        let any = ForwardingRule {
            protocol: "tcp".into(),
            src_ip: "192.168.2.1".into(),
            src_port: "any".into(),
            dst_ip: "192.168.2.50".into(),
            dst_port: "any".into(),
            ..Default::default()
        };
        engine.install(&any).unwrap();
        assert_eq!(filter.elements("nat", "tcpanyfwd").len(), 1);

        let port = ForwardingRule {
            protocol: "udp".into(),
            src_ip: "10.0.0.0/24".into(),
            src_port: "5000-5010".into(),
            dst_ip: "192.168.2.50".into(),
            dst_port: "5000".into(),
            ..Default::default()
        };
        engine.install(&port).unwrap();
        let stored = filter.elements("nat", "udpfwd");
        assert_eq!(stored.len(), 1);
        assert!(stored[0].key.is_range());
    }

    #[test]
    fn test_forwarding_block_goto() {
        let (filter, engine) = make_engine();
        let rule = ForwardingBlockRule {
            protocol: "udp".into(),
            src_ip: "192.168.2.0/24".into(),
            dst_ip: "1.1.1.1".into(),
            ..Default::default()
        };
        engine.install(&rule).unwrap();
        let stored = filter.elements("filter", "fwd_block");
        assert_eq!(
            stored[0].value,
            Value::Verdict(Verdict::Goto(FWD_DROP_CHAIN.to_string()))
        );
    }

    #[test]
    fn test_service_port_upstream_withdrawn() {
        let (filter, engine) = make_engine();
        let mut port = ServicePort {
            protocol: "tcp".into(),
            port: "22".into(),
            upstream_enabled: true,
            ..Default::default()
        };
        engine.install(&port).unwrap();
        assert_eq!(filter.elements("filter", "lan_tcp_accept").len(), 1);
        assert_eq!(filter.elements("filter", "wan_tcp_accept").len(), 1);

        port.upstream_enabled = false;
        engine.install(&port).unwrap();
        assert_eq!(filter.elements("filter", "lan_tcp_accept").len(), 1);
        assert!(filter.elements("filter", "wan_tcp_accept").is_empty());
    }

    #[test]
    fn test_multicast_entries() {
        let (filter, engine) = make_engine();
        let port = MulticastPort {
            port: "5353".into(),
            upstream: false,
            ..Default::default()
        };
        engine.install(&port).unwrap();
        assert_eq!(filter.elements("filter", "multicast_lan_udp_accept").len(), 1);
        assert!(filter.elements("filter", "multicast_wan_udp_accept").is_empty());
    }

    #[test]
    fn test_custom_interface_grants() {
        let (filter, engine) = make_engine();
        let rule = make_cir(&["wan", "dns", "api"], &["media"]);
        engine.install(&rule).unwrap();

        assert_eq!(filter.elements("filter", "fwd_iface_wan").len(), 1);
        assert_eq!(filter.elements("filter", "dns_access").len(), 1);
        assert!(filter.elements("filter", "fwd_iface_lan").is_empty());
        assert_eq!(filter.elements("filter", "media_dst_access").len(), 1);
        assert!(filter.has_map("filter", "media_mac_src_access"));
    }

    #[test]
    fn test_custom_interface_grant_retained() {
        let (filter, engine) = make_engine();
        let first = make_cir(&["wan"], &[]);
        let mut second = make_cir(&["wan", "lan"], &[]);
        second.route_dst = "10.8.0.1".into();
        engine.install(&first).unwrap();
        engine.install(&second).unwrap();

        engine
            .uninstall_custom_interface(&second, &[first.clone(), second.clone()])
            .unwrap();
        assert_eq!(filter.elements("filter", "fwd_iface_wan").len(), 1);
        assert!(filter.elements("filter", "fwd_iface_lan").is_empty());

        engine.uninstall_custom_interface(&first, &[first.clone()]).unwrap();
        assert!(filter.elements("filter", "fwd_iface_wan").is_empty());
    }

    #[test]
    fn test_set_icmp() {
        let (filter, engine) = make_engine();
        engine.set_icmp(true, false).unwrap();
        // wlan0 and wg0
        assert_eq!(filter.elements("filter", "ping_rules").len(), 2);

        engine.set_icmp(false, true).unwrap();
        assert_eq!(filter.elements("filter", "ping_rules").len(), 1);

        engine.set_icmp(false, false).unwrap();
        assert!(filter.elements("filter", "ping_rules").is_empty());
    }

    #[test]
    fn test_install_endpoint_by_tag() {
        let (filter, engine) = make_engine();
        let mut devices = DeviceStore::new();
        let mut tagged = Device::from_dhcp("aa:bb:cc:dd:ee:01".parse().unwrap(), "192.168.2.2".parse().unwrap());
        tagged.tags = vec!["printers".into()];
        devices.insert(tagged).unwrap();
        devices
            .insert(Device::from_dhcp("aa:bb:cc:dd:ee:02".parse().unwrap(), "192.168.2.6".parse().unwrap()))
            .unwrap();

        let endpoint = Endpoint {
            base: BaseRule {
                rule_name: "printer".into(),
                disabled: false,
            },
            protocol: "tcp".into(),
            ip: "192.168.2.40".into(),
            port: "631".into(),
            tags: vec!["printers".into()],
            ..Default::default()
        };
        engine.install_endpoint(&endpoint, &devices).unwrap();
        assert_eq!(filter.elements("filter", "ept_tcpfwd").len(), 1);

        engine.uninstall_endpoint(&endpoint, &devices).unwrap();
        assert!(filter.elements("filter", "ept_tcpfwd").is_empty());
    }

    #[test]
    fn test_apply_all_flushes_rule_maps() {
        let (filter, engine) = make_engine();
        let stale = ServicePort {
            protocol: "udp".into(),
            port: "1900".into(),
            ..Default::default()
        };
        engine.install(&stale).unwrap();

        let config = FirewallConfig {
            block_rules: vec![make_block()],
            service_ports: vec![ServicePort {
                protocol: "tcp".into(),
                port: "443".into(),
                ..Default::default()
            }],
            ping_lan: true,
            ..Default::default()
        };
        let summary = engine
            .apply_all(&config, &DeviceStore::new(), &ZoneList::default(), &HashMap::new())
            .unwrap();

        assert_eq!(summary.installed, 2);
        assert_eq!(summary.failed, 0);
        assert!(filter.elements("filter", "lan_udp_accept").is_empty());
        assert_eq!(filter.elements("filter", "lan_tcp_accept").len(), 1);
        assert_eq!(filter.elements("filter", "ping_rules").len(), 2);
    }
}
