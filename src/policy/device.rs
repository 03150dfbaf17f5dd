//! Per-device verdict entries

use super::PolicyEngine;
use crate::firewall::{Endpoint, Rule};
use crate::identity::{Device, ZoneKind, ZoneList};
use crate::netfilter::codec::{decode_key, FieldType, KeyPart};
use crate::netfilter::{maps, Element, Key, MapSpec, Verdict};
use crate::types::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Where a device currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub ip: Ipv4Addr,
    pub iface: String,
    pub mac: Option<MacAddr>,
}

impl Target {
    pub fn is_wireguard(&self) -> bool {
        self.iface.starts_with("wg")
    }

    /// Whether an existing entry belongs to this device.
    ///
    /// WireGuard entries are only considered for a device on the same
    /// WireGuard interface, and never for a device elsewhere.
    fn owns(
        &self,
        ip: Option<Ipv4Addr>,
        iface: Option<&str>,
        mac: Option<MacAddr>,
        match_iface: bool,
    ) -> bool {
        let entry_iface = iface.unwrap_or("");
        if self.is_wireguard() {
            if entry_iface != self.iface {
                return false;
            }
        } else if entry_iface.starts_with("wg") {
            return false;
        }

        ip == Some(self.ip)
            || (match_iface && entry_iface == self.iface)
            || (self.mac.is_some() && mac == self.mac)
    }

    /// This device's key in `map`, or None when the map needs a MAC and the
    /// device has none.
    fn key_in(&self, map: &MapSpec) -> Result<Option<Key>> {
        let mut builder = map.key_builder();
        for field in &map.key {
            builder = match field {
                FieldType::Ipv4Addr => builder.addr(self.ip),
                FieldType::Ifname => builder.ifname(&self.iface)?,
                FieldType::EtherAddr => match self.mac {
                    Some(mac) => builder.mac(mac),
                    None => return Ok(None),
                },
                other => {
                    return Err(Error::Protocol(format!(
                        "{} has a {} field, not a device attribute",
                        map.name,
                        other.name()
                    )))
                }
            };
        }
        Ok(Some(builder.build()))
    }
}

/// Device attributes found in a decoded key.
fn key_fields(parts: &[KeyPart]) -> (Option<Ipv4Addr>, Option<&str>, Option<MacAddr>) {
    let mut out = (None, None, None);
    for part in parts {
        match part {
            KeyPart::Ipv4(ip) => out.0 = Some(*ip),
            KeyPart::Ifname(name) => out.1 = Some(name.as_str()),
            KeyPart::Mac(mac) => out.2 = Some(*mac),
            _ => {}
        }
    }
    out
}

impl PolicyEngine {
    /// Interface a MAC was last admitted on, from `dhcp_access`.
    fn iface_for_mac(&self, mac: MacAddr) -> Result<Option<String>> {
        let map = self.map(&maps::dhcp_access())?;
        let elements = match self.filter.list_elements(&map) {
            Ok(elements) => elements,
            Err(e) if e.is_enumeration_quirk() => {
                self.metrics.enumeration_quirks.inc();
                warn!("Cannot read {} to find {}'s interface: {}", map.name, mac, e);
                return Ok(None);
            }
            Err(Error::MapNotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };

        for element in elements {
            let Ok(parts) = decode_key(&map.key, &element.key.bytes) else {
                continue;
            };
            if let (_, Some(iface), Some(found)) = key_fields(&parts) {
                if found == mac {
                    return Ok(Some(iface.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Current IP and interface of a device.
    ///
    /// The IP is the recorded one, else the ARP table's. The interface is
    /// `iface_hint`, else the device's `dhcp_access` entry, else the first
    /// WireGuard interface for a device with a WireGuard key.
    pub fn resolve(&self, device: &Device, iface_hint: Option<&str>) -> Result<Option<Target>> {
        let ip = device
            .recent_ip
            .or_else(|| device.mac.and_then(|mac| self.arp.lookup(mac)));
        let Some(ip) = ip else {
            return Ok(None);
        };

        let iface = match iface_hint.filter(|i| !i.is_empty()) {
            Some(iface) => Some(iface.to_string()),
            None => match device.mac {
                Some(mac) => self.iface_for_mac(mac)?,
                None => None,
            },
        };
        let iface = iface.or_else(|| {
            (!device.wg_pub_key.is_empty())
                .then(|| self.interfaces.wireguard.first().cloned())
                .flatten()
        });

        Ok(iface.map(|iface| Target {
            ip,
            iface,
            mac: device.mac,
        }))
    }

    /// Maps that may hold entries for a device: the built-in access maps
    /// and both maps of every custom zone.
    fn identity_maps(&self, zones: &ZoneList) -> Result<Vec<MapSpec>> {
        let mut specs = Vec::new();
        for spec in maps::device_access_maps() {
            specs.push(self.map(&spec)?);
        }
        for zone in zones.custom() {
            let (dst, src) = self.zone_maps(&zone.name)?;
            specs.push(dst);
            specs.push(src);
        }
        Ok(specs)
    }

    /// Remove every entry owned by `target` from the identity maps.
    ///
    /// Maps that cannot be enumerated fall back to deleting the keys the
    /// device would have now; stale keys from an earlier address stay.
    pub fn flush_identity(
        &self,
        target: &Target,
        zones: &ZoneList,
        match_iface: bool,
    ) -> Result<usize> {
        let mut removed = 0;
        for map in self.identity_maps(zones)? {
            removed += self.flush_map_for(&map, target, match_iface)?;
        }
        debug!("Flushed {} entries for {} on {}", removed, target.ip, target.iface);
        Ok(removed)
    }

    fn flush_map_for(&self, map: &MapSpec, target: &Target, match_iface: bool) -> Result<usize> {
        let elements = match self.filter.list_elements(map) {
            Ok(elements) => elements,
            Err(e) if e.is_enumeration_quirk() => {
                self.metrics.enumeration_quirks.inc();
                warn!("Cannot enumerate {}, deleting known keys only: {}", map.name, e);
                return self.delete_target_key(map, target);
            }
            Err(Error::MapNotFound { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut removed = 0;
        for element in elements {
            let parts = match decode_key(&map.key, &element.key.bytes) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("Skipping undecodable element in {}: {}", map.name, e);
                    continue;
                }
            };
            let (ip, iface, mac) = key_fields(&parts);
            if target.owns(ip, iface, mac, match_iface) && self.delete(map, &element.key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_target_key(&self, map: &MapSpec, target: &Target) -> Result<usize> {
        match target.key_in(map)? {
            Some(key) => Ok(usize::from(self.delete(map, &key)?)),
            None => Ok(0),
        }
    }

    /// The entries a device should have.
    ///
    /// A device with no enabled zone has none. Otherwise a device with a MAC
    /// off WireGuard is admitted through `ethernet_filter` and `dhcp_access`,
    /// and each enabled zone adds its grant.
    pub fn desired(
        &self,
        target: &Target,
        device: &Device,
        zones: &ZoneList,
    ) -> Result<Vec<(MapSpec, Element)>> {
        let enabled: Vec<_> = device
            .zones
            .iter()
            .filter_map(|name| match zones.get(name) {
                Some(zone) if zone.disabled => {
                    debug!("Zone {} is disabled, skipping for {}", name, device.label());
                    None
                }
                Some(zone) => Some(zone.kind()),
                None => {
                    warn!("{} is in unknown zone {}", device.label(), name);
                    None
                }
            })
            .collect();
        if enabled.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut push = |spec: MapSpec, verdict: Verdict| -> Result<()> {
            let map = self.map(&spec)?;
            if let Some(key) = target.key_in(&map)? {
                out.push((map, Element::verdict(key, verdict)));
            }
            Ok(())
        };

        if target.mac.is_some() && !target.is_wireguard() {
            push(maps::ethernet_filter(), Verdict::Return)?;
            push(maps::dhcp_access(), Verdict::Accept)?;
        }

        for kind in enabled {
            match kind {
                ZoneKind::Isolated => {}
                ZoneKind::Dns => push(maps::dns_access(), Verdict::Accept)?,
                ZoneKind::Lan => push(maps::lan_access(), Verdict::Accept)?,
                ZoneKind::Wan => push(maps::internet_access(), Verdict::Accept)?,
                ZoneKind::Custom(name) => {
                    let (dst, src) = self.zone_maps(&name)?;
                    push(dst, Verdict::Continue)?;
                    push(src, Verdict::Accept)?;
                }
            }
        }
        Ok(out)
    }

    /// Flush a device's entries and rebuild them from its zones, then bring
    /// its endpoint grants up to date.
    ///
    /// Returns false when the device's address or interface is unknown; in
    /// that case nothing is touched. An error part way leaves the device
    /// with fewer entries than it should have until the next refresh.
    pub fn refresh(
        &self,
        device: &Device,
        iface_hint: Option<&str>,
        zones: &ZoneList,
        endpoints: &[Endpoint],
    ) -> Result<bool> {
        let Some(target) = self.resolve(device, iface_hint)? else {
            info!(
                "No address or interface known for {}, not refreshing",
                device.label()
            );
            return Ok(false);
        };

        let result = self.refresh_target(&target, device, zones, endpoints);
        match &result {
            Ok(()) => self.metrics.refreshes.inc(),
            Err(e) => {
                self.metrics.refresh_failures.inc();
                warn!("Refresh of {} failed: {}", device.label(), e);
            }
        }
        result.map(|()| true)
    }

    fn refresh_target(
        &self,
        target: &Target,
        device: &Device,
        zones: &ZoneList,
        endpoints: &[Endpoint],
    ) -> Result<()> {
        self.flush_identity(target, zones, false)?;
        let desired = self.desired(target, device, zones)?;
        for (map, element) in &desired {
            self.add(map, element)?;
        }
        info!(
            "Refreshed {} at {} on {}: {} entries",
            device.label(),
            target.ip,
            target.iface,
            desired.len()
        );
        self.apply_endpoints(target.ip, device, endpoints)
    }

    /// Whether every entry the device should have is in place. Entries that
    /// cannot be read back count as present.
    pub fn has_entries(
        &self,
        device: &Device,
        iface_hint: Option<&str>,
        zones: &ZoneList,
    ) -> Result<bool> {
        let Some(target) = self.resolve(device, iface_hint)? else {
            return Ok(true);
        };
        for (map, element) in self.desired(&target, device, zones)? {
            let lookup = self.filter.get_element(&map, &element.key)?;
            if !lookup.is_likely_present() {
                debug!("{} missing from {}", device.label(), map.name);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Remove a device's entries wherever it can be located.
    pub fn forget(&self, device: &Device, iface_hint: Option<&str>, zones: &ZoneList) -> Result<()> {
        match self.resolve(device, iface_hint)? {
            Some(target) => {
                self.flush_identity(&target, zones, false)?;
            }
            None => debug!("{} has no known location, nothing to flush", device.label()),
        }
        Ok(())
    }

    /// Bring a device's endpoint grants in line with its tags.
    pub fn apply_endpoints(&self, ip: Ipv4Addr, device: &Device, endpoints: &[Endpoint]) -> Result<()> {
        for endpoint in endpoints.iter().filter(|e| e.has_ip()) {
            let entry = super::rules::endpoint_entry(ip, endpoint)?;
            if endpoint.is_enabled() && device.has_any_tag(&endpoint.tags) {
                self.add(&entry.map, &entry.element)?;
            } else {
                self.delete(&entry.map, &entry.element.key)?;
            }
        }
        Ok(())
    }

    /// Re-apply endpoint grants after a tag change, without a full refresh.
    pub fn refresh_endpoints(&self, device: &Device, endpoints: &[Endpoint]) -> Result<()> {
        let ip = device
            .recent_ip
            .or_else(|| device.mac.and_then(|mac| self.arp.lookup(mac)));
        match ip {
            Some(ip) => self.apply_endpoints(ip, device, endpoints),
            None => Ok(()),
        }
    }
}
