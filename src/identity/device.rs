//! Device records
//!
//! Records live in an arena addressed by [`DeviceId`]. A record is reachable
//! by exactly one [`DeviceKey`]: its MAC once known, otherwise its WireGuard
//! public key. Re-keying only touches the index tables.

use crate::types::{empty_as_none, normalize_list, MacAddr};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{info, warn};

/// Wireless pre-shared key assigned to a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskEntry {
    #[serde(rename = "Type", default)]
    pub kind: String,
    #[serde(rename = "Psk", default)]
    pub psk: String,
}

pub const PSK_MIN_LEN: usize = 8;

impl PskEntry {
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.psk.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if self.kind != "sae" && self.kind != "wpa2" {
            return Err(Error::validation("PSKEntry.Type", "must be sae or wpa2"));
        }
        if self.psk.len() < PSK_MIN_LEN {
            return Err(Error::validation(
                "PSKEntry.Psk",
                format!("must be at least {} characters", PSK_MIN_LEN),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "MAC", with = "empty_as_none", default)]
    pub mac: Option<MacAddr>,
    #[serde(rename = "WGPubKey", default)]
    pub wg_pub_key: String,
    #[serde(rename = "VLANTag", default)]
    pub vlan_tag: String,
    #[serde(rename = "RecentIP", with = "empty_as_none", default)]
    pub recent_ip: Option<Ipv4Addr>,
    #[serde(rename = "PSKEntry", default)]
    pub psk: PskEntry,
    #[serde(rename = "Zones", alias = "Groups", default)]
    pub zones: Vec<String>,
    #[serde(rename = "DeviceTags", default)]
    pub tags: Vec<String>,
    #[serde(rename = "DHCPFirstTime", default)]
    pub dhcp_first_time: String,
    #[serde(rename = "DHCPLastTime", default)]
    pub dhcp_last_time: String,
}

impl Device {
    /// A record first seen through DHCP.
    pub fn from_dhcp(mac: MacAddr, ip: Ipv4Addr) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            mac: Some(mac),
            recent_ip: Some(ip),
            dhcp_first_time: now.clone(),
            dhcp_last_time: now,
            ..Default::default()
        }
    }

    /// A record first seen as a WireGuard peer.
    pub fn from_wireguard(pubkey: &str, ip: Option<Ipv4Addr>) -> Self {
        Self {
            wg_pub_key: pubkey.to_string(),
            recent_ip: ip,
            ..Default::default()
        }
    }

    /// The key this record is persisted under.
    pub fn key(&self) -> Option<DeviceKey> {
        match self.mac {
            Some(mac) => Some(DeviceKey::Mac(mac)),
            None if !self.wg_pub_key.is_empty() => Some(DeviceKey::Key(self.wg_pub_key.clone())),
            None => None,
        }
    }

    pub fn in_zone(&self, zone: &str) -> bool {
        self.zones.iter().any(|z| z == zone)
    }

    pub fn has_any_tag(&self, tags: &[String]) -> bool {
        self.tags.iter().any(|t| tags.contains(t))
    }

    pub fn touch_dhcp(&mut self) {
        let now = chrono::Utc::now().to_rfc3339();
        if self.dhcp_first_time.is_empty() {
            self.dhcp_first_time = now.clone();
        }
        self.dhcp_last_time = now;
    }

    /// Display label for logs.
    pub fn label(&self) -> String {
        match (&self.mac, self.name.is_empty()) {
            (Some(mac), true) => mac.to_string(),
            (Some(mac), false) => format!("{} ({})", self.name, mac),
            (None, _) if !self.name.is_empty() => self.name.clone(),
            (None, _) => format!("wg:{}", self.wg_pub_key),
        }
    }
}

/// Persisted identity of a device record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKey {
    Mac(MacAddr),
    /// WireGuard public key (or another non-MAC identifier).
    Key(String),
}

impl DeviceKey {
    /// Parse a map key from `devices.json`: MACs are recognised, anything
    /// else is taken as a key.
    pub fn parse(s: &str) -> Self {
        match s.parse::<MacAddr>() {
            Ok(mac) => DeviceKey::Mac(mac),
            Err(_) => DeviceKey::Key(s.to_string()),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Mac(mac) => write!(f, "{}", mac),
            DeviceKey::Key(k) => f.write_str(k),
        }
    }
}

/// Stable arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

/// Device records with MAC and key lookup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Device>", into = "BTreeMap<String, Device>")]
pub struct DeviceStore {
    slots: Vec<Option<Device>>,
    index: HashMap<DeviceKey, DeviceId>,
}

impl From<BTreeMap<String, Device>> for DeviceStore {
    fn from(map: BTreeMap<String, Device>) -> Self {
        let mut store = DeviceStore::default();
        for (name, mut device) in map {
            let key = match device.key() {
                Some(key) => key,
                None => {
                    // keyed only by the map entry name
                    match DeviceKey::parse(&name) {
                        DeviceKey::Mac(mac) => {
                            device.mac = Some(mac);
                            DeviceKey::Mac(mac)
                        }
                        DeviceKey::Key(k) => {
                            device.wg_pub_key = k.clone();
                            DeviceKey::Key(k)
                        }
                    }
                }
            };
            if store.index.contains_key(&key) {
                warn!("Dropping duplicate device record for {}", key);
                continue;
            }
            store.push(key, device);
        }
        store
    }
}

impl From<DeviceStore> for BTreeMap<String, Device> {
    fn from(store: DeviceStore) -> Self {
        store
            .index
            .iter()
            .filter_map(|(key, id)| {
                store
                    .slots
                    .get(id.0)
                    .and_then(|d| d.clone())
                    .map(|d| (key.to_string(), d))
            })
            .collect()
    }
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, key: DeviceKey, device: Device) -> DeviceId {
        let id = DeviceId(self.slots.len());
        self.slots.push(Some(device));
        self.index.insert(key, id);
        id
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id.0).and_then(|d| d.as_ref())
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id.0).and_then(|d| d.as_mut())
    }

    pub fn find(&self, key: &DeviceKey) -> Option<DeviceId> {
        self.index.get(key).copied()
    }

    pub fn find_mac(&self, mac: MacAddr) -> Option<DeviceId> {
        self.find(&DeviceKey::Mac(mac))
    }

    /// Resolve a textual identifier: a MAC or a WireGuard key.
    pub fn find_str(&self, ident: &str) -> Option<DeviceId> {
        self.find(&DeviceKey::parse(ident)).or_else(|| {
            self.iter()
                .find(|(_, d)| !d.wg_pub_key.is_empty() && d.wg_pub_key == ident)
                .map(|(id, _)| id)
        })
    }

    /// Find a WireGuard peer by public key, or failing that by address.
    pub fn find_wireguard(&self, pubkey: &str, ip: Option<Ipv4Addr>) -> Option<DeviceId> {
        if !pubkey.is_empty() {
            if let Some(found) = self
                .iter()
                .find(|(_, d)| d.wg_pub_key == pubkey)
                .map(|(id, _)| id)
            {
                return Some(found);
            }
        }
        let ip = ip?;
        self.iter()
            .find(|(_, d)| d.recent_ip == Some(ip))
            .map(|(id, _)| id)
    }

    /// Add a record under its own key.
    pub fn insert(&mut self, device: Device) -> Result<DeviceId> {
        let key = device
            .key()
            .ok_or_else(|| Error::validation("MAC", "device needs a MAC or WireGuard key"))?;
        if self.index.contains_key(&key) {
            return Err(Error::Conflict(format!("device {} already exists", key)));
        }
        Ok(self.push(key, device))
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<Device> {
        let device = self.slots.get_mut(id.0)?.take()?;
        self.index.retain(|_, v| *v != id);
        Some(device)
    }

    /// Give a key-addressed record its MAC. From now on it is addressed by
    /// MAC only.
    pub fn assign_mac(&mut self, id: DeviceId, mac: MacAddr) -> Result<()> {
        let new_key = DeviceKey::Mac(mac);
        if let Some(other) = self.find(&new_key) {
            if other != id {
                return Err(Error::Conflict(format!("MAC {} belongs to another device", mac)));
            }
        }
        let device = self
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("device {:?}", id)))?;
        device.mac = Some(mac);
        self.index.retain(|_, v| *v != id);
        self.index.insert(new_key, id);
        info!("Device re-keyed to {}", mac);
        Ok(())
    }

    /// Change a record's WireGuard key, moving its index entry when the
    /// record has no MAC.
    pub fn set_wg_key(&mut self, id: DeviceId, pubkey: &str) -> Result<()> {
        let device = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("device {:?}", id)))?;
        let key = match device.mac {
            Some(mac) => DeviceKey::Mac(mac),
            None if !pubkey.is_empty() => DeviceKey::Key(pubkey.to_string()),
            None => {
                return Err(Error::validation(
                    "WGPubKey",
                    "a device without a MAC needs a key",
                ))
            }
        };
        if let Some(other) = self.find(&key) {
            if other != id {
                return Err(Error::Conflict(format!("key {} belongs to another device", key)));
            }
        }
        if let Some(device) = self.get_mut(id) {
            device.wg_pub_key = pubkey.to_string();
        }
        self.index.retain(|_, v| *v != id);
        self.index.insert(key, id);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_ref().map(|d| (DeviceId(i), d)))
    }

    /// Addresses held as recent IP by any record.
    pub fn in_use_ips(&self) -> HashSet<Ipv4Addr> {
        self.iter().filter_map(|(_, d)| d.recent_ip).collect()
    }

    pub fn devices_in_zone<'a>(&'a self, zone: &'a str) -> impl Iterator<Item = (DeviceId, &'a Device)> + 'a {
        self.iter().filter(move |(_, d)| d.in_zone(zone))
    }

    /// Replace a device's zone list with its normalised form.
    pub fn set_zones(&mut self, id: DeviceId, zones: &[String]) -> Result<Vec<String>> {
        let device = self
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("device {:?}", id)))?;
        device.zones = normalize_list(zones);
        Ok(device.zones.clone())
    }
}
