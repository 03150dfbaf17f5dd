//! In-process packet filter
//!
//! Holds maps in memory with the same element semantics as the kernel:
//! adds overwrite, deletes of missing keys fail, interval maps store an end
//! key for every element. Used where no kernel backend is available and by
//! tests.

use super::{Element, Key, Lookup, MapSpec, PacketFilter, Provisioned, Value};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

type MapId = (String, String);

#[derive(Debug)]
struct MemMap {
    spec: MapSpec,
    elements: BTreeMap<Key, Value>,
}

#[derive(Debug, Default)]
struct State {
    maps: BTreeMap<MapId, MemMap>,
    /// (chain, dst map, src map) lookup rules.
    zone_rules: Vec<(String, String, String)>,
    /// Maps whose enumeration fails, mimicking the concatenated-type quirk.
    unlistable: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryFilter {
    state: Mutex<State>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `list_elements` on this map fail the way some kernels do.
    pub fn simulate_enumeration_failure(&self, map: &str) {
        self.state.lock().unlistable.insert(map.to_string());
    }

    /// Snapshot of a map's elements, for inspection.
    pub fn elements(&self, table: &str, map: &str) -> Vec<Element> {
        let state = self.state.lock();
        state
            .maps
            .get(&(table.to_string(), map.to_string()))
            .map(|m| {
                m.elements
                    .iter()
                    .map(|(k, v)| Element::new(k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_map(&self, table: &str, map: &str) -> bool {
        self.state
            .lock()
            .maps
            .contains_key(&(table.to_string(), map.to_string()))
    }

    pub fn zone_rules(&self) -> Vec<(String, String, String)> {
        self.state.lock().zone_rules.clone()
    }

    /// Total element count across all maps.
    pub fn element_count(&self) -> usize {
        self.state.lock().maps.values().map(|m| m.elements.len()).sum()
    }
}

fn id(map: &MapSpec) -> MapId {
    (map.table.clone(), map.name.clone())
}

fn normalize(spec: &MapSpec, key: &Key) -> Result<Key> {
    if key.bytes.len() > spec.key_len() {
        return Err(Error::Parse(format!(
            "key of {} bytes exceeds {} key length {}",
            key.bytes.len(),
            spec.name,
            spec.key_len()
        )));
    }
    if key.is_range() && !spec.interval {
        return Err(Error::Parse(format!("{} does not hold ranges", spec.name)));
    }
    let bytes = super::codec::pad_to(&key.bytes, spec.key_len());
    let end = if spec.interval {
        Some(super::codec::pad_to(key.end_or_start(), spec.key_len()))
    } else {
        None
    };
    Ok(Key { bytes, end })
}

impl PacketFilter for MemoryFilter {
    fn ensure_map(&self, map: &MapSpec) -> Result<Provisioned> {
        let mut state = self.state.lock();
        if let Some(m) = state.maps.get(&id(map)) {
            return Ok(Provisioned::existing(m.spec.clone()));
        }
        debug!("memory: created map {}", map);
        state.maps.insert(
            id(map),
            MemMap {
                spec: map.clone(),
                elements: BTreeMap::new(),
            },
        );
        Ok(Provisioned {
            spec: map.clone(),
            created: true,
        })
    }

    fn add_element(&self, map: &MapSpec, element: &Element) -> Result<()> {
        let mut state = self.state.lock();
        let m = state
            .maps
            .get_mut(&id(map))
            .ok_or_else(|| Error::MapNotFound {
                table: map.table.clone(),
                map: map.name.clone(),
            })?;
        let key = normalize(&m.spec, &element.key)?;
        let value = match &element.value {
            Value::Verdict(v) if m.spec.is_verdict_map() => Value::Verdict(v.clone()),
            Value::Data(_) if m.spec.is_verdict_map() => {
                return Err(Error::Parse(format!("{} expects a verdict", m.spec.name)))
            }
            other => Value::Data(other.data_for(&m.spec)?),
        };
        m.elements.insert(key, value);
        Ok(())
    }

    fn delete_element(&self, map: &MapSpec, key: &Key) -> Result<()> {
        let mut state = self.state.lock();
        let m = state
            .maps
            .get_mut(&id(map))
            .ok_or_else(|| Error::MapNotFound {
                table: map.table.clone(),
                map: map.name.clone(),
            })?;
        let key = normalize(&m.spec, key)?;
        match m.elements.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Error::ElementNotFound {
                map: map.name.clone(),
            }),
        }
    }

    fn get_element(&self, map: &MapSpec, key: &Key) -> Result<Lookup> {
        let state = self.state.lock();
        if state.unlistable.contains(&map.name) {
            return Ok(Lookup::Unverified);
        }
        let Some(m) = state.maps.get(&id(map)) else {
            return Ok(Lookup::Absent);
        };
        let key = normalize(&m.spec, key)?;
        Ok(match m.elements.get(&key) {
            Some(v) => Lookup::Present(Element::new(key, v.clone())),
            None => Lookup::Absent,
        })
    }

    fn list_elements(&self, map: &MapSpec) -> Result<Vec<Element>> {
        let state = self.state.lock();
        if state.unlistable.contains(&map.name) {
            return Err(Error::EnumerationUnsupported {
                map: map.name.clone(),
                reason: "netlink receive: invalid argument".into(),
            });
        }
        let m = state.maps.get(&id(map)).ok_or_else(|| Error::MapNotFound {
            table: map.table.clone(),
            map: map.name.clone(),
        })?;
        Ok(m.elements
            .iter()
            .map(|(k, v)| Element::new(k.clone(), v.clone()))
            .collect())
    }

    fn flush_map(&self, map: &MapSpec) -> Result<()> {
        let mut state = self.state.lock();
        match state.maps.get_mut(&id(map)) {
            Some(m) => {
                m.elements.clear();
                Ok(())
            }
            None => Err(Error::MapNotFound {
                table: map.table.clone(),
                map: map.name.clone(),
            }),
        }
    }

    fn link_zone_maps(&self, chain: &str, dst: &MapSpec, src: &MapSpec) -> Result<()> {
        let mut state = self.state.lock();
        let rule = (chain.to_string(), dst.name.clone(), src.name.clone());
        if !state.zone_rules.contains(&rule) {
            state.zone_rules.push(rule);
        }
        Ok(())
    }
}
