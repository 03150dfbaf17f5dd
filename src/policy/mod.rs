//! Verdict map synchronisation
//!
//! The engine turns devices, zones and firewall rules into elements of the
//! packet filter's maps. Device entries are rebuilt by [`PolicyEngine::refresh`]
//! (flush by identity, then repopulate); rule entries are added and removed
//! as rules come and go.

mod device;
mod rules;

pub use device::Target;
pub use rules::{ApplySummary, Entry, Grant, Installable};

use crate::config::InterfacesConfig;
use crate::netfilter::maps::{self, CUSTOM_GROUPS_CHAIN};
use crate::netfilter::{Element, Key, MapSpec, PacketFilter, Provisioned};
use crate::service::ArpTable;
use crate::telemetry::{MapOp, MetricsRegistry};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct PolicyEngine {
    filter: Arc<dyn PacketFilter>,
    interfaces: InterfacesConfig,
    arp: Arc<dyn ArpTable>,
    metrics: Arc<MetricsRegistry>,
    /// Shapes of maps already provisioned by this process, by (table, name).
    shapes: Mutex<HashMap<(String, String), MapSpec>>,
    /// Zones whose maps were created here but are not linked yet.
    unlinked: Mutex<HashSet<String>>,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("interfaces", &self.interfaces)
            .field("maps", &self.shapes.lock().len())
            .finish()
    }
}

impl PolicyEngine {
    pub fn new(
        filter: Arc<dyn PacketFilter>,
        interfaces: InterfacesConfig,
        arp: Arc<dyn ArpTable>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            filter,
            interfaces,
            arp,
            metrics,
            shapes: Mutex::new(HashMap::new()),
            unlinked: Mutex::new(HashSet::new()),
        }
    }

    pub fn filter(&self) -> &Arc<dyn PacketFilter> {
        &self.filter
    }

    pub fn interfaces(&self) -> &InterfacesConfig {
        &self.interfaces
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    fn provision(&self, spec: &MapSpec) -> Result<Provisioned> {
        let id = (spec.table.clone(), spec.name.clone());
        if let Some(shape) = self.shapes.lock().get(&id) {
            return Ok(Provisioned::existing(shape.clone()));
        }

        let provisioned = self.filter.ensure_map(spec)?;
        if provisioned.created {
            info!("Created map {}", provisioned.spec);
        } else if provisioned.spec != *spec {
            debug!("Using kernel shape {} for {}", provisioned.spec, spec.name);
        }
        self.shapes.lock().insert(id, provisioned.spec.clone());
        Ok(provisioned)
    }

    /// Shape to use for `spec`, provisioning the map on first use. Custom
    /// zone maps are provisioned as a pair.
    pub fn map(&self, spec: &MapSpec) -> Result<MapSpec> {
        if let Some(zone) = spec.name.strip_suffix("_mac_src_access") {
            return self.zone_maps(zone).map(|(_, src)| src);
        }
        if let Some(zone) = spec.name.strip_suffix("_dst_access") {
            return self.zone_maps(zone).map(|(dst, _)| dst);
        }
        self.provision(spec).map(|p| p.spec)
    }

    /// Destination and source maps of a custom zone. When the destination
    /// map is new, the lookup rule joining the two is inserted; a failed
    /// link is retried on the next call.
    pub fn zone_maps(&self, zone: &str) -> Result<(MapSpec, MapSpec)> {
        let dst = self.provision(&maps::zone_destination(zone))?;
        if dst.created {
            self.unlinked.lock().insert(zone.to_string());
        }
        let src = self.provision(&maps::zone_source(zone))?;
        if self.unlinked.lock().contains(zone) {
            self.filter
                .link_zone_maps(CUSTOM_GROUPS_CHAIN, &dst.spec, &src.spec)
                .inspect_err(|e| warn!("Failed to link zone {}: {}", zone, e))?;
            self.unlinked.lock().remove(zone);
            info!("Linked zone {} into {}", zone, CUSTOM_GROUPS_CHAIN);
        }
        Ok((dst.spec, src.spec))
    }

    fn add(&self, spec: &MapSpec, element: &Element) -> Result<()> {
        let map = self.map(spec)?;
        debug!("add {} {:?} : {:?}", map.name, element.key, element.value);
        match self.filter.add_element(&map, element) {
            Ok(()) => {
                self.metrics.record_map(&map.name, MapOp::Add);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_map(&map.name, MapOp::Error);
                warn!("Failed to add element to {}: {}", map.name, e);
                Err(e)
            }
        }
    }

    /// Delete a key. Returns false when it was not there.
    fn delete(&self, spec: &MapSpec, key: &Key) -> Result<bool> {
        let map = self.map(spec)?;
        debug!("delete {} {:?}", map.name, key);
        match self.filter.delete_element(&map, key) {
            Ok(()) => {
                self.metrics.record_map(&map.name, MapOp::Delete);
                Ok(true)
            }
            Err(Error::ElementNotFound { .. }) => {
                debug!("{} had no such element", map.name);
                Ok(false)
            }
            Err(e) => {
                self.metrics.record_map(&map.name, MapOp::Error);
                warn!("Failed to delete element from {}: {}", map.name, e);
                Err(e)
            }
        }
    }

    /// Remove every element of a map.
    pub fn flush(&self, spec: &MapSpec) -> Result<()> {
        let map = self.map(spec)?;
        debug!("flush {}", map.name);
        self.filter.flush_map(&map)
    }
}
