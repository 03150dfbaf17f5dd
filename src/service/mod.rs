//! Control plane service
//!
//! [`ControlPlane`] owns the persisted collections and the policy engine.
//! Every collection sits behind its own lock. Operations that need more
//! than one take them in this order and never the reverse:
//!
//! ```text
//! zones -> devices -> dhcp -> firewall -> recent_iface
//! ```
//!
//! Kernel calls happen with the locks held. A stuck kernel call therefore
//! stalls every operation waiting on those locks; there is no timeout.

mod collab;
mod dhcp;
mod identity;
mod rules;

pub use collab::{
    parse_arp, ArpTable, EventBus, LogEventBus, LogSupervisor, NoArp, ProcNetArp,
    ServiceSupervisor,
};
pub use dhcp::record_lease;

use crate::config::{InterfacesConfig, PathsLock};
use crate::dhcp::DhcpConfig;
use crate::firewall::{FirewallConfig, FirewallStore};
use crate::identity::{Device, DeviceStore, ZoneList};
use crate::netfilter::codec::{decode_key, format_parts};
use crate::netfilter::{maps, PacketFilter, Value};
use crate::policy::{ApplySummary, PolicyEngine};
use crate::store;
use crate::telemetry::MetricsRegistry;
use crate::types::MacAddr;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// External services the control plane talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub bus: Arc<dyn EventBus>,
    pub supervisor: Arc<dyn ServiceSupervisor>,
    pub arp: Arc<dyn ArpTable>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            bus: Arc::new(LogEventBus),
            supervisor: Arc::new(LogSupervisor),
            arp: Arc::new(ProcNetArp::default()),
        }
    }
}

pub struct ControlPlane {
    paths: PathsLock,
    engine: PolicyEngine,
    bus: Arc<dyn EventBus>,
    supervisor: Arc<dyn ServiceSupervisor>,

    zones: Mutex<ZoneList>,
    devices: Mutex<DeviceStore>,
    dhcp: Mutex<DhcpConfig>,
    firewall: Mutex<FirewallStore>,
    /// Interface each MAC last requested DHCP on.
    recent_iface: Mutex<HashMap<MacAddr, String>>,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("paths", &self.paths)
            .field("engine", &self.engine)
            .finish()
    }
}

impl ControlPlane {
    /// Load every collection from disk. A file that exists but cannot be
    /// read or decoded is an error.
    pub fn new(
        paths: PathsLock,
        interfaces: InterfacesConfig,
        filter: Arc<dyn PacketFilter>,
        collab: Collaborators,
    ) -> Result<Self> {
        let zones: ZoneList = store::load_or_default(&paths.zones)?;
        let devices: DeviceStore = store::load_or_default(&paths.devices)?;
        let dhcp: DhcpConfig = store::load_or_default(&paths.dhcp)?;
        let firewall = FirewallStore::load(&paths.firewall)?;

        let metrics = Arc::new(MetricsRegistry::new());
        metrics.set_device_count(devices.len());
        info!(
            "Loaded {} devices, {} zones, {} TinyNets",
            devices.len(),
            zones.iter().count(),
            dhcp.tiny_nets.len()
        );

        Ok(Self {
            engine: PolicyEngine::new(filter, interfaces, collab.arp, metrics),
            bus: collab.bus,
            supervisor: collab.supervisor,
            paths,
            zones: Mutex::new(zones),
            devices: Mutex::new(devices),
            dhcp: Mutex::new(dhcp),
            firewall: Mutex::new(firewall),
            recent_iface: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        self.engine.metrics()
    }

    pub fn interfaces(&self) -> &InterfacesConfig {
        self.engine.interfaces()
    }

    fn publish<T: serde::Serialize>(&self, topic: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.bus.publish(topic, &value),
            Err(e) => warn!("Cannot encode {} event: {}", topic, e),
        }
    }

    /// Re-read zones from disk, picking up external edits.
    fn reload_zones(&self, zones: &mut ZoneList) -> Result<()> {
        *zones = store::load_or_default(&self.paths.zones)?;
        Ok(())
    }

    fn reload_devices(&self, devices: &mut DeviceStore) -> Result<()> {
        *devices = store::load_or_default(&self.paths.devices)?;
        self.metrics().set_device_count(devices.len());
        Ok(())
    }

    fn save_zones(&self, zones: &ZoneList) -> Result<()> {
        store::save(&self.paths.zones, zones)
    }

    fn save_devices(&self, devices: &DeviceStore) -> Result<()> {
        self.metrics().set_device_count(devices.len());
        store::save(&self.paths.devices, devices)
    }

    /// Rebuild a device's entries. A kernel failure is logged and returned.
    fn refresh_device(
        &self,
        device: &Device,
        zones: &ZoneList,
        endpoints: &[crate::firewall::Endpoint],
        hint: Option<&str>,
    ) -> Result<bool> {
        let hint = match hint {
            Some(h) => Some(h.to_string()),
            None => device
                .mac
                .and_then(|mac| self.recent_iface.lock().get(&mac).cloned()),
        };
        self.engine.refresh(device, hint.as_deref(), zones, endpoints)
    }

    /// Install every persisted rule and refresh every device.
    pub fn apply_all(&self) -> Result<ApplySummary> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;
        let firewall = self.firewall.lock();
        let hints = self.recent_iface.lock().clone();

        self.engine
            .apply_all(firewall.config(), &devices, &zones, &hints)
    }

    /// Refresh devices whose entries have gone missing. Returns how many
    /// were refreshed.
    pub fn reconcile(&self) -> Result<usize> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;
        let endpoints = self.firewall.lock().config().endpoints.clone();

        let mut refreshed = 0;
        for (_, device) in devices.iter() {
            let hint = device
                .mac
                .and_then(|mac| self.recent_iface.lock().get(&mac).cloned());
            let intact = match self.engine.has_entries(device, hint.as_deref(), &zones) {
                Ok(intact) => intact,
                Err(e) => {
                    warn!("Cannot verify {}: {}", device.label(), e);
                    false
                }
            };
            if intact {
                continue;
            }
            info!("{} has drifted, refreshing", device.label());
            match self.refresh_device(device, &zones, &endpoints, hint.as_deref()) {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => warn!("Reconcile of {} failed: {}", device.label(), e),
            }
        }
        debug!("Reconcile refreshed {} devices", refreshed);
        Ok(refreshed)
    }

    pub fn zones(&self) -> Result<ZoneList> {
        let mut zones = self.zones.lock();
        self.reload_zones(&mut zones)?;
        Ok(zones.clone())
    }

    pub fn devices(&self) -> Result<DeviceStore> {
        let mut devices = self.devices.lock();
        self.reload_devices(&mut devices)?;
        Ok(devices.clone())
    }

    pub fn dhcp_config(&self) -> DhcpConfig {
        self.dhcp.lock().clone()
    }

    pub fn firewall_config(&self) -> FirewallConfig {
        self.firewall.lock().config().clone()
    }

    /// Elements of a map, rendered `key : value`.
    pub fn filter_list(&self, name: &str) -> Result<Vec<String>> {
        let spec = maps::lookup(name).ok_or_else(|| Error::NotFound(format!("map {}", name)))?;
        let map = self.engine.map(&spec)?;
        let elements = self.engine.filter().list_elements(&map)?;

        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            let mut key = format_parts(&decode_key(&map.key, &element.key.bytes)?);
            if let Some(end) = element.key.end.as_ref().filter(|_| element.key.is_range()) {
                key = format!("{}-{}", key, format_parts(&decode_key(&map.key, end)?));
            }
            let value = match (&element.value, &map.data) {
                (Value::Verdict(v), _) => v.to_string(),
                (Value::Data(d), maps::DataType::Fields(fields)) => {
                    format_parts(&decode_key(fields, d)?)
                }
                (Value::Data(d), maps::DataType::Verdict) => format!("{:02x?}", d),
            };
            out.push(format!("{} : {}", key, value));
        }
        Ok(out)
    }
}
