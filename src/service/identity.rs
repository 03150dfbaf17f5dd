//! Zone and device edits

use super::ControlPlane;
use crate::identity::{DeviceId, DeviceStore, PskEntry, Zone, ZoneList};
use crate::types::normalize_list;
use crate::{Error, Result};
use tracing::{info, warn};

fn find_device(devices: &DeviceStore, ident: &str) -> Result<DeviceId> {
    devices
        .find_str(ident)
        .ok_or_else(|| Error::NotFound(format!("device {}", ident)))
}

impl ControlPlane {
    pub fn add_zone(&self, zone: Zone) -> Result<()> {
        let mut zones = self.zones.lock();
        self.reload_zones(&mut zones)?;
        let name = zone.name.clone();
        zones.add(zone)?;
        self.save_zones(&zones)?;
        info!("Added zone {}", name);
        Ok(())
    }

    /// Delete a custom zone no device belongs to.
    pub fn delete_zone(&self, name: &str) -> Result<()> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let members = devices.devices_in_zone(name).count();
        if members > 0 {
            return Err(Error::Conflict(format!(
                "zone {} still has {} members",
                name, members
            )));
        }
        zones.remove(name)?;
        self.save_zones(&zones)?;
        info!("Deleted zone {}", name);
        Ok(())
    }

    /// Enable or disable a zone and refresh its members.
    pub fn set_zone_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let zone = zones
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("zone {}", name)))?;
        if zone.disabled == disabled {
            return Ok(());
        }
        zone.disabled = disabled;
        self.save_zones(&zones)?;
        info!("Zone {} {}", name, if disabled { "disabled" } else { "enabled" });

        self.refresh_members(&zones, &devices, name)
    }

    fn refresh_members(&self, zones: &ZoneList, devices: &DeviceStore, zone: &str) -> Result<()> {
        let endpoints = self.firewall.lock().config().endpoints.clone();
        let mut first_err = None;
        for (_, device) in devices.devices_in_zone(zone) {
            if let Err(e) = self.refresh_device(device, zones, &endpoints, None) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Replace a device's zones, creating any that do not exist yet, and
    /// refresh it. Returns the stored list.
    pub fn set_device_zones(&self, ident: &str, names: &[String]) -> Result<Vec<String>> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let id = find_device(&devices, ident)?;
        let names = normalize_list(names);
        let created = zones.ensure(&names)?;
        if !created.is_empty() {
            info!("Created zones {:?}", created);
            self.save_zones(&zones)?;
        }
        let stored = devices.set_zones(id, &names)?;
        self.save_devices(&devices)?;

        let endpoints = self.firewall.lock().config().endpoints.clone();
        if let Some(device) = devices.get(id) {
            self.refresh_device(device, &zones, &endpoints, None)?;
        }
        Ok(stored)
    }

    /// Replace a device's tags and re-apply endpoint rules for it.
    pub fn set_device_tags(&self, ident: &str, tags: &[String]) -> Result<Vec<String>> {
        let mut devices = self.devices.lock();
        self.reload_devices(&mut devices)?;

        let id = find_device(&devices, ident)?;
        let tags = normalize_list(tags);
        if let Some(device) = devices.get_mut(id) {
            device.tags = tags.clone();
        }
        self.save_devices(&devices)?;

        let endpoints = self.firewall.lock().config().endpoints.clone();
        if let Some(device) = devices.get(id) {
            self.engine.refresh_endpoints(device, &endpoints)?;
        }
        Ok(tags)
    }

    /// Set a device's wireless credential and have the access point reload.
    pub fn set_device_psk(&self, ident: &str, psk: PskEntry) -> Result<()> {
        psk.validate()?;
        let mut devices = self.devices.lock();
        self.reload_devices(&mut devices)?;

        let id = find_device(&devices, ident)?;
        if let Some(device) = devices.get_mut(id) {
            device.psk = psk;
        }
        self.save_devices(&devices)?;
        self.supervisor.restart("wifid")
    }

    /// Remove a device record and its entries.
    pub fn delete_device(&self, ident: &str) -> Result<()> {
        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let id = find_device(&devices, ident)?;
        let Some(device) = devices.remove(id) else {
            return Err(Error::NotFound(format!("device {}", ident)));
        };
        self.save_devices(&devices)?;

        let hint = device
            .mac
            .and_then(|mac| self.recent_iface.lock().remove(&mac));
        if let Err(e) = self.engine.forget(&device, hint.as_deref(), &zones) {
            warn!("Deleted {} but its entries remain: {}", device.label(), e);
            return Err(e);
        }
        info!("Deleted device {}", device.label());
        Ok(())
    }
}
