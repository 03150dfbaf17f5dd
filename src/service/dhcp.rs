//! DHCP and WireGuard upcalls

use super::ControlPlane;
use crate::dhcp::{Allocator, DhcpConfig, DhcpRequest, DhcpResponse, Lease, WireguardUpdate};
use crate::identity::{Device, DeviceId, DeviceStore};
use crate::store;
use crate::types::MacAddr;
use crate::{Error, Result};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

/// Record that `mac` holds `ip`.
///
/// A known MAC has its address updated. Otherwise a MAC-less WireGuard
/// record already holding `ip` takes the MAC and is addressed by it from
/// now on. Failing both, a new record is created.
pub fn record_lease(devices: &mut DeviceStore, mac: MacAddr, ip: Ipv4Addr) -> Result<DeviceId> {
    if let Some(id) = devices.find_mac(mac) {
        if let Some(device) = devices.get_mut(id) {
            if device.recent_ip != Some(ip) {
                info!("{} moved to {}", device.label(), ip);
                device.recent_ip = Some(ip);
            }
            device.touch_dhcp();
        }
        return Ok(id);
    }

    let peer = devices.find_wireguard("", Some(ip)).filter(|id| {
        devices
            .get(*id)
            .is_some_and(|d| d.mac.is_none() && !d.wg_pub_key.is_empty())
    });
    if let Some(id) = peer {
        devices.assign_mac(id, mac)?;
        if let Some(device) = devices.get_mut(id) {
            device.touch_dhcp();
        }
        info!("WireGuard peer at {} is now {}", ip, mac);
        return Ok(id);
    }

    info!("New device {} at {}", mac, ip);
    devices.insert(Device::from_dhcp(mac, ip))
}

fn check_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty()
        || identifier.trim() != identifier
        || identifier.contains(char::is_whitespace)
    {
        return Err(Error::validation("Identifier", "must be non-empty without whitespace"));
    }
    Ok(())
}

impl ControlPlane {
    fn response(&self, identifier: &str, lease: Lease, config: &DhcpConfig, allocator: &Allocator) -> DhcpResponse {
        DhcpResponse {
            identifier: identifier.to_string(),
            ip: lease.device.to_string(),
            router_ip: lease.router.to_string(),
            dns_ip: allocator
                .dns_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            lease_time: config.lease_time.clone(),
        }
    }

    fn allocate(&self, allocator: &Allocator, devices: &DeviceStore) -> Result<Lease> {
        match allocator.allocate(&devices.in_use_ips()) {
            Ok(lease) => {
                self.metrics().allocations.inc();
                Ok(lease)
            }
            Err(e) => {
                self.metrics().pool_exhausted.inc();
                Err(e)
            }
        }
    }

    /// Assign an address to a device asking over DHCP, then bring its
    /// entries up to date for the interface it asked on.
    pub fn handle_dhcp_request(&self, req: DhcpRequest) -> Result<DhcpResponse> {
        self.publish("dhcp:request", &req);

        if req.mac.is_empty() || req.iface.is_empty() {
            return Err(Error::validation("MAC", "need MAC and Iface to dhcp"));
        }
        let mac: MacAddr = req
            .mac
            .parse()
            .map_err(|_| Error::validation("MAC", format!("'{}' is not a MAC address", req.mac)))?;
        if self.interfaces().is_wan(&req.iface) {
            return Err(Error::validation("Iface", "refusing DHCP from a WAN interface"));
        }

        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        let dhcp = self.dhcp.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let allocator = Allocator::new(dhcp.nets());
        let recorded = devices
            .find_mac(mac)
            .and_then(|id| devices.get(id))
            .and_then(|d| d.recent_ip)
            .filter(|ip| allocator.contains(*ip));
        let lease = match recorded {
            Some(ip) => Lease::for_device(ip),
            None => self.allocate(&allocator, &devices)?,
        };

        let id = record_lease(&mut devices, mac, lease.device)?;
        self.save_devices(&devices)?;
        self.recent_iface.lock().insert(mac, req.iface.clone());
        if !req.name.is_empty() {
            debug!("{} calls itself {}", mac, req.name);
        }

        let endpoints = self.firewall.lock().config().endpoints.clone();
        if let Some(device) = devices.get(id) {
            if let Err(e) = self.refresh_device(device, &zones, &endpoints, Some(&req.iface)) {
                warn!("Lease for {} recorded but entries not refreshed: {}", mac, e);
            }
        }

        let response = self.response(&req.mac, lease, &dhcp, &allocator);
        self.publish("dhcp:response", &response);
        Ok(response)
    }

    /// Reserve an address for a non-MAC identity such as a WireGuard key.
    /// Nothing is recorded; the caller follows up with a peer update.
    pub fn handle_abstract_dhcp_request(&self, identifier: &str) -> Result<DhcpResponse> {
        check_identifier(identifier)?;

        let _zones = self.zones.lock();
        let mut devices = self.devices.lock();
        let dhcp = self.dhcp.lock();
        self.reload_devices(&mut devices)?;

        let allocator = Allocator::new(dhcp.nets());
        let recorded = devices
            .find_wireguard(identifier, None)
            .and_then(|id| devices.get(id))
            .and_then(|d| d.recent_ip);
        let lease = match recorded {
            Some(ip) => Lease::for_device(ip),
            None => self.allocate(&allocator, &devices)?,
        };
        Ok(self.response(identifier, lease, &dhcp, &allocator))
    }

    /// Replace the DHCP settings. An empty lease time keeps the current one.
    pub fn set_dhcp_config(&self, mut config: DhcpConfig) -> Result<DhcpConfig> {
        config.validate()?;
        let mut dhcp = self.dhcp.lock();
        if config.lease_time.is_empty() {
            config.lease_time = dhcp.lease_time.clone();
        }
        store::save(&self.paths.dhcp, &config)?;
        info!("DHCP config set: {:?} lease {}", config.tiny_nets, config.lease_time);
        *dhcp = config.clone();
        Ok(config)
    }

    /// Create or update a WireGuard peer and refresh its entries.
    pub fn wireguard_update(&self, update: WireguardUpdate) -> Result<()> {
        self.publish("wg:update", &update);
        if update.public_key.is_empty() {
            return Err(Error::validation("PublicKey", "must not be empty"));
        }
        let ip = parse_peer_ip(&update.ip)?;

        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let id = match devices.find_wireguard(&update.public_key, ip) {
            Some(id) => {
                devices.set_wg_key(id, &update.public_key)?;
                if let Some(device) = devices.get_mut(id) {
                    device.recent_ip = ip;
                }
                id
            }
            None => {
                info!("New WireGuard peer {}", update.public_key);
                devices.insert(Device::from_wireguard(&update.public_key, ip))?
            }
        };
        if let Some(device) = devices.get_mut(id) {
            if device.name.is_empty() && !update.name.is_empty() {
                device.name = update.name.clone();
            }
        }
        self.save_devices(&devices)?;

        let endpoints = self.firewall.lock().config().endpoints.clone();
        let hint = Some(update.iface.as_str()).filter(|i| !i.is_empty());
        if let Some(device) = devices.get(id) {
            self.refresh_device(device, &zones, &endpoints, hint)?;
        }
        Ok(())
    }

    /// Forget a WireGuard peer. A record without a MAC is removed; one with
    /// a MAC only loses its key.
    pub fn wireguard_delete(&self, update: WireguardUpdate) -> Result<()> {
        self.publish("wg:update", &update);
        let ip = parse_peer_ip(&update.ip)?;

        let mut zones = self.zones.lock();
        let mut devices = self.devices.lock();
        self.reload_zones(&mut zones)?;
        self.reload_devices(&mut devices)?;

        let id = devices
            .find_wireguard(&update.public_key, ip)
            .ok_or_else(|| Error::NotFound(format!("peer {}", update.public_key)))?;
        let Some(device) = devices.get(id).cloned() else {
            return Err(Error::NotFound(format!("peer {}", update.public_key)));
        };

        let hint = Some(update.iface.as_str()).filter(|i| !i.is_empty());
        if device.mac.is_none() {
            devices.remove(id);
            info!("Removed WireGuard peer {}", device.label());
        } else {
            devices.set_wg_key(id, "")?;
            info!("Cleared WireGuard key of {}", device.label());
        }
        self.save_devices(&devices)?;

        if device.mac.is_none() || hint.is_some_and(|h| h.starts_with("wg")) {
            self.engine.forget(&device, hint, &zones)?;
        }
        Ok(())
    }
}

fn parse_peer_ip(s: &str) -> Result<Option<Ipv4Addr>> {
    if s.is_empty() {
        return Ok(None);
    }
    s.parse()
        .map(Some)
        .map_err(|_| Error::validation("IP", format!("'{}' is not an IP address", s)))
}
