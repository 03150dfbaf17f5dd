//! Shared fixture for control plane tests

use policyd::config::{InterfacesConfig, PathsLock};
use policyd::dhcp::{DhcpRequest, DhcpResponse};
use policyd::netfilter::{Element, MemoryFilter};
use policyd::service::{Collaborators, ControlPlane, NoArp};
use std::sync::Arc;
use tempfile::TempDir;

/// Maps a device's zone grants land in.
pub const DEVICE_MAPS: &[&str] = &[
    "ethernet_filter",
    "dhcp_access",
    "internet_access",
    "dns_access",
    "lan_access",
];

pub struct Harness {
    pub dir: TempDir,
    pub filter: Arc<MemoryFilter>,
    pub plane: ControlPlane,
}

fn interfaces() -> InterfacesConfig {
    InterfacesConfig {
        wan: vec!["eth0".into()],
        lan: vec!["wlan0".into(), "wlan1".into()],
        wireguard: vec!["wg0".into()],
    }
}

fn collaborators() -> Collaborators {
    Collaborators {
        arp: Arc::new(NoArp),
        ..Default::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create state dir");
        let filter = Arc::new(MemoryFilter::new());
        let plane = ControlPlane::new(
            PathsLock::under(dir.path()),
            interfaces(),
            filter.clone(),
            collaborators(),
        )
        .expect("Failed to build control plane");
        Self { dir, filter, plane }
    }

    /// A second control plane over the same state directory and kernel,
    /// as after a daemon restart.
    pub fn restart(&self) -> ControlPlane {
        ControlPlane::new(
            PathsLock::under(self.dir.path()),
            interfaces(),
            self.filter.clone(),
            collaborators(),
        )
        .expect("Failed to rebuild control plane")
    }

    pub fn lease(&self, mac: &str, iface: &str) -> DhcpResponse {
        self.plane
            .handle_dhcp_request(DhcpRequest {
                mac: mac.into(),
                iface: iface.into(),
                ..Default::default()
            })
            .expect("DHCP request failed")
    }

    /// Elements of the filter-table maps named, each sorted by key.
    pub fn snapshot(&self, maps: &[&str]) -> Vec<(String, Vec<Element>)> {
        maps.iter()
            .map(|name| {
                let mut elements = self.filter.elements("filter", name);
                elements.sort_by(|a, b| a.key.cmp(&b.key));
                (name.to_string(), elements)
            })
            .collect()
    }
}

pub fn mac(n: u8) -> String {
    format!("aa:bb:cc:dd:ee:{:02x}", n)
}
