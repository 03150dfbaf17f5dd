//! DHCP address management
//!
//! The DHCP protocol itself is served elsewhere; it calls up into the
//! control plane with a [`DhcpRequest`] and receives a [`DhcpResponse`].

pub mod allocator;
pub mod config;

pub use allocator::{router_for, Allocator, Lease};
pub use config::DhcpConfig;

use serde::{Deserialize, Serialize};

/// Upcall from the DHCP server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpRequest {
    #[serde(rename = "MAC")]
    pub mac: String,
    #[serde(rename = "Identifier", default)]
    pub identifier: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Iface")]
    pub iface: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpResponse {
    #[serde(rename = "Identifier")]
    pub identifier: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "RouterIP")]
    pub router_ip: String,
    #[serde(rename = "DNSIP")]
    pub dns_ip: String,
    #[serde(rename = "LeaseTime")]
    pub lease_time: String,
}

/// WireGuard peer announcement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WireguardUpdate {
    #[serde(rename = "IP", default)]
    pub ip: String,
    pub public_key: String,
    #[serde(default)]
    pub iface: String,
    #[serde(default)]
    pub name: String,
}
