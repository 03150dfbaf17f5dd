//! policyd - Network-Policy Control Plane
//!
//! Keeps device identities, zone memberships, DHCP leases and firewall
//! rules on disk, and converges the kernel's nftables verdict maps to match
//! them. Packet forwarding itself stays in the kernel.

pub mod config;
pub mod dhcp;
pub mod error;
pub mod firewall;
pub mod identity;
pub mod netfilter;
pub mod policy;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};
