//! Tiny-subnet address allocation
//!
//! Each pool is split into /30 blocks:
//!
//! ```text
//! 192.168.2.0  network
//! 192.168.2.1  router
//! 192.168.2.2  device
//! 192.168.2.3  broadcast
//! ```
//!
//! An address is free when no device record holds it as its recent IP.

use crate::{Error, Result};
use ipnet::Ipv4Net;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use tracing::{debug, error};

const BLOCK_SIZE: u32 = 4;
const DEVICE_OFFSET: u32 = 2;

/// A device address and the router address of its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub device: Ipv4Addr,
    pub router: Ipv4Addr,
}

impl Lease {
    pub fn for_device(device: Ipv4Addr) -> Self {
        Self {
            device,
            router: router_for(device),
        }
    }
}

/// Router address paired with a device address.
pub fn router_for(device: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(device).wrapping_sub(1))
}

/// Device addresses of a pool, in order.
fn device_ips(net: &Ipv4Net) -> impl Iterator<Item = Ipv4Addr> + '_ {
    let start = u32::from(net.network()).checked_add(DEVICE_OFFSET);
    std::iter::successors(start, |ip| ip.checked_add(BLOCK_SIZE))
        .map(Ipv4Addr::from)
        .take_while(move |ip| net.contains(ip))
}

#[derive(Debug, Clone)]
pub struct Allocator {
    nets: Vec<Ipv4Net>,
}

impl Allocator {
    pub fn new(nets: Vec<Ipv4Net>) -> Self {
        Self { nets }
    }

    pub fn nets(&self) -> &[Ipv4Net] {
        &self.nets
    }

    /// First free device address across all pools, in pool order.
    pub fn allocate(&self, in_use: &HashSet<Ipv4Addr>) -> Result<Lease> {
        for net in &self.nets {
            for device in device_ips(net) {
                let router = router_for(device);
                if !in_use.contains(&device) && !in_use.contains(&router) {
                    debug!("Allocated {} (router {}) from {}", device, router, net);
                    return Ok(Lease { device, router });
                }
            }
            debug!("Pool {} exhausted", net);
        }
        error!("No more IPs left to hand out from {} pools", self.nets.len());
        Err(Error::PoolExhausted)
    }

    /// Whether `ip` falls inside any pool.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|n| n.contains(&ip))
    }

    /// Whether `ip` is the device address of some block.
    pub fn is_device_ip(&self, ip: Ipv4Addr) -> bool {
        self.nets.iter().any(|n| {
            n.contains(&ip)
                && (u32::from(ip) - u32::from(n.network())) % BLOCK_SIZE == DEVICE_OFFSET
        })
    }

    /// Router-side address of the first pool, handed out as the DNS server.
    pub fn dns_ip(&self) -> Option<Ipv4Addr> {
        self.nets
            .first()
            .map(|n| Ipv4Addr::from(u32::from(n.network()).wrapping_add(1)))
    }

    /// Total device addresses across pools.
    pub fn capacity(&self) -> usize {
        self.nets.iter().map(|n| device_ips(n).count()).sum()
    }
}
