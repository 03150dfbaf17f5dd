//! Collaborators the control plane calls out to

use crate::types::MacAddr;
use crate::Result;
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, info};

/// Event bus for announcing DHCP and WireGuard activity.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &serde_json::Value);
}

/// Restarts dependent services after configuration they read has changed.
pub trait ServiceSupervisor: Send + Sync {
    fn restart(&self, name: &str) -> Result<()>;
}

/// System neighbour table.
pub trait ArpTable: Send + Sync {
    fn lookup(&self, mac: MacAddr) -> Option<Ipv4Addr>;
}

/// Writes events to the log.
#[derive(Debug, Default)]
pub struct LogEventBus;

impl EventBus for LogEventBus {
    fn publish(&self, topic: &str, payload: &serde_json::Value) {
        info!(topic, %payload, "event");
    }
}

/// Records restart requests without acting on them.
#[derive(Debug, Default)]
pub struct LogSupervisor;

impl ServiceSupervisor for LogSupervisor {
    fn restart(&self, name: &str) -> Result<()> {
        info!("Restart requested for {}", name);
        Ok(())
    }
}

/// An ARP table that never knows anything.
#[derive(Debug, Default)]
pub struct NoArp;

impl ArpTable for NoArp {
    fn lookup(&self, _mac: MacAddr) -> Option<Ipv4Addr> {
        None
    }
}

const PROC_NET_ARP: &str = "/proc/net/arp";

/// Completed entry flag in the Flags column.
const ATF_COM: u32 = 0x2;

/// Reads the kernel's ARP cache from procfs.
#[derive(Debug)]
pub struct ProcNetArp {
    path: PathBuf,
}

impl Default for ProcNetArp {
    fn default() -> Self {
        Self::new(PROC_NET_ARP)
    }
}

impl ProcNetArp {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ArpTable for ProcNetArp {
    fn lookup(&self, mac: MacAddr) -> Option<Ipv4Addr> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                debug!("Cannot read {}: {}", self.path.display(), e);
                return None;
            }
        };
        parse_arp(&contents, mac)
    }
}

/// Find `mac` in `/proc/net/arp` text.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.2.2      0x1         0x2         aa:bb:cc:dd:ee:01     *        wlan0
/// ```
pub fn parse_arp(contents: &str, mac: MacAddr) -> Option<Ipv4Addr> {
    contents.lines().skip(1).find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 4 {
            return None;
        }
        let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
        if flags & ATF_COM == 0 {
            return None;
        }
        let found: MacAddr = cols[3].parse().ok()?;
        if found != mac {
            return None;
        }
        cols[0].parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.2.2      0x1         0x2         aa:bb:cc:dd:ee:01     *        wlan0
192.168.2.6      0x1         0x0         aa:bb:cc:dd:ee:02     *        wlan0
192.168.2.10     0x1         0x2         AA:BB:CC:DD:EE:03     *        wlan1
";

    #[test]
    fn test_parse_arp() {
        assert_eq!(
            parse_arp(SAMPLE, "aa:bb:cc:dd:ee:01".parse().unwrap()),
            Some("192.168.2.2".parse().unwrap())
        );
        assert_eq!(
            parse_arp(SAMPLE, "aa:bb:cc:dd:ee:03".parse().unwrap()),
            Some("192.168.2.10".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_arp_incomplete() {
        assert_eq!(parse_arp(SAMPLE, "aa:bb:cc:dd:ee:02".parse().unwrap()), None);
        assert_eq!(parse_arp(SAMPLE, "aa:bb:cc:dd:ee:09".parse().unwrap()), None);
    }

    #[test]
    fn test_proc_arp_missing_file() {
        let arp = ProcNetArp::new("/nonexistent/arp");
        assert_eq!(arp.lookup("aa:bb:cc:dd:ee:01".parse().unwrap()), None);
    }
}
