//! Address allocation through the control plane

use super::harness::{mac, Harness};
use policyd::dhcp::{DhcpConfig, DhcpRequest, WireguardUpdate};
use policyd::Error;
use std::collections::HashSet;
use std::net::Ipv4Addr;

#[test]
fn test_allocations_are_unique() {
    let h = Harness::new();
    let mut seen = HashSet::new();

    for n in 1..=20 {
        let response = h.lease(&mac(n), "wlan0");
        let ip: Ipv4Addr = response.ip.parse().unwrap();
        let router: Ipv4Addr = response.router_ip.parse().unwrap();

        assert!(seen.insert(ip), "{} handed out twice", ip);
        assert_eq!(u32::from(ip) % 4, 2, "{} is not a device address", ip);
        assert_eq!(u32::from(router), u32::from(ip) - 1);
        assert_eq!(response.dns_ip, "192.168.2.1");
        assert_eq!(response.lease_time, "24h0m0s");
    }
    assert_eq!(h.plane.devices().unwrap().len(), 20);
}

#[test]
fn test_lease_is_stable_across_restart() {
    let h = Harness::new();
    let first = h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan0");
    let again = h.lease(&mac(1), "wlan1");
    assert_eq!(first.ip, again.ip);

    let restarted = h.restart();
    let after = restarted
        .handle_dhcp_request(DhcpRequest {
            mac: mac(1),
            iface: "wlan0".into(),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(first.ip, after.ip);
}

#[test]
fn test_lease_outside_new_pool_is_replaced() {
    let h = Harness::new();
    let old = h.lease(&mac(1), "wlan0");
    assert!(old.ip.starts_with("192.168.2."));

    h.plane
        .set_dhcp_config(DhcpConfig {
            tiny_nets: vec!["10.20.0.0/24".into()],
            lease_time: String::new(),
        })
        .unwrap();
    let new = h.lease(&mac(1), "wlan0");
    assert_eq!(new.ip, "10.20.0.2");
    assert_eq!(new.dns_ip, "10.20.0.1");
    assert_eq!(new.lease_time, "24h0m0s");
}

#[test]
fn test_pool_exhaustion() {
    let h = Harness::new();
    h.plane
        .set_dhcp_config(DhcpConfig {
            tiny_nets: vec!["10.0.0.0/24".into()],
            lease_time: "1h0m0s".into(),
        })
        .unwrap();

    for n in 0..64 {
        h.lease(&mac(n), "wlan0");
    }
    let result = h.plane.handle_dhcp_request(DhcpRequest {
        mac: mac(64),
        iface: "wlan0".into(),
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::PoolExhausted)));
    assert_eq!(h.plane.metrics().pool_exhausted.get(), 1);
    assert_eq!(h.plane.metrics().allocations.get(), 64);
}

#[test]
fn test_wan_request_refused() {
    let h = Harness::new();
    let result = h.plane.handle_dhcp_request(DhcpRequest {
        mac: mac(1),
        iface: "eth0".into(),
        ..Default::default()
    });
    assert!(matches!(result, Err(Error::Validation { field: "Iface", .. })));
    assert!(h.plane.devices().unwrap().is_empty());
}

#[test]
fn test_bad_dhcp_config_keeps_previous() {
    let h = Harness::new();
    let result = h.plane.set_dhcp_config(DhcpConfig {
        tiny_nets: vec!["10.0.0.0/30".into()],
        lease_time: "1h".into(),
    });
    assert!(result.is_err());
    assert_eq!(h.plane.dhcp_config(), DhcpConfig::default());
}

#[test]
fn test_reserved_address_then_peer_update() {
    let h = Harness::new();
    let reserved = h.plane.handle_abstract_dhcp_request("peerkey=").unwrap();
    assert!(h.plane.devices().unwrap().is_empty());

    h.plane
        .wireguard_update(WireguardUpdate {
            ip: reserved.ip.clone(),
            public_key: "peerkey=".into(),
            iface: "wg0".into(),
            name: "phone".into(),
        })
        .unwrap();

    // The reservation now belongs to the peer; a new one must differ.
    let again = h.plane.handle_abstract_dhcp_request("peerkey=").unwrap();
    assert_eq!(again.ip, reserved.ip);
    let other = h.plane.handle_abstract_dhcp_request("otherkey=").unwrap();
    assert_ne!(other.ip, reserved.ip);

    assert!(matches!(
        h.plane.handle_abstract_dhcp_request("bad key"),
        Err(Error::Validation { .. })
    ));
}

#[test]
fn test_peer_delete() {
    let h = Harness::new();
    let update = WireguardUpdate {
        ip: "192.168.2.6".into(),
        public_key: "peerkey=".into(),
        iface: "wg0".into(),
        name: String::new(),
    };
    h.plane.wireguard_update(update.clone()).unwrap();
    assert_eq!(h.plane.devices().unwrap().len(), 1);

    h.plane.wireguard_delete(update.clone()).unwrap();
    assert!(h.plane.devices().unwrap().is_empty());
    assert!(matches!(
        h.plane.wireguard_delete(update),
        Err(Error::NotFound(_))
    ));
}
