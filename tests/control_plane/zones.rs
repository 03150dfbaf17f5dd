//! Zone membership and verdict map convergence

use super::harness::{mac, Harness, DEVICE_MAPS};
use policyd::netfilter::{PacketFilter, Value, Verdict};
use policyd::netfilter::maps;

fn zone_maps(zone: &str) -> Vec<String> {
    vec![format!("{}_dst_access", zone), format!("{}_mac_src_access", zone)]
}

#[test]
fn test_refresh_is_idempotent() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    h.plane
        .set_device_zones(&mac(1), &["lan".into(), "wan".into(), "dns".into()])
        .unwrap();
    let before = h.snapshot(DEVICE_MAPS);

    h.plane
        .set_device_zones(&mac(1), &["dns".into(), "lan".into(), "wan".into()])
        .unwrap();
    h.lease(&mac(1), "wlan0");
    assert_eq!(h.snapshot(DEVICE_MAPS), before);

    for (name, elements) in &before {
        assert_eq!(elements.len(), 1, "{} should hold one entry", name);
    }
}

#[test]
fn test_disabled_zone_has_no_effect() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan0");
    h.plane
        .set_device_zones(&mac(1), &["lan".into(), "kids".into()])
        .unwrap();
    h.plane.set_device_zones(&mac(2), &["kids".into()]).unwrap();
    assert_eq!(h.filter.elements("filter", "kids_dst_access").len(), 2);

    h.plane.set_zone_disabled("kids", true).unwrap();
    assert!(h.filter.elements("filter", "kids_dst_access").is_empty());
    assert!(h.filter.elements("filter", "kids_mac_src_access").is_empty());
    // Still in lan; the other device has nothing left.
    assert_eq!(h.filter.elements("filter", "lan_access").len(), 1);
    assert_eq!(h.filter.elements("filter", "dhcp_access").len(), 1);

    // Membership survives on disk.
    let devices = h.plane.devices().unwrap();
    let id = devices.find_str(&mac(2)).unwrap();
    assert_eq!(devices.get(id).unwrap().zones, vec!["kids"]);

    h.plane.set_zone_disabled("kids", false).unwrap();
    assert_eq!(h.filter.elements("filter", "kids_dst_access").len(), 2);
}

#[test]
fn test_custom_zone_provisioned_on_first_use() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    assert!(!h.plane.zones().unwrap().contains("media"));

    h.plane.set_device_zones(&mac(1), &["media".into()]).unwrap();
    assert!(h.plane.zones().unwrap().contains("media"));
    for name in zone_maps("media") {
        assert!(h.filter.has_map("filter", &name), "{} missing", name);
        assert_eq!(h.filter.elements("filter", &name).len(), 1);
    }
    assert_eq!(
        h.filter.zone_rules(),
        vec![(
            maps::CUSTOM_GROUPS_CHAIN.to_string(),
            "media_dst_access".to_string(),
            "media_mac_src_access".to_string()
        )]
    );

    let dst = h.filter.elements("filter", "media_dst_access");
    assert_eq!(dst[0].value, Value::Verdict(Verdict::Continue));
    let src = h.filter.elements("filter", "media_mac_src_access");
    assert_eq!(src[0].value, Value::Verdict(Verdict::Accept));

    // A second member reuses the maps and the rule.
    h.lease(&mac(2), "wlan1");
    h.plane.set_device_zones(&mac(2), &["media".into()]).unwrap();
    assert_eq!(h.filter.zone_rules().len(), 1);
    assert_eq!(h.filter.elements("filter", "media_dst_access").len(), 2);
}

#[test]
fn test_restart_restores_state() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan1");
    h.plane
        .set_device_zones(&mac(1), &["lan".into(), "wan".into()])
        .unwrap();
    h.plane
        .set_device_zones(&mac(2), &["wan".into(), "media".into()])
        .unwrap();

    let mut watched: Vec<String> = DEVICE_MAPS.iter().map(|s| s.to_string()).collect();
    watched.extend(zone_maps("media"));
    let watched: Vec<&str> = watched.iter().map(String::as_str).collect();
    let before = h.snapshot(&watched);

    for name in ["lan_access", "internet_access", "media_dst_access"] {
        let spec = maps::lookup(name).unwrap();
        h.filter.flush_map(&spec).unwrap();
    }
    assert_ne!(h.snapshot(&watched), before);

    let restarted = h.restart();
    let summary = restarted.apply_all().unwrap();
    assert_eq!(summary.refreshed, 2);
    assert_eq!(summary.skipped, 0);
    assert_eq!(h.snapshot(&watched), before);
}

#[test]
fn test_reconcile_refreshes_only_drifted() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan0");
    h.plane.set_device_zones(&mac(1), &["wan".into()]).unwrap();
    h.plane.set_device_zones(&mac(2), &["lan".into()]).unwrap();
    let before = h.snapshot(DEVICE_MAPS);

    assert_eq!(h.plane.reconcile().unwrap(), 0);

    h.filter.flush_map(&maps::internet_access()).unwrap();
    assert_eq!(h.plane.reconcile().unwrap(), 1);
    assert_eq!(h.snapshot(DEVICE_MAPS), before);
}

#[test]
fn test_delete_device_clears_entries() {
    let h = Harness::new();
    h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan0");
    h.plane
        .set_device_zones(&mac(1), &["lan".into(), "media".into()])
        .unwrap();
    h.plane.set_device_zones(&mac(2), &["lan".into()]).unwrap();

    h.plane.delete_device(&mac(1)).unwrap();
    assert_eq!(h.filter.elements("filter", "lan_access").len(), 1);
    assert!(h.filter.elements("filter", "media_dst_access").is_empty());
    assert_eq!(h.plane.devices().unwrap().len(), 1);
}
