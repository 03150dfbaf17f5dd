//! Firewall rules installed through the control plane

use super::harness::{mac, Harness};
use policyd::firewall::RuleKind;
use policyd::netfilter::codec::{decode_key, KeyPart};
use policyd::netfilter::{maps, PacketFilter, Transport};
use policyd::Error;
use std::net::Ipv4Addr;

const BLOCK_TCP: &str = r#"{"RuleName":"no-dns","Protocol":"tcp","SrcIP":"192.168.2.0/24","DstIP":"8.8.8.8"}"#;

const NAS: &str = r#"{"RuleName":"nas","Protocol":"tcp","IP":"192.168.5.10","Port":"445","Tags":["media"]}"#;

#[test]
fn test_block_rule_key() {
    let h = Harness::new();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();

    let elements = h.filter.elements("nat", "block");
    assert_eq!(elements.len(), 1);
    let key = &elements[0].key;
    let parts = decode_key(&maps::block().key, &key.bytes).unwrap();
    assert_eq!(
        parts,
        vec![
            KeyPart::Ipv4(Ipv4Addr::new(192, 168, 2, 0)),
            KeyPart::Ipv4(Ipv4Addr::new(8, 8, 8, 8)),
            KeyPart::Proto(6),
        ]
    );
    let end = decode_key(&maps::block().key, key.end_or_start()).unwrap();
    assert_eq!(end[0], KeyPart::Ipv4(Ipv4Addr::new(192, 168, 2, 255)));
    assert_eq!(end[1], KeyPart::Ipv4(Ipv4Addr::new(8, 8, 8, 8)));
}

#[test]
fn test_rules_round_trip_through_disk() {
    let h = Harness::new();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    h.plane
        .add_rule_json(
            RuleKind::Forwarding,
            r#"{"Protocol":"tcp","SrcIP":"203.0.113.9","SrcPort":"8080","DstIP":"192.168.2.2","DstPort":"80"}"#,
        )
        .unwrap();
    h.plane
        .add_rule_json(
            RuleKind::ServicePort,
            r#"{"Protocol":"udp","Port":"51820","UpstreamEnabled":true}"#,
        )
        .unwrap();
    let stored = h.plane.firewall_config();

    h.filter.flush_map(&maps::block()).unwrap();
    h.filter.flush_map(&maps::forward(Transport::Tcp)).unwrap();

    let restarted = h.restart();
    assert_eq!(restarted.firewall_config(), stored);
    let summary = restarted.apply_all().unwrap();
    assert_eq!(summary.failed, 0);
    assert!(summary.installed >= 3);

    assert_eq!(h.filter.elements("nat", "block").len(), 1);
    assert_eq!(
        restarted.filter_list("tcpfwd").unwrap(),
        vec!["203.0.113.9 . 8080 : 192.168.2.2 . 80"]
    );
    assert_eq!(h.filter.elements("filter", "wan_udp_accept").len(), 1);
    assert_eq!(h.filter.elements("filter", "lan_udp_accept").len(), 1);
}

#[test]
fn test_duplicate_rule_stored_once() {
    let h = Harness::new();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    assert_eq!(h.plane.firewall_config().block_rules.len(), 1);

    h.plane.delete_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    assert!(h.plane.firewall_config().block_rules.is_empty());
    assert!(h.filter.elements("nat", "block").is_empty());
}

#[test]
fn test_endpoint_reaches_tagged_devices_only() {
    let h = Harness::new();
    let tagged = h.lease(&mac(1), "wlan0");
    h.lease(&mac(2), "wlan0");
    h.plane.set_device_zones(&mac(1), &["lan".into()]).unwrap();
    h.plane.set_device_zones(&mac(2), &["lan".into()]).unwrap();
    h.plane.set_device_tags(&mac(1), &["media".into()]).unwrap();

    h.plane.add_rule_json(RuleKind::Endpoint, NAS).unwrap();
    let elements = h.filter.elements("filter", "ept_tcpfwd");
    assert_eq!(elements.len(), 1);
    let parts = decode_key(&maps::endpoint_forward(Transport::Tcp).key, &elements[0].key.bytes)
        .unwrap();
    assert_eq!(parts[0], KeyPart::Ipv4(tagged.ip.parse().unwrap()));
    assert_eq!(parts[1], KeyPart::Ipv4(Ipv4Addr::new(192, 168, 5, 10)));
    assert_eq!(parts[2], KeyPart::Port(445));

    h.plane.set_device_tags(&mac(2), &["media".into()]).unwrap();
    assert_eq!(h.filter.elements("filter", "ept_tcpfwd").len(), 2);

    h.plane.set_device_tags(&mac(1), &[]).unwrap();
    assert_eq!(h.filter.elements("filter", "ept_tcpfwd").len(), 1);

    h.plane.delete_rule_json(RuleKind::Endpoint, NAS).unwrap();
    assert!(h.filter.elements("filter", "ept_tcpfwd").is_empty());
}

#[test]
fn test_custom_interface_shared_policy() {
    let h = Harness::new();
    let first = r#"{"Interface":"docker0","SrcIP":"172.17.0.2","RouteDst":"10.1.0.1","Policies":["lan"]}"#;
    let second = r#"{"Interface":"docker0","SrcIP":"172.17.0.2","RouteDst":"10.2.0.1","Policies":["lan","wan"]}"#;
    h.plane.add_rule_json(RuleKind::CustomInterface, first).unwrap();
    h.plane.add_rule_json(RuleKind::CustomInterface, second).unwrap();
    assert_eq!(h.filter.elements("filter", "fwd_iface_lan").len(), 1);
    assert_eq!(h.filter.elements("filter", "fwd_iface_wan").len(), 1);

    assert!(matches!(
        h.plane.add_rule_json(
            RuleKind::CustomInterface,
            r#"{"Interface":"docker0","SrcIP":"172.17.0.2","RouteDst":"10.1.0.1","Policies":["dns"]}"#,
        ),
        Err(Error::Conflict(_))
    ));

    h.plane.delete_rule_json(RuleKind::CustomInterface, second).unwrap();
    assert_eq!(h.filter.elements("filter", "fwd_iface_lan").len(), 1);
    assert!(h.filter.elements("filter", "fwd_iface_wan").is_empty());

    h.plane.delete_rule_json(RuleKind::CustomInterface, first).unwrap();
    assert!(h.filter.elements("filter", "fwd_iface_lan").is_empty());
}

#[test]
fn test_unknown_rule_kind() {
    assert!("sctp-forwarding".parse::<RuleKind>().is_err());
    assert_eq!(
        "output-block".parse::<RuleKind>().unwrap(),
        RuleKind::OutputBlock
    );
}

#[test]
fn test_deleting_disabled_twin_keeps_block() {
    let h = Harness::new();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    let disabled = r#"{"RuleName":"no-dns","Disabled":true,"Protocol":"tcp","SrcIP":"192.168.2.0/24","DstIP":"8.8.8.8"}"#;
    h.plane.add_rule_json(RuleKind::Block, disabled).unwrap();
    assert_eq!(h.plane.firewall_config().block_rules.len(), 2);

    h.plane.delete_rule_json(RuleKind::Block, disabled).unwrap();
    assert_eq!(h.plane.firewall_config().block_rules.len(), 1);
    assert_eq!(h.filter.elements("nat", "block").len(), 1);
}

#[test]
fn test_deleting_renamed_twin_keeps_block() {
    let h = Harness::new();
    h.plane.add_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    let renamed = r#"{"RuleName":"no-dns-2","Protocol":"tcp","SrcIP":"192.168.2.0/24","DstIP":"8.8.8.8"}"#;
    h.plane.add_rule_json(RuleKind::Block, renamed).unwrap();
    assert_eq!(h.filter.elements("nat", "block").len(), 1);

    h.plane.delete_rule_json(RuleKind::Block, renamed).unwrap();
    assert_eq!(h.filter.elements("nat", "block").len(), 1);

    h.plane.delete_rule_json(RuleKind::Block, BLOCK_TCP).unwrap();
    assert!(h.filter.elements("nat", "block").is_empty());
}

#[test]
fn test_deleting_forward_restores_remaining_target() {
    let h = Harness::new();
    let to_a = r#"{"RuleName":"a","Protocol":"tcp","SrcIP":"203.0.113.9","SrcPort":"8080","DstIP":"192.168.2.2","DstPort":"80"}"#;
    let to_b = r#"{"RuleName":"b","Protocol":"tcp","SrcIP":"203.0.113.9","SrcPort":"8080","DstIP":"192.168.2.6","DstPort":"80"}"#;
    h.plane.add_rule_json(RuleKind::Forwarding, to_a).unwrap();
    h.plane.add_rule_json(RuleKind::Forwarding, to_b).unwrap();

    h.plane.delete_rule_json(RuleKind::Forwarding, to_b).unwrap();
    assert_eq!(
        h.plane.filter_list("tcpfwd").unwrap(),
        vec!["203.0.113.9 . 8080 : 192.168.2.2 . 80"]
    );
}
