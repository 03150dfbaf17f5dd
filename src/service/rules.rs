//! Firewall rule edits

use super::ControlPlane;
use crate::firewall::{
    BlockRule, CustomInterfaceRule, Endpoint, ForwardingBlockRule, ForwardingRule, Inserted,
    MulticastPort, OutputBlockRule, Rule, RuleKind, ServicePort,
};
use crate::policy::Installable;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

fn parse_rule<R: DeserializeOwned>(json: &str) -> Result<R> {
    serde_json::from_str(json).map_err(|e| Error::Parse(format!("rule: {}", e)))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

impl ControlPlane {
    /// Store a rule and install it. An equal rule already stored is
    /// installed again so the kernel converges. When the rule replaces
    /// another, the old entries are removed first.
    pub fn add_rule<R: Rule + Installable>(&self, rule: R) -> Result<Inserted<R>> {
        let mut firewall = self.firewall.lock();
        let inserted = firewall.insert(rule)?;
        if let Some(old) = inserted.replaced.as_ref().filter(|old| **old != inserted.rule) {
            self.engine.uninstall(old, firewall.list::<R>())?;
        }
        self.engine.install(&inserted.rule)?;
        Ok(inserted)
    }

    /// Remove a stored rule. Kernel entries another enabled rule of the
    /// same kind still produces are left in place.
    pub fn delete_rule<R: Rule + Installable>(&self, rule: R) -> Result<R> {
        let mut firewall = self.firewall.lock();
        let removed = firewall.remove(rule)?;
        self.engine.uninstall(&removed, firewall.list::<R>())?;
        Ok(removed)
    }

    /// Store an endpoint and grant it to matching devices.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> Result<Inserted<Endpoint>> {
        let mut devices = self.devices.lock();
        self.reload_devices(&mut devices)?;
        let mut firewall = self.firewall.lock();

        let inserted = firewall.insert(endpoint)?;
        if let Some(old) = &inserted.replaced {
            self.engine.uninstall_endpoint(old, &devices)?;
        }
        self.engine.install_endpoint(&inserted.rule, &devices)?;
        Ok(inserted)
    }

    pub fn delete_endpoint(&self, endpoint: Endpoint) -> Result<Endpoint> {
        let mut devices = self.devices.lock();
        self.reload_devices(&mut devices)?;
        let mut firewall = self.firewall.lock();

        let removed = firewall.remove(endpoint)?;
        self.engine.uninstall_endpoint(&removed, &devices)?;
        Ok(removed)
    }

    /// Store a custom interface rule, creating the zones it names.
    pub fn add_custom_interface_rule(
        &self,
        rule: CustomInterfaceRule,
    ) -> Result<Inserted<CustomInterfaceRule>> {
        let mut zones = self.zones.lock();
        self.reload_zones(&mut zones)?;
        let mut firewall = self.firewall.lock();

        let inserted = firewall.insert(rule)?;
        let created = zones.ensure(&inserted.rule.groups)?;
        if !created.is_empty() {
            info!("Created zones {:?} for {}", created, inserted.rule.interface);
            self.save_zones(&zones)?;
        }
        self.engine.install(&inserted.rule)?;
        Ok(inserted)
    }

    /// Remove a custom interface rule. Grants still carried by another rule
    /// for the same interface and source stay installed.
    pub fn delete_custom_interface_rule(
        &self,
        rule: CustomInterfaceRule,
    ) -> Result<CustomInterfaceRule> {
        let mut firewall = self.firewall.lock();
        let removed = firewall.remove(rule)?;
        let remaining = firewall.list::<CustomInterfaceRule>();
        self.engine.uninstall_custom_interface(&removed, remaining)?;
        Ok(removed)
    }

    pub fn set_icmp(&self, ping_lan: bool, ping_wan: bool) -> Result<()> {
        let mut firewall = self.firewall.lock();
        firewall.set_icmp(ping_lan, ping_wan)?;
        self.engine.set_icmp(ping_lan, ping_wan)
    }

    /// Add a rule given as JSON. Returns the rule as stored.
    pub fn add_rule_json(&self, kind: RuleKind, json: &str) -> Result<serde_json::Value> {
        debug!("add {} rule: {}", kind, json);
        match kind {
            RuleKind::Forwarding => to_json(&self.add_rule(parse_rule::<ForwardingRule>(json)?)?.rule),
            RuleKind::Block => to_json(&self.add_rule(parse_rule::<BlockRule>(json)?)?.rule),
            RuleKind::OutputBlock => {
                to_json(&self.add_rule(parse_rule::<OutputBlockRule>(json)?)?.rule)
            }
            RuleKind::ForwardingBlock => {
                to_json(&self.add_rule(parse_rule::<ForwardingBlockRule>(json)?)?.rule)
            }
            RuleKind::ServicePort => to_json(&self.add_rule(parse_rule::<ServicePort>(json)?)?.rule),
            RuleKind::Multicast => to_json(&self.add_rule(parse_rule::<MulticastPort>(json)?)?.rule),
            RuleKind::Endpoint => to_json(&self.add_endpoint(parse_rule(json)?)?.rule),
            RuleKind::CustomInterface => {
                to_json(&self.add_custom_interface_rule(parse_rule(json)?)?.rule)
            }
        }
    }

    /// Delete a rule given as JSON. Returns the rule removed.
    pub fn delete_rule_json(&self, kind: RuleKind, json: &str) -> Result<serde_json::Value> {
        debug!("delete {} rule: {}", kind, json);
        match kind {
            RuleKind::Forwarding => to_json(&self.delete_rule(parse_rule::<ForwardingRule>(json)?)?),
            RuleKind::Block => to_json(&self.delete_rule(parse_rule::<BlockRule>(json)?)?),
            RuleKind::OutputBlock => {
                to_json(&self.delete_rule(parse_rule::<OutputBlockRule>(json)?)?)
            }
            RuleKind::ForwardingBlock => {
                to_json(&self.delete_rule(parse_rule::<ForwardingBlockRule>(json)?)?)
            }
            RuleKind::ServicePort => to_json(&self.delete_rule(parse_rule::<ServicePort>(json)?)?),
            RuleKind::Multicast => to_json(&self.delete_rule(parse_rule::<MulticastPort>(json)?)?),
            RuleKind::Endpoint => to_json(&self.delete_endpoint(parse_rule(json)?)?),
            RuleKind::CustomInterface => {
                to_json(&self.delete_custom_interface_rule(parse_rule(json)?)?)
            }
        }
    }
}
