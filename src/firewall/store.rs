//! Persisted rule collections

use super::rules::{FirewallConfig, Rule};
use crate::{store, Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Result of [`FirewallStore::insert`].
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted<R> {
    /// The rule as stored, after canonicalisation.
    pub rule: R,
    /// The rule it replaced, for upserted variants.
    pub replaced: Option<R>,
    /// An equal rule was already stored; nothing was written.
    pub duplicate: bool,
}

/// The firewall configuration and the file it lives in.
#[derive(Debug)]
pub struct FirewallStore {
    path: PathBuf,
    config: FirewallConfig,
}

impl FirewallStore {
    /// Load the configuration, migrating legacy custom interface groups.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut config: FirewallConfig = store::load_or_default(&path)?;

        let mut migrated = false;
        for rule in &mut config.custom_interface_rules {
            migrated |= rule.migrate_groups();
        }

        let this = Self { path, config };
        if migrated {
            info!("Migrated custom interface rule groups to policies");
            this.save()?;
        }
        Ok(this)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn list<R: Rule>(&self) -> &[R] {
        R::list(&self.config)
    }

    fn save(&self) -> Result<()> {
        store::save(&self.path, &self.config)
    }

    /// Validate and store a rule.
    ///
    /// An equal rule is not stored twice. Upserted variants replace the rule
    /// occupying the same slot.
    pub fn insert<R: Rule>(&mut self, mut rule: R) -> Result<Inserted<R>> {
        rule.validate()?;

        let rules = R::list_mut(&mut self.config);
        if rules.iter().any(|r| *r == rule) {
            debug!("{} rule already present: {:?}", R::KIND, rule);
            return Ok(Inserted {
                rule,
                replaced: None,
                duplicate: true,
            });
        }

        let replaced = match rules.iter().position(|r| rule.same_slot(r)) {
            Some(pos) => Some(std::mem::replace(&mut rules[pos], rule.clone())),
            None => {
                for existing in rules.iter() {
                    rule.check_conflict(existing)?;
                }
                rules.push(rule.clone());
                None
            }
        };

        self.save()?;
        info!("Stored {} rule {:?}", R::KIND, rule);
        Ok(Inserted {
            rule,
            replaced,
            duplicate: false,
        })
    }

    /// Remove the stored rule matching `rule`, returning it.
    pub fn remove<R: Rule>(&mut self, mut rule: R) -> Result<R> {
        rule.validate_delete()?;

        let rules = R::list_mut(&mut self.config);
        let pos = rules
            .iter()
            .position(|r| rule.same_slot(r))
            .ok_or_else(|| Error::NotFound(format!("{} rule", R::KIND)))?;
        let removed = rules.remove(pos);

        self.save()?;
        info!("Removed {} rule {:?}", R::KIND, removed);
        Ok(removed)
    }

    pub fn set_icmp(&mut self, ping_lan: bool, ping_wan: bool) -> Result<()> {
        self.config.ping_lan = ping_lan;
        self.config.ping_wan = ping_wan;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::rules::*;
    use std::fs;
    use tempfile::TempDir;

    fn make_store(dir: &TempDir) -> FirewallStore {
        FirewallStore::load(dir.path().join("firewall.json")).unwrap()
    }

    fn make_block() -> BlockRule {
        BlockRule {
            protocol: "tcp".into(),
            src_ip: "192.168.1.0/24".into(),
            dst_ip: "8.8.8.8".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = make_store(&dir);
        assert_eq!(store.config(), &FirewallConfig::default());
    }

    #[test]
    fn test_insert_validates_and_lists() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);

        let bad = BlockRule {
            protocol: "sctp".into(),
            ..make_block()
        };
        assert!(store.insert(bad).is_err());
        assert!(store.list::<BlockRule>().is_empty());

        let added = store.insert(make_block()).unwrap();
        assert!(!added.duplicate);
        assert_eq!(store.list::<BlockRule>(), &[make_block()]);

        let reloaded = make_store(&dir);
        assert_eq!(reloaded.list::<BlockRule>(), &[make_block()]);
    }

    #[test]
    fn test_duplicate_not_stored_twice() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        store.insert(make_block()).unwrap();
        let again = store.insert(make_block()).unwrap();
        assert!(again.duplicate);
        assert_eq!(store.list::<BlockRule>().len(), 1);
    }

    #[test]
    fn test_service_port_upsert() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let sp = ServicePort {
            protocol: "tcp".into(),
            port: "22".into(),
            ..Default::default()
        };
        store.insert(sp.clone()).unwrap();
        let up = store
            .insert(ServicePort {
                upstream_enabled: true,
                ..sp.clone()
            })
            .unwrap();
        assert_eq!(up.replaced, Some(sp));
        assert_eq!(store.list::<ServicePort>().len(), 1);
        assert!(store.list::<ServicePort>()[0].upstream_enabled);
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        store.insert(make_block()).unwrap();

        let removed = store.remove(make_block()).unwrap();
        assert_eq!(removed, make_block());
        assert!(matches!(store.remove(make_block()), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_remove_endpoint_by_name() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let ep = Endpoint {
            base: BaseRule {
                rule_name: "nas".into(),
                disabled: false,
            },
            protocol: "tcp".into(),
            ip: "10.0.0.9".into(),
            port: "445".into(),
            tags: vec!["media".into()],
            ..Default::default()
        };
        store.insert(ep.clone()).unwrap();

        let by_name = Endpoint {
            base: ep.base.clone(),
            ..Default::default()
        };
        assert_eq!(store.remove(by_name).unwrap(), ep);
    }

    #[test]
    fn test_custom_interface_conflict() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);
        let rule = CustomInterfaceRule {
            interface: "docker0".into(),
            src_ip: "172.17.0.2".into(),
            policies: vec!["wan".into()],
            ..Default::default()
        };
        store.insert(rule.clone()).unwrap();
        let clash = CustomInterfaceRule {
            policies: vec!["dns".into()],
            ..rule
        };
        assert!(matches!(store.insert(clash), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_load_migrates_groups() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("firewall.json");
        fs::write(
            &path,
            r#"{"CustomInterfaceRules":[{"Interface":"docker0","SrcIP":"172.17.0.2",
                "Groups":["wan","media"]}]}"#,
        )
        .unwrap();

        let store = FirewallStore::load(&path).unwrap();
        let rule = &store.list::<CustomInterfaceRule>()[0];
        assert_eq!(rule.policies, vec!["wan"]);
        assert_eq!(rule.groups, vec!["media"]);

        let on_disk = fs::read_to_string(&path).unwrap();
        assert!(on_disk.contains("\"Policies\""));
    }

    #[test]
    fn test_round_trip_every_variant() {
        let dir = TempDir::new().unwrap();
        let mut store = make_store(&dir);

        store
            .insert(ForwardingRule {
                protocol: "tcp".into(),
                src_ip: "0.0.0.0/0".into(),
                src_port: "8080".into(),
                dst_ip: "192.168.2.2".into(),
                dst_port: "80".into(),
                ..Default::default()
            })
            .unwrap();
        store.insert(make_block()).unwrap();
        store
            .insert(OutputBlockRule {
                protocol: "udp".into(),
                src_ip: "0.0.0.0/0".into(),
                dst_ip: "1.1.1.1".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .insert(ForwardingBlockRule {
                protocol: "tcp".into(),
                src_ip: "192.168.2.0/24".into(),
                dst_ip: "1.2.3.4".into(),
                dst_port: "25".into(),
                ..Default::default()
            })
            .unwrap();
        store
            .insert(ServicePort {
                protocol: "tcp".into(),
                port: "443".into(),
                upstream_enabled: true,
                ..Default::default()
            })
            .unwrap();
        store
            .insert(Endpoint {
                base: BaseRule {
                    rule_name: "printer".into(),
                    disabled: true,
                },
                protocol: "tcp".into(),
                ip: "192.168.2.50".into(),
                port: "631".into(),
                tags: vec!["office".into()],
                ..Default::default()
            })
            .unwrap();
        store
            .insert(MulticastPort {
                port: "5353".into(),
                upstream: false,
                ..Default::default()
            })
            .unwrap();
        store
            .insert(CustomInterfaceRule {
                interface: "docker0".into(),
                src_ip: "172.17.0.0/16".into(),
                policies: vec!["wan".into()],
                ..Default::default()
            })
            .unwrap();
        store.set_icmp(true, false).unwrap();

        let reloaded = make_store(&dir);
        assert_eq!(reloaded.config(), store.config());
        assert_eq!(reloaded.list::<MulticastPort>().len(), 1);
        assert!(reloaded.config().ping_lan);
    }
}
