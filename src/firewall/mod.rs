//! Firewall rule store

pub mod rules;
pub mod store;

pub use rules::{
    BaseRule, BlockRule, CustomInterfaceRule, Endpoint, FirewallConfig, ForwardingBlockRule,
    ForwardingRule, MulticastPort, OutputBlockRule, Rule, RuleKind, ServicePort,
};
pub use store::{FirewallStore, Inserted};
