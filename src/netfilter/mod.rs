//! Packet filter client
//!
//! Policy is expressed as elements of nftables maps. The [`PacketFilter`]
//! trait covers exactly the operations the control plane needs on those
//! maps; [`NetlinkFilter`] talks to the kernel and [`MemoryFilter`] keeps
//! everything in process.

pub mod codec;
pub mod maps;
mod memory;
#[cfg(target_os = "linux")]
mod netlink;

pub use codec::{FieldType, Key, KeyBuilder, KeyPart, Transport};
pub use maps::{DataType, MapSpec};
pub use memory::MemoryFilter;
#[cfg(target_os = "linux")]
pub use netlink::NetlinkFilter;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Table address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    Inet,
    Ipv4,
}

impl Family {
    /// NFPROTO_* value carried in nfgenmsg.
    pub fn nfproto(self) -> u8 {
        match self {
            Family::Inet => 1,
            Family::Ipv4 => 2,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Inet => f.write_str("inet"),
            Family::Ipv4 => f.write_str("ip"),
        }
    }
}

/// Rule verdicts that can be stored in a verdict map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
    Continue,
    Return,
    Jump(String),
    Goto(String),
}

impl Verdict {
    /// Kernel NF_* / NFT_* verdict code.
    pub fn code(&self) -> i32 {
        match self {
            Verdict::Drop => 0,
            Verdict::Accept => 1,
            Verdict::Continue => -1,
            Verdict::Jump(_) => -3,
            Verdict::Goto(_) => -4,
            Verdict::Return => -5,
        }
    }

    pub fn chain(&self) -> Option<&str> {
        match self {
            Verdict::Jump(c) | Verdict::Goto(c) => Some(c),
            _ => None,
        }
    }

    pub fn from_code(code: i32, chain: Option<String>) -> Result<Self> {
        match (code, chain) {
            (0, _) => Ok(Verdict::Drop),
            (1, _) => Ok(Verdict::Accept),
            (-1, _) => Ok(Verdict::Continue),
            (-5, _) => Ok(Verdict::Return),
            (-3, Some(c)) => Ok(Verdict::Jump(c)),
            (-4, Some(c)) => Ok(Verdict::Goto(c)),
            (code, _) => Err(Error::Protocol(format!("unsupported verdict code {}", code))),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => f.write_str("accept"),
            Verdict::Drop => f.write_str("drop"),
            Verdict::Continue => f.write_str("continue"),
            Verdict::Return => f.write_str("return"),
            Verdict::Jump(c) => write!(f, "jump {}", c),
            Verdict::Goto(c) => write!(f, "goto {}", c),
        }
    }
}

/// Element value: a verdict, or raw data for plain maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Verdict(Verdict),
    Data(Vec<u8>),
}

impl Value {
    /// Data bytes as the map stores them. Verdicts on a data map are carried
    /// as their 4-byte code.
    pub fn data_for(&self, map: &MapSpec) -> Result<Vec<u8>> {
        let raw = match self {
            Value::Data(d) => d.clone(),
            Value::Verdict(v) => codec::verdict_to_bytes(v).to_vec(),
        };
        let len = map.data_len();
        if raw.len() > len {
            return Err(Error::Parse(format!(
                "value of {} bytes exceeds {} data length {}",
                raw.len(),
                map.name,
                len
            )));
        }
        Ok(codec::pad_to(&raw, len))
    }
}

/// A map element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub key: Key,
    pub value: Value,
}

impl Element {
    pub fn new(key: Key, value: Value) -> Self {
        Self { key, value }
    }

    pub fn verdict(key: Key, verdict: Verdict) -> Self {
        Self::new(key, Value::Verdict(verdict))
    }
}

/// Result of a single-element read-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Present(Element),
    Absent,
    /// The map could not be enumerated; presence is assumed.
    Unverified,
}

impl Lookup {
    /// Present or unverifiable.
    pub fn is_likely_present(&self) -> bool {
        !matches!(self, Lookup::Absent)
    }
}

/// Outcome of [`PacketFilter::ensure_map`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    /// Shape actually in use.
    pub spec: MapSpec,
    /// The map did not exist and was created by this call.
    pub created: bool,
}

impl Provisioned {
    pub fn existing(spec: MapSpec) -> Self {
        Self {
            spec,
            created: false,
        }
    }
}

/// Kernel packet-filter operations used by the policy engine.
///
/// All calls block until the kernel (or backing store) has answered.
pub trait PacketFilter: Send + Sync {
    /// Make sure the map exists. Element operations should be given the
    /// returned shape.
    fn ensure_map(&self, map: &MapSpec) -> Result<Provisioned>;

    /// Insert or overwrite an element. Re-adding an existing key is not an error.
    fn add_element(&self, map: &MapSpec, element: &Element) -> Result<()>;

    /// Remove an element. Missing keys yield [`Error::ElementNotFound`].
    fn delete_element(&self, map: &MapSpec, key: &Key) -> Result<()>;

    fn get_element(&self, map: &MapSpec, key: &Key) -> Result<Lookup>;

    /// Every element of the map. Concatenated maps may fail with
    /// [`Error::EnumerationUnsupported`].
    fn list_elements(&self, map: &MapSpec) -> Result<Vec<Element>>;

    /// Remove every element of the map.
    fn flush_map(&self, map: &MapSpec) -> Result<()>;

    /// Insert the rule that consults a custom zone's destination and source maps.
    fn link_zone_maps(&self, chain: &str, dst: &MapSpec, src: &MapSpec) -> Result<()>;
}

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Netlink,
    Memory,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Netlink => f.write_str("netlink"),
            Backend::Memory => f.write_str("memory"),
        }
    }
}

/// Construct the selected packet filter backend.
pub fn open(backend: Backend) -> Result<Arc<dyn PacketFilter>> {
    match backend {
        Backend::Memory => Ok(Arc::new(MemoryFilter::new())),
        #[cfg(target_os = "linux")]
        Backend::Netlink => Ok(Arc::new(NetlinkFilter::open()?)),
        #[cfg(not(target_os = "linux"))]
        Backend::Netlink => Err(Error::Config(
            "netlink backend is only available on Linux".into(),
        )),
    }
}
