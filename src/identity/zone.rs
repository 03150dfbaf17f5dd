//! Zones

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest custom zone name; it becomes part of two map names.
pub const ZONE_NAME_MAX: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Zone {
    pub name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub zone_tags: Vec<String>,
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ZoneKind {
        ZoneKind::from_name(&self.name)
    }
}

/// What a zone membership grants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ZoneKind {
    /// No access beyond the device's own block.
    Isolated,
    Dns,
    Lan,
    Wan,
    /// Operator-defined; members reach each other through the zone's maps.
    Custom(String),
}

impl ZoneKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "isolated" => ZoneKind::Isolated,
            "dns" => ZoneKind::Dns,
            "lan" => ZoneKind::Lan,
            "wan" => ZoneKind::Wan,
            other => ZoneKind::Custom(other.to_string()),
        }
    }

    pub fn is_builtin(&self) -> bool {
        !matches!(self, ZoneKind::Custom(_))
    }

    pub fn name(&self) -> &str {
        match self {
            ZoneKind::Isolated => "isolated",
            ZoneKind::Dns => "dns",
            ZoneKind::Lan => "lan",
            ZoneKind::Wan => "wan",
            ZoneKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check a zone name. Custom names become map names, so they are limited
/// to letters, digits, `-` and `_`.
pub fn validate_zone_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::validation("Name", "zone name is empty"));
    }
    if name.len() > ZONE_NAME_MAX {
        return Err(Error::validation(
            "Name",
            format!("zone name longer than {} characters", ZONE_NAME_MAX),
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::validation(
            "Name",
            format!("{:?} contains characters other than letters, digits, - and _", name),
        ));
    }
    Ok(())
}

/// The persisted zone collection (`zones.json`, an array).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneList(pub Vec<Zone>);

impl Default for ZoneList {
    fn default() -> Self {
        ZoneList(
            ["isolated", "lan", "wan", "dns"]
                .into_iter()
                .map(Zone::new)
                .collect(),
        )
    }
}

impl ZoneList {
    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.0.iter().find(|z| z.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Zone> {
        self.0.iter_mut().find(|z| z.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.0.iter()
    }

    pub fn custom(&self) -> impl Iterator<Item = &Zone> {
        self.0.iter().filter(|z| !z.kind().is_builtin())
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).is_some_and(|z| !z.disabled)
    }

    pub fn add(&mut self, zone: Zone) -> Result<()> {
        validate_zone_name(&zone.name)?;
        if self.contains(&zone.name) {
            return Err(Error::Conflict(format!("zone {} already exists", zone.name)));
        }
        self.0.push(zone);
        Ok(())
    }

    /// Add any of `names` that are missing. Returns the names created.
    pub fn ensure(&mut self, names: &[String]) -> Result<Vec<String>> {
        let mut created = Vec::new();
        for name in names {
            if !self.contains(name) {
                self.add(Zone::new(name.clone()))?;
                created.push(name.clone());
            }
        }
        Ok(created)
    }

    pub fn remove(&mut self, name: &str) -> Result<Zone> {
        if ZoneKind::from_name(name).is_builtin() {
            return Err(Error::Conflict(format!("zone {} is built in", name)));
        }
        let pos = self
            .0
            .iter()
            .position(|z| z.name == name)
            .ok_or_else(|| Error::NotFound(format!("zone {}", name)))?;
        Ok(self.0.remove(pos))
    }
}
