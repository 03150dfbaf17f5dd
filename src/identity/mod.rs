//! Device and zone identity model

pub mod device;
pub mod zone;

pub use device::{Device, DeviceId, DeviceKey, DeviceStore, PskEntry};
pub use zone::{validate_zone_name, Zone, ZoneKind, ZoneList};
