//! Control-plane counters.
//!
//! Thread-safe counters for kernel synchronisation and address allocation,
//! globally and per verdict map.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter for thread-safe increment operations.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Creates a new counter initialized to zero.
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Increments the counter by 1.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds a value to the counter.
    pub fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    /// Gets the current value of the counter.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-map element operation counts.
#[derive(Debug, Default)]
pub struct MapStats {
    pub adds: Counter,
    pub deletes: Counter,
    pub errors: Counter,
}

impl MapStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Which element operation to record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Add,
    Delete,
    Error,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    maps: RwLock<BTreeMap<String, MapStats>>,

    /// Completed device refreshes.
    pub refreshes: Counter,
    /// Refreshes aborted by a packet filter error.
    pub refresh_failures: Counter,
    /// Read-backs downgraded because the map could not be enumerated.
    pub enumeration_quirks: Counter,

    /// Addresses handed out by the allocator.
    pub allocations: Counter,
    /// Requests refused because every pool was full.
    pub pool_exhausted: Counter,

    pub rules_installed: Counter,
    pub rules_failed: Counter,

    /// Current number of device records.
    pub device_count: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an element operation on a map.
    pub fn record_map(&self, map: &str, op: MapOp) {
        {
            let maps = self.maps.read();
            if let Some(stats) = maps.get(map) {
                Self::bump(stats, op);
                return;
            }
        }
        let mut maps = self.maps.write();
        Self::bump(maps.entry(map.to_string()).or_default(), op);
    }

    fn bump(stats: &MapStats, op: MapOp) {
        match op {
            MapOp::Add => stats.adds.inc(),
            MapOp::Delete => stats.deletes.inc(),
            MapOp::Error => stats.errors.inc(),
        }
    }

    pub fn set_device_count(&self, count: usize) {
        self.device_count.store(count as u64, Ordering::Relaxed);
    }

    /// Exports all metrics as key-value pairs.
    pub fn export(&self) -> Vec<(String, u64)> {
        let mut result = vec![
            ("refreshes".into(), self.refreshes.get()),
            ("refresh_failures".into(), self.refresh_failures.get()),
            ("enumeration_quirks".into(), self.enumeration_quirks.get()),
            ("allocations".into(), self.allocations.get()),
            ("pool_exhausted".into(), self.pool_exhausted.get()),
            ("rules_installed".into(), self.rules_installed.get()),
            ("rules_failed".into(), self.rules_failed.get()),
            (
                "device_count".into(),
                self.device_count.load(Ordering::Relaxed),
            ),
        ];

        let maps = self.maps.read();
        for (name, stats) in maps.iter() {
            result.extend([
                (format!("{}_adds", name), stats.adds.get()),
                (format!("{}_deletes", name), stats.deletes.get()),
                (format!("{}_errors", name), stats.errors.get()),
            ]);
        }

        result
    }
}
