//! Per-peer replicated state: a versioned key-value map plus liveness
//! bookkeeping. Versions are per-peer monotonic counters — every local write
//! bumps the owner's `max_version`, and remote updates apply only when they
//! carry a newer version than what is already held, so stale deltas arriving
//! late or out of order are dropped on the floor.

use std::collections::HashMap;
use std::time::Instant;

use super::detector::PhiDetector;
use crate::value::Value;

/// A value plus the owner-assigned version it was written at.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub value: Value,
    pub version: u64,
}

/// Everything one cluster member knows about one peer (possibly itself).
#[derive(Debug)]
pub struct PeerState {
    pub name: String,
    values: HashMap<String, VersionedValue>,
    pub max_version: u64,
    pub alive: bool,
    pub detector: PhiDetector,
}

impl PeerState {
    pub fn new(name: &str, now: Instant) -> Self {
        let mut detector = PhiDetector::new();
        detector.report(now);
        PeerState {
            name: name.to_string(),
            values: HashMap::new(),
            max_version: 0,
            alive: true,
            detector,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|vv| &vv.value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Local write: the owner assigns the next version.
    pub fn set_local(&mut self, key: &str, value: Value) -> u64 {
        self.max_version += 1;
        self.values.insert(
            key.to_string(),
            VersionedValue {
                value,
                version: self.max_version,
            },
        );
        self.max_version
    }

    /// Remote update. Applies only when `version` is newer than what this
    /// key already holds; returns whether anything changed.
    pub fn apply(&mut self, key: &str, value: Value, version: u64) -> bool {
        if let Some(existing) = self.values.get(key) {
            if version <= existing.version {
                return false;
            }
        }
        self.values.insert(key.to_string(), VersionedValue { value, version });
        if version > self.max_version {
            self.max_version = version;
        }
        true
    }

    /// Updates strictly newer than `version`, oldest first, so a receiver's
    /// `max_version` never skips past state it has not seen.
    pub fn deltas_after(&self, version: u64) -> Vec<(String, Value, u64)> {
        let mut deltas: Vec<(String, Value, u64)> = self
            .values
            .iter()
            .filter(|(_, vv)| vv.version > version)
            .map(|(k, vv)| (k.clone(), vv.value.clone(), vv.version))
            .collect();
        deltas.sort_by_key(|(_, _, v)| *v);
        deltas
    }
}
