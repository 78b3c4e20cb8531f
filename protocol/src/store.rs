//! # Replicated Keystore
//!
//! The merged, locally-readable view of the cluster's key-value state, plus
//! its durable backing. Writes route through the gossip layer (which always
//! echoes them back as a `ValueChanged` with this peer as source) and are
//! applied to the local view immediately so the admin surface reads its own
//! writes without waiting for the echo.
//!
//! Reserved keys — the election triple and `private:status` — replicate like
//! everything else but never enter this store: they are not enumerable, not
//! persisted, and not readable here. Components that care about them read
//! per-peer state from the gossiper directly.
//!
//! Deletion is a write of [`Value::Null`]. Tombstones are kept (and
//! persisted) so deletions survive restarts and replicate to peers that were
//! down when the delete happened.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config;
use crate::gossip::Gossiper;
use crate::value::Value;

/// Errors surfaced while loading the persistent backing at startup.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt stored value for key {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

/// The replicated map as seen by this peer.
pub struct KeyStore {
    gossiper: Option<Arc<Gossiper>>,
    values: DashMap<String, Value>,
    db: Option<sled::Db>,
    reserved: Vec<String>,
    writes: AtomicU64,
}

impl KeyStore {
    /// A store wired to the gossip layer and an optional durable backing.
    pub fn new(gossiper: Arc<Gossiper>, db: Option<sled::Db>) -> Arc<Self> {
        Arc::new(KeyStore {
            gossiper: Some(gossiper),
            values: DashMap::new(),
            db,
            reserved: config::reserved_keys(),
            writes: AtomicU64::new(0),
        })
    }

    /// A detached store: applies writes only to the local view. Used by
    /// tests that exercise store consumers without a cluster.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(KeyStore {
            gossiper: None,
            values: DashMap::new(),
            db: None,
            reserved: config::reserved_keys(),
            writes: AtomicU64::new(0),
        })
    }

    /// Whether a key bypasses the store.
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved.iter().any(|k| k == key)
    }

    /// Upserts a key: local view, durable backing, then gossip.
    pub fn set(&self, key: &str, value: Value) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.values.insert(key.to_string(), value.clone());
        self.persist(key, &value);
        if let Some(gossiper) = &self.gossiper {
            gossiper.set(key, value);
        }
    }

    /// Deletes a key by writing the tombstone.
    pub fn delete(&self, key: &str) {
        self.set(key, Value::Null);
    }

    /// The last value observed for a key. `Some(Value::Null)` means the key
    /// exists but was deleted; callers that only want live values check.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }

    /// Keys matching `prefix*`. A trailing `*` on the pattern is accepted
    /// and stripped. Reserved keys never appear. Sorted for determinism.
    pub fn keys(&self, pattern: &str) -> Vec<String> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut keys: Vec<String> = self
            .values
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|k| k.starts_with(prefix) && !self.is_reserved(k))
            .collect();
        keys.sort();
        keys
    }

    /// Applies a replicated change to the local view. Reserved keys are
    /// ignored; identical values are a no-op (self-echoes land here after
    /// `set` already applied them).
    pub fn value_changed(&self, key: &str, value: &Value) {
        if self.is_reserved(key) {
            return;
        }
        if self.get(key).as_ref() == Some(value) {
            return;
        }
        self.values.insert(key.to_string(), value.clone());
        self.persist(key, value);
    }

    /// Loads the durable backing into the local view and re-announces every
    /// entry through the gossip layer, so state survives a full-cluster
    /// restart the same way a fresh write would replicate.
    pub fn load(&self) -> Result<usize, StoreError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let mut loaded = 0;
        for entry in db.iter() {
            let (key_bytes, value_bytes) = entry?;
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            let value: Value =
                serde_json::from_slice(&value_bytes).map_err(|source| StoreError::Corrupt {
                    key: key.clone(),
                    source,
                })?;
            self.values.insert(key.clone(), value.clone());
            if let Some(gossiper) = &self.gossiper {
                gossiper.set(&key, value);
            }
            loaded += 1;
        }
        debug!(entries = loaded, "keystore loaded from disk");
        Ok(loaded)
    }

    /// Total `set` calls since startup. Fed to metrics; also what the
    /// steady-state tests watch to prove the assignment driver stays quiet.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn persist(&self, key: &str, value: &Value) {
        if self.is_reserved(key) {
            return;
        }
        let Some(db) = &self.db else {
            return;
        };
        // Best effort: a failed flush costs durability, not correctness —
        // the cluster still replicates the write.
        let encoded = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, "failed to encode value for persistence: {}", e);
                return;
            }
        };
        if let Err(e) = db.insert(key.as_bytes(), encoded) {
            warn!(key, "failed to persist key: {}", e);
            return;
        }
        if let Err(e) = db.flush() {
            warn!("keystore flush failed: {}", e);
        }
    }
}
