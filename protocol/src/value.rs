//! # Replicated Values
//!
//! Everything the cluster replicates is a [`Value`]: a small tagged union
//! whose variant is implied by the key prefix it is stored under. A
//! `resource:` key carries a [`ResourceRecord`], an `assign:` key carries the
//! owning peer's name, `private:status` carries a [`Status`], and the
//! election keys carry priorities and peer names. `Null` is the tombstone —
//! a deleted resource or a cleared assignment keeps its key with a `Null`
//! value so the deletion itself replicates.
//!
//! Values must survive two serialization paths unchanged: bincode on the
//! gossip wire and JSON in the persistent store.

use serde::{Deserialize, Serialize};

/// Administrative or connectivity state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Up,
    Down,
}

impl Status {
    /// Parses "up"/"down". Anything else is a validation error for the
    /// caller to surface.
    pub fn parse(s: &str) -> Option<Status> {
        match s {
            "up" => Some(Status::Up),
            "down" => Some(Status::Down),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Up => "up",
            Status::Down => "down",
        }
    }

    /// Effective status: up only when both inputs are up.
    pub fn and(self, other: Status) -> Status {
        if self == Status::Up && other == Status::Up {
            Status::Up
        } else {
            Status::Down
        }
    }
}

/// Whether a resource wants to be hosted somewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    PleaseAssign,
    PleaseDoNotAssign,
}

/// A replicated resource: a virtual address that should live on exactly one
/// peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Creation time in seconds since the Unix epoch. Orders resources when
    /// assignments are computed; never updated after creation.
    pub timestamp: f64,
    /// Whether the resource is a candidate for assignment.
    pub state: ResourceState,
    /// Opaque to the coordination plane; the platform shim interprets it as
    /// `IFNAME:IPV4`.
    pub address: String,
}

/// A value in the replicated map. The key prefix determines which variant a
/// well-behaved peer stores; the tag travels with the value so a reader can
/// always tell what it got.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Tombstone. A deleted resource or cleared assignment.
    Null,
    /// `resource:<rid>`.
    Resource(ResourceRecord),
    /// `assign:<rid>`, `vote`, `leader` — a peer name.
    Peer(String),
    /// `private:status`.
    Status(Status),
    /// `prio` — election priority, lower preferred.
    Priority(i64),
    /// `__heartbeat__` counter.
    Counter(u64),
}

impl Value {
    /// True for the tombstone variant.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The peer name, when this value carries one.
    pub fn as_peer(&self) -> Option<&str> {
        match self {
            Value::Peer(name) => Some(name),
            _ => None,
        }
    }

    /// The status, when this value carries one.
    pub fn as_status(&self) -> Option<Status> {
        match self {
            Value::Status(s) => Some(*s),
            _ => None,
        }
    }

    /// The resource record, when this value carries one.
    pub fn as_resource(&self) -> Option<&ResourceRecord> {
        match self {
            Value::Resource(r) => Some(r),
            _ => None,
        }
    }

    /// The election priority, when this value carries one.
    pub fn as_priority(&self) -> Option<i64> {
        match self {
            Value::Priority(p) => Some(*p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) {
        let json = serde_json::to_vec(value).expect("json encode");
        let back: Value = serde_json::from_slice(&json).expect("json decode");
        assert_eq!(&back, value, "json round-trip must be lossless");

        let bin = bincode::serialize(value).expect("bincode encode");
        let back: Value = bincode::deserialize(&bin).expect("bincode decode");
        assert_eq!(&back, value, "bincode round-trip must be lossless");
    }

    #[test]
    fn all_variants_roundtrip() {
        roundtrip(&Value::Null);
        roundtrip(&Value::Resource(ResourceRecord {
            timestamp: 1712345678.25,
            state: ResourceState::PleaseAssign,
            address: "eth0:192.168.1.100".into(),
        }));
        roundtrip(&Value::Peer("10.0.0.1:4573".into()));
        roundtrip(&Value::Status(Status::Up));
        roundtrip(&Value::Priority(-5));
        roundtrip(&Value::Counter(u64::MAX));
    }

    #[test]
    fn status_parse_accepts_only_up_and_down() {
        assert_eq!(Status::parse("up"), Some(Status::Up));
        assert_eq!(Status::parse("down"), Some(Status::Down));
        assert_eq!(Status::parse("UP"), None);
        assert_eq!(Status::parse(""), None);
    }

    #[test]
    fn effective_status_is_a_conjunction() {
        assert_eq!(Status::Up.and(Status::Up), Status::Up);
        assert_eq!(Status::Up.and(Status::Down), Status::Down);
        assert_eq!(Status::Down.and(Status::Up), Status::Down);
        assert_eq!(Status::Down.and(Status::Down), Status::Down);
    }

    #[test]
    fn accessors_reject_other_variants() {
        assert!(Value::Null.as_peer().is_none());
        assert!(Value::Peer("a".into()).as_status().is_none());
        assert!(Value::Status(Status::Up).as_resource().is_none());
        assert_eq!(Value::Priority(3).as_priority(), Some(3));
    }
}
