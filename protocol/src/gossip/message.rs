//! # Gossip Wire Messages
//!
//! The anti-entropy exchange is the classic three-step digest/delta dance:
//!
//! ```text
//! A -- Syn(digest of everything A knows) --------------------> B
//! A <- Ack(deltas B has that A lacks, digest of B's gaps) ---- B
//! A -- Ack2(deltas filling B's gaps) ------------------------> B
//! ```
//!
//! Messages are bincode-framed and fit in a single UDP datagram; the delta
//! count per message is capped so a large backlog drains over several rounds
//! instead of producing an oversized packet.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Maximum deltas carried by a single message. Keeps datagrams bounded.
pub const MAX_DELTAS: usize = 256;

/// A peer's claim about how much state it holds for one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    /// The member the claim is about.
    pub peer: String,
    /// Highest version of that member's state the sender has seen.
    pub max_version: u64,
}

/// One key-value update from a peer's state, tagged with its version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// The member whose state this update belongs to.
    pub peer: String,
    pub key: String,
    pub value: Value,
    pub version: u64,
}

/// The three message kinds of the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GossipMessage {
    /// Opening digest: "here is how much I know about everyone".
    Syn { from: String, digest: Vec<Digest> },
    /// Response: updates the requester lacks, plus what the responder wants.
    Ack {
        from: String,
        deltas: Vec<Delta>,
        wants: Vec<Digest>,
    },
    /// Final leg: updates filling the responder's gaps.
    Ack2 { from: String, deltas: Vec<Delta> },
}

impl GossipMessage {
    /// The sender's peer name.
    pub fn from(&self) -> &str {
        match self {
            GossipMessage::Syn { from, .. } => from,
            GossipMessage::Ack { from, .. } => from,
            GossipMessage::Ack2 { from, .. } => from,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // A message we built ourselves always serializes.
        bincode::serialize(self).expect("gossip message serialization")
    }

    pub fn decode(bytes: &[u8]) -> Result<GossipMessage, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Status, Value};

    #[test]
    fn messages_roundtrip_through_bincode() {
        let msg = GossipMessage::Ack {
            from: "10.0.0.1:4573".into(),
            deltas: vec![Delta {
                peer: "10.0.0.2:4573".into(),
                key: "private:status".into(),
                value: Value::Status(Status::Up),
                version: 42,
            }],
            wants: vec![Digest {
                peer: "10.0.0.3:4573".into(),
                max_version: 7,
            }],
        };
        let decoded = GossipMessage::decode(&msg.encode()).expect("decode");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(GossipMessage::decode(&[0xff; 16]).is_err());
    }
}
