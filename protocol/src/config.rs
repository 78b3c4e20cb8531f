//! # Protocol Constants
//!
//! Every tunable and magic number in hover lives here. The values mirror the
//! operational defaults the daemon has always shipped with; change them and
//! every peer in the cluster must change with you, because the election and
//! probing cadences assume everyone plays by the same clock.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Default port for both the gossip substrate (UDP) and the admin HTTP
/// surface (TCP). One port, two transports.
pub const DEFAULT_PORT: u16 = 4573;

/// How often a peer initiates an anti-entropy exchange with a random peer.
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);

/// How often the local heartbeat counter is bumped. Every bump advances the
/// peer's version, so remote failure detectors keep seeing progress.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How often remote peers are checked against the phi threshold.
pub const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);

/// Default phi threshold above which a peer is declared dead. Overridable
/// with `--dead-at`.
pub const DEFAULT_PHI_THRESHOLD: f64 = 8.0;

// ---------------------------------------------------------------------------
// Election
// ---------------------------------------------------------------------------

/// How long a peer waits after a membership or election-key change before
/// publishing its vote. Long enough for the live set to settle, short enough
/// that failover is not the slow part of an outage.
pub const VOTE_DELAY: Duration = Duration::from_secs(2);

/// Default election priority. Lower is preferred; ties break on peer name.
pub const DEFAULT_PRIORITY: i64 = 0;

// ---------------------------------------------------------------------------
// Connectivity probing
// ---------------------------------------------------------------------------

/// Interval between connectivity check rounds against the gateway.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Timeout for a single ICMP echo within a round.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Echo attempts per round. One reply is enough to call the gateway
/// reachable; all attempts must time out before connectivity drops.
pub const PROBE_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Reserved keys
// ---------------------------------------------------------------------------

/// Per-peer effective status, replicated so the leader can exclude peers
/// that are administratively down or have lost their gateway.
pub const STATUS_KEY: &str = "private:status";

/// Election priority key.
pub const PRIO_KEY: &str = "prio";

/// Election vote key.
pub const VOTE_KEY: &str = "vote";

/// Election winner key.
pub const LEADER_KEY: &str = "leader";

/// Liveness heartbeat. Filtered out before events reach the controller.
pub const HEARTBEAT_KEY: &str = "__heartbeat__";

/// Prefix for replicated resource records.
pub const RESOURCE_PREFIX: &str = "resource:";

/// Prefix for replicated assignment records. Leader-written.
pub const ASSIGN_PREFIX: &str = "assign:";

/// Keys that bypass the keystore: they replicate like everything else but
/// are not enumerable, not persisted, and not part of the user namespace.
pub fn reserved_keys() -> Vec<String> {
    vec![
        PRIO_KEY.to_string(),
        VOTE_KEY.to_string(),
        LEADER_KEY.to_string(),
        STATUS_KEY.to_string(),
    ]
}
