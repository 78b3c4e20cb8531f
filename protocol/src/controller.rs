//! # Protocol Controller
//!
//! The single place where replicated state turns into action. The controller
//! consumes every [`GossipEvent`] in order, on one task, and reacts:
//!
//! - election keys go to the election, which may open a delayed vote round;
//! - `private:status` changes trigger a leader-side reassignment;
//! - this peer's own `assign:*` echoes drive the platform shim;
//! - this peer's own `resource:*` echoes trigger a leader-side reassignment;
//! - liveness transitions restart the election and, on a leader, reassign.
//!
//! Two gates keep out-of-order replication harmless. First, assignment and
//! resource events from *other* peers are ignored — a peer only acts once
//! its own replica echoes the write, so it never installs from unconfirmed
//! foreign state. Second, nothing assignment-related happens before the
//! first election settles: `is_leader` is unknown until then, and events
//! that arrive earlier are dropped on the floor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assign::AssignmentComputer;
use crate::config::{
    self, ASSIGN_PREFIX, HEARTBEAT_KEY, PRIO_KEY, RESOURCE_PREFIX, STATUS_KEY,
};
use crate::election::{Election, ElectionAction};
use crate::gossip::{GossipEvent, Gossiper};
use crate::health::StatusTracker;
use crate::platform::Platform;
use crate::probe::Pinger;
use crate::store::KeyStore;
use crate::value::{ResourceRecord, ResourceState, Status, Value};

/// Tunables for one controller instance.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Election priority announced at startup.
    pub priority: i64,
    /// Delay between opening an election round and publishing a vote.
    pub vote_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            priority: config::DEFAULT_PRIORITY,
            vote_delay: config::VOTE_DELAY,
        }
    }
}

/// One resource as reported by the admin surface.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceInfo {
    /// The `IFNAME:ADDRESS` string the resource was created with.
    pub resource: String,
    /// Present once the leader has placed the resource.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// The protocol state machine. Never touched concurrently — all entry
/// points go through [`ControllerHandle`], which serializes access.
pub struct Controller {
    gossiper: Arc<Gossiper>,
    store: Arc<KeyStore>,
    computer: AssignmentComputer,
    election: Election,
    tracker: StatusTracker,
    platform: Arc<Platform>,
    priority: i64,
}

impl Controller {
    pub fn new(
        gossiper: Arc<Gossiper>,
        store: Arc<KeyStore>,
        platform: Arc<Platform>,
        config: ControllerConfig,
    ) -> Controller {
        Controller {
            election: Election::new(gossiper.clone(), config.vote_delay),
            computer: AssignmentComputer::new(store.clone()),
            tracker: StatusTracker::new(),
            gossiper,
            store,
            platform,
            priority: config.priority,
        }
    }

    /// Announces this peer's priority and initial (down) status, and opens
    /// the first election round. Returns the vote round to schedule.
    pub fn startup(&mut self) -> Option<u64> {
        self.gossiper.set(PRIO_KEY, Value::Priority(self.priority));
        self.publish_status();
        let action = self.election.start();
        self.apply_election_action(Some(action))
    }

    /// Dispatches one gossip event. Returns a vote round to schedule, if
    /// the election opened one.
    pub fn handle_event(&mut self, event: GossipEvent) -> Option<u64> {
        match event {
            GossipEvent::ValueChanged { peer, key, value } => {
                self.value_changed(&peer, &key, &value)
            }
            GossipEvent::PeerAlive(peer) => {
                info!(peer = %peer, "peer is alive");
                let action = self.election.peer_alive(&peer);
                let pending = self.apply_election_action(Some(action));
                if self.election.is_leader() == Some(true) {
                    self.assign_resources();
                }
                pending
            }
            GossipEvent::PeerDead(peer) => {
                info!(peer = %peer, "peer is dead");
                let action = self.election.peer_dead(&peer);
                let pending = self.apply_election_action(Some(action));
                if self.election.is_leader() == Some(true) {
                    self.assign_resources();
                }
                pending
            }
        }
    }

    /// The vote delay for a round elapsed.
    pub fn vote_timer_fired(&mut self, generation: u64) -> Option<u64> {
        let action = self.election.vote_timer_fired(generation);
        self.apply_election_action(action)
    }

    pub fn vote_delay(&self) -> Duration {
        self.election.vote_delay()
    }

    fn value_changed(&mut self, peer: &str, key: &str, value: &Value) -> Option<u64> {
        if key == HEARTBEAT_KEY {
            return None;
        }
        if let Some(action) = self.election.value_changed(peer, key, value) {
            return self.apply_election_action(action);
        }
        self.store.value_changed(key, value);

        if key == STATUS_KEY {
            self.status_change(peer, value.as_status() == Some(Status::Up));
            return None;
        }
        if peer != self.gossiper.name() {
            // Not yet replicated to our own peer; act when the echo lands.
            return None;
        }
        if self.election.is_leader().is_none() {
            debug!(key, "dropping event before the first election");
            return None;
        }

        if let Some(rid) = key.strip_prefix(ASSIGN_PREFIX) {
            let resource_key = format!("{}{}", RESOURCE_PREFIX, rid);
            let record = self.store.get(&resource_key);
            let assign_to_me = value.as_peer() == Some(self.gossiper.name());
            // A tombstoned record means no address to install with; the
            // platform still sees the edge so a clearing assignment for a
            // deleted resource releases what it installed earlier.
            self.platform.assign_resource(
                rid,
                assign_to_me,
                record
                    .as_ref()
                    .and_then(|v| v.as_resource())
                    .map(|r| r.address.as_str()),
            );
        } else if key.starts_with(RESOURCE_PREFIX) && self.election.is_leader() == Some(true) {
            self.assign_resources();
        }
        None
    }

    fn status_change(&mut self, peer: &str, up: bool) {
        info!(peer = %peer, up, "peer changed status");
        if self.election.is_leader() == Some(true) {
            self.assign_resources();
        }
    }

    fn leader_elected(&mut self, is_leader: bool, leader: &str) {
        info!(leader = %leader, is_us = is_leader, "election outcome");
        if is_leader {
            self.assign_resources();
        }
    }

    fn apply_election_action(&mut self, action: Option<ElectionAction>) -> Option<u64> {
        match action {
            Some(ElectionAction::ScheduleVote(generation)) => Some(generation),
            Some(ElectionAction::Outcome { is_leader, leader }) => {
                self.leader_elected(is_leader, &leader);
                None
            }
            None => None,
        }
    }

    // -- Status ------------------------------------------------------------

    pub fn set_administrative_status(&mut self, status: Status) {
        if self.tracker.set_administrative(status) {
            self.publish_status();
        }
    }

    pub fn set_connectivity(&mut self, status: Status) {
        if self.tracker.set_connectivity(status) {
            self.publish_status();
        }
    }

    pub fn administrative_status(&self) -> Status {
        self.tracker.administrative()
    }

    pub fn connectivity(&self) -> Status {
        self.tracker.connectivity()
    }

    pub fn effective_status(&self) -> Status {
        self.tracker.effective()
    }

    fn publish_status(&self) {
        let effective = self.tracker.effective();
        info!(status = effective.as_str(), "publishing effective status");
        self.gossiper.set(STATUS_KEY, Value::Status(effective));
    }

    // -- Resources ---------------------------------------------------------

    /// Creates a resource and returns its freshly minted id.
    pub fn add_resource(&self, resource: &str) -> String {
        let resource_id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().timestamp_micros() as f64 / 1e6;
        self.store.set(
            &format!("{}{}", RESOURCE_PREFIX, resource_id),
            Value::Resource(ResourceRecord {
                timestamp,
                state: ResourceState::PleaseAssign,
                address: resource.to_string(),
            }),
        );
        info!(resource_id = %resource_id, resource = %resource, "resource added");
        resource_id
    }

    /// Tombstones a resource. False when it does not exist or is already
    /// deleted.
    pub fn delete_resource(&self, resource_id: &str) -> bool {
        let key = format!("{}{}", RESOURCE_PREFIX, resource_id);
        match self.store.get(&key) {
            Some(value) if !value.is_null() => {
                self.store.delete(&key);
                info!(resource_id = %resource_id, "resource deleted");
                true
            }
            _ => false,
        }
    }

    /// Every live resource with its current placement, if any.
    pub fn list_resources(&self) -> BTreeMap<String, ResourceInfo> {
        let mut resources = BTreeMap::new();
        for key in self.store.keys(&format!("{}*", RESOURCE_PREFIX)) {
            let Some(value) = self.store.get(&key) else {
                continue;
            };
            let Some(record) = value.as_resource() else {
                continue;
            };
            if record.state != ResourceState::PleaseAssign {
                continue;
            }
            let resource_id = key[RESOURCE_PREFIX.len()..].to_string();
            let assigned_to = self
                .store
                .get(&format!("{}{}", ASSIGN_PREFIX, resource_id))
                .and_then(|v| v.as_peer().map(str::to_string));
            resources.insert(
                resource_id,
                ResourceInfo {
                    resource: record.address.clone(),
                    assigned_to,
                },
            );
        }
        resources
    }

    // -- Assignment --------------------------------------------------------

    /// Peers eligible to host resources: live peers gossiping `up`, plus
    /// this peer when its own status is up. Sorted by a stable hash of the
    /// name so every peer feeds the engine the same order.
    pub fn collect_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .gossiper
            .live_peers()
            .into_iter()
            .filter(|peer| {
                self.gossiper.peer_get(peer, STATUS_KEY).and_then(|v| v.as_status())
                    == Some(Status::Up)
            })
            .collect();
        if self.gossiper.get(STATUS_KEY).and_then(|v| v.as_status()) == Some(Status::Up) {
            peers.push(self.gossiper.name().to_string());
        }
        peers.sort_by_key(|peer| (stable_name_hash(peer), peer.clone()));
        peers
    }

    /// Recomputes and publishes assignments for the current eligible set.
    pub fn assign_resources(&self) {
        let peers = self.collect_peers();
        self.computer.assign_resources(&peers);
    }

    pub fn is_leader(&self) -> Option<bool> {
        self.election.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.election.leader().map(str::to_string)
    }
}

/// Hashes a peer name into the shared sort key. Must be identical on every
/// peer and across runs, which rules out the std hasher.
fn stable_name_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("blake3 digest is 32 bytes"))
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Serialized access to the controller, clonable across tasks and HTTP
/// handlers. The event pump, vote timers, and the connectivity loop all
/// re-enter through here, one at a time.
#[derive(Clone)]
pub struct ControllerHandle {
    inner: Arc<Mutex<Controller>>,
}

impl ControllerHandle {
    pub fn new(controller: Controller) -> Self {
        ControllerHandle {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    /// Runs the controller's startup sequence and arms the first vote timer.
    pub fn start(&self) {
        let pending = self.inner.lock().startup();
        self.schedule_vote(pending);
    }

    /// Consumes gossip events until the channel closes.
    pub async fn run(self, mut events: UnboundedReceiver<GossipEvent>) {
        while let Some(event) = events.recv().await {
            let pending = self.inner.lock().handle_event(event);
            self.schedule_vote(pending);
        }
    }

    /// Spawns the gateway probing loop.
    pub fn spawn_connectivity_loop(&self, pinger: Pinger) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(config::PROBE_INTERVAL);
            loop {
                tick.tick().await;
                let verdict = pinger.probe_round().await;
                handle.inner.lock().set_connectivity(verdict);
            }
        })
    }

    fn schedule_vote(&self, pending: Option<u64>) {
        let Some(generation) = pending else {
            return;
        };
        let handle = self.clone();
        let delay = self.inner.lock().vote_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let next = handle.inner.lock().vote_timer_fired(generation);
            handle.schedule_vote(next);
        });
    }

    // -- Admin surface -----------------------------------------------------

    pub fn add_resource(&self, resource: &str) -> String {
        self.inner.lock().add_resource(resource)
    }

    pub fn delete_resource(&self, resource_id: &str) -> bool {
        self.inner.lock().delete_resource(resource_id)
    }

    pub fn list_resources(&self) -> BTreeMap<String, ResourceInfo> {
        self.inner.lock().list_resources()
    }

    pub fn set_administrative_status(&self, status: Status) {
        self.inner.lock().set_administrative_status(status)
    }

    pub fn effective_status(&self) -> Status {
        self.inner.lock().effective_status()
    }

    pub fn connectivity(&self) -> Status {
        self.inner.lock().connectivity()
    }

    pub fn is_leader(&self) -> Option<bool> {
        self.inner.lock().is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.inner.lock().leader()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::GossipConfig;
    use crate::platform::NullAddressOps;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct Fixture {
        controller: Controller,
        gossiper: Arc<Gossiper>,
        store: Arc<KeyStore>,
        platform: Arc<Platform>,
        ops: Arc<NullAddressOps>,
        events: UnboundedReceiver<GossipEvent>,
    }

    fn fixture(name: &str) -> Fixture {
        let (tx, events) = mpsc::unbounded_channel();
        let gossiper = Gossiper::new(GossipConfig::new(name), tx);
        let store = KeyStore::new(gossiper.clone(), None);
        let ops = Arc::new(NullAddressOps::new());
        let platform = Platform::new(ops.clone());
        let controller = Controller::new(
            gossiper.clone(),
            store.clone(),
            platform.clone(),
            ControllerConfig::default(),
        );
        Fixture {
            controller,
            gossiper,
            store,
            platform,
            ops,
            events,
        }
    }

    impl Fixture {
        /// Feeds every queued gossip event (self-echoes included) through
        /// the controller, looping until the queue drains. Returns the most
        /// recent vote round the election asked to schedule, if any.
        fn pump(&mut self) -> Option<u64> {
            let mut pending = None;
            while let Ok(event) = self.events.try_recv() {
                if let Some(generation) = self.controller.handle_event(event) {
                    pending = Some(generation);
                }
            }
            pending
        }

        /// Startup plus an immediately-fired vote timer: a single-node
        /// cluster elects itself without waiting out the delay. The prio
        /// self-echo reopens the round, so the timer fires for the latest
        /// generation the pump saw.
        fn become_leader(&mut self) {
            let mut generation = self.controller.startup().expect("startup schedules a vote");
            if let Some(latest) = self.pump() {
                generation = latest;
            }
            self.controller.vote_timer_fired(generation);
            self.pump();
            assert_eq!(self.controller.is_leader(), Some(true));
        }

        fn go_up(&mut self) {
            self.controller.set_administrative_status(Status::Up);
            self.controller.set_connectivity(Status::Up);
            self.pump();
        }
    }

    #[tokio::test]
    async fn pre_election_assignment_events_are_dropped() {
        let mut fx = fixture("a:1");
        fx.store.set(
            "resource:r1",
            Value::Resource(ResourceRecord {
                timestamp: 1.0,
                state: ResourceState::PleaseAssign,
                address: "eth0:10.0.0.1".into(),
            }),
        );
        fx.pump();
        // A self-sourced assignment echo before any election settles.
        fx.controller.handle_event(GossipEvent::ValueChanged {
            peer: "a:1".into(),
            key: "assign:r1".into(),
            value: Value::Peer("a:1".into()),
        });
        assert!(fx.platform.installed().is_empty());
    }

    #[tokio::test]
    async fn leader_assigns_and_installs_its_own_resource() {
        let mut fx = fixture("a:1");
        fx.become_leader();
        fx.go_up();

        fx.controller.add_resource("eth0:10.0.0.1");
        fx.pump();

        // The resource echo made the leader assign; the assignment echo made
        // the platform install.
        assert_eq!(fx.platform.installed().len(), 1);
        let resources = fx.controller.list_resources();
        let info = resources.values().next().expect("one resource");
        assert_eq!(info.resource, "eth0:10.0.0.1");
        assert_eq!(info.assigned_to.as_deref(), Some("a:1"));
    }

    #[tokio::test]
    async fn going_down_releases_installed_resources() {
        let mut fx = fixture("a:1");
        fx.become_leader();
        fx.go_up();
        fx.controller.add_resource("eth0:10.0.0.1");
        fx.pump();
        assert_eq!(fx.platform.installed().len(), 1);

        fx.controller.set_administrative_status(Status::Down);
        fx.pump();

        assert!(fx.platform.installed().is_empty());
        let resources = fx.controller.list_resources();
        let info = resources.values().next().expect("resource still listed");
        assert_eq!(info.assigned_to, None);
    }

    #[tokio::test]
    async fn deleting_a_resource_releases_it() {
        let mut fx = fixture("a:1");
        fx.become_leader();
        fx.go_up();
        let rid = fx.controller.add_resource("eth0:10.0.0.1");
        fx.pump();
        assert_eq!(fx.platform.installed(), vec![rid.clone()]);

        assert!(fx.controller.delete_resource(&rid));
        fx.pump();
        assert!(fx.platform.installed().is_empty());
        assert!(fx.controller.list_resources().is_empty());

        // Double delete reports not-found.
        assert!(!fx.controller.delete_resource(&rid));
    }

    #[tokio::test]
    async fn foreign_assignment_events_are_ignored() {
        let mut fx = fixture("a:1");
        // Leader, but administratively down: nothing gets self-assigned.
        fx.become_leader();
        fx.store.set(
            "resource:r1",
            Value::Resource(ResourceRecord {
                timestamp: 1.0,
                state: ResourceState::PleaseAssign,
                address: "eth0:10.0.0.1".into(),
            }),
        );
        fx.pump();

        // An assign event sourced from another peer must not drive the
        // platform, even though it names us.
        fx.controller.handle_event(GossipEvent::ValueChanged {
            peer: "b:2".into(),
            key: "assign:r1".into(),
            value: Value::Peer("a:1".into()),
        });
        assert!(fx.platform.installed().is_empty());
        assert!(fx.ops.calls().is_empty(), "no platform operation may fire");
    }

    #[tokio::test]
    async fn assignment_without_a_resource_is_ignored() {
        let mut fx = fixture("a:1");
        fx.become_leader();
        fx.controller.handle_event(GossipEvent::ValueChanged {
            peer: "a:1".into(),
            key: "assign:ghost".into(),
            value: Value::Peer("a:1".into()),
        });
        assert!(fx.platform.installed().is_empty());
    }

    #[tokio::test]
    async fn eligible_peers_follow_gossiped_status() {
        let mut fx = fixture("a:1");
        fx.become_leader();
        assert!(fx.controller.collect_peers().is_empty(), "down peers are not eligible");

        fx.go_up();
        assert_eq!(fx.controller.collect_peers(), vec!["a:1".to_string()]);
        // The effective status really went out through the gossip layer.
        assert_eq!(
            fx.gossiper.get(STATUS_KEY).and_then(|v| v.as_status()),
            Some(Status::Up)
        );
    }

    #[test]
    fn stable_name_hash_is_deterministic() {
        let a = stable_name_hash("10.0.0.1:4573");
        let b = stable_name_hash("10.0.0.1:4573");
        assert_eq!(a, b);
        assert_ne!(a, stable_name_hash("10.0.0.2:4573"));
    }
}
