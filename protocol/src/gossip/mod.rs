//! # Gossip Substrate
//!
//! Disseminates per-peer key-value state across the cluster and watches for
//! peers going quiet. Each peer owns its own slice of the state (versioned
//! by a per-peer counter); anti-entropy rounds exchange digests and deltas
//! over UDP until everyone holds everyone's latest values. Liveness comes
//! from a phi-accrual detector fed by observed progress.
//!
//! The gossiper does not interpret values. It surfaces three kinds of
//! [`GossipEvent`] over a channel — value changes, peers turning alive,
//! peers turning dead — and the protocol controller does the thinking. Every
//! local [`Gossiper::set`] also emits a `ValueChanged` with the local peer
//! as source (the self-echo); the controller acts on its own assignments
//! only when that echo arrives, so the handling path is identical for local
//! and replicated writes.

mod detector;
mod message;
mod peer;

pub use message::{Delta, Digest, GossipMessage, MAX_DELTAS};
pub use peer::PeerState;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::{self, HEARTBEAT_KEY, STATUS_KEY};
use crate::value::{Status, Value};

// ---------------------------------------------------------------------------
// Configuration & Events
// ---------------------------------------------------------------------------

/// Configuration for the gossip substrate.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// This peer's identity. `host:port`, doubling as its UDP endpoint.
    pub name: String,
    /// Phi threshold above which a peer is declared dead.
    pub phi_threshold: f64,
    /// Endpoints to gossip with before any peer state has been learned.
    pub seeds: Vec<String>,
}

impl GossipConfig {
    pub fn new(name: impl Into<String>) -> Self {
        GossipConfig {
            name: name.into(),
            phi_threshold: config::DEFAULT_PHI_THRESHOLD,
            seeds: Vec::new(),
        }
    }
}

/// What the substrate tells the rest of the system.
#[derive(Debug, Clone, PartialEq)]
pub enum GossipEvent {
    /// A peer (possibly this one) changed one of its values.
    ValueChanged {
        peer: String,
        key: String,
        value: Value,
    },
    /// A peer entered the live set (first contact or resurrection).
    PeerAlive(String),
    /// A peer's phi crossed the threshold.
    PeerDead(String),
}

/// One peer's view of a neighbor, for the admin surface.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub name: String,
    pub alive: bool,
    pub phi: f64,
    pub status: Option<Status>,
}

// ---------------------------------------------------------------------------
// Gossiper
// ---------------------------------------------------------------------------

/// The cluster membership and replication engine.
///
/// All state lives behind one mutex; methods lock briefly, collect any
/// events to deliver, release the lock, then emit. Network IO happens only
/// in [`Gossiper::run`].
pub struct Gossiper {
    name: String,
    phi_threshold: f64,
    seeds: Vec<String>,
    state: Mutex<HashMap<String, PeerState>>,
    events: mpsc::UnboundedSender<GossipEvent>,
}

impl Gossiper {
    pub fn new(config: GossipConfig, events: mpsc::UnboundedSender<GossipEvent>) -> Arc<Self> {
        let mut peers = HashMap::new();
        peers.insert(config.name.clone(), PeerState::new(&config.name, Instant::now()));
        Arc::new(Gossiper {
            name: config.name,
            phi_threshold: config.phi_threshold,
            seeds: config.seeds,
            state: Mutex::new(peers),
            events,
        })
    }

    /// This peer's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes a key in this peer's own state and emits the self-echo.
    pub fn set(&self, key: &str, value: Value) {
        {
            let mut state = self.state.lock();
            let me = state.get_mut(&self.name).expect("own peer state always exists");
            me.set_local(key, value.clone());
        }
        if key != HEARTBEAT_KEY {
            self.emit(GossipEvent::ValueChanged {
                peer: self.name.clone(),
                key: key.to_string(),
                value,
            });
        }
    }

    /// Reads a key from this peer's own state.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.peer_get(&self.name, key)
    }

    /// Reads a key from a specific peer's replicated state.
    pub fn peer_get(&self, peer: &str, key: &str) -> Option<Value> {
        let state = self.state.lock();
        state.get(peer).and_then(|p| p.get(key).cloned())
    }

    /// Names of live peers, excluding this one.
    pub fn live_peers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut live: Vec<String> = state
            .values()
            .filter(|p| p.alive && p.name != self.name)
            .map(|p| p.name.clone())
            .collect();
        live.sort();
        live
    }

    /// Names of peers currently considered dead.
    pub fn dead_peers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut dead: Vec<String> = state
            .values()
            .filter(|p| !p.alive)
            .map(|p| p.name.clone())
            .collect();
        dead.sort();
        dead
    }

    /// Liveness, phi, and gossiped status for every neighbor.
    pub fn neighborhood(&self, now: Instant) -> Vec<PeerSnapshot> {
        let state = self.state.lock();
        let mut peers: Vec<PeerSnapshot> = state
            .values()
            .filter(|p| p.name != self.name)
            .map(|p| PeerSnapshot {
                name: p.name.clone(),
                alive: p.alive,
                phi: p.detector.phi(now),
                status: p.get(STATUS_KEY).and_then(Value::as_status),
            })
            .collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    // -- Anti-entropy ------------------------------------------------------

    /// Builds the opening digest message and picks a partner for this round.
    /// Dead peers and seeds stay in the candidate pool so a restarted peer
    /// is rediscovered without operator help.
    pub fn make_syn(&self) -> Option<(String, GossipMessage)> {
        let (digest, mut candidates) = {
            let state = self.state.lock();
            let digest = Self::digest_of(&state);
            let candidates: Vec<String> = state
                .keys()
                .filter(|name| **name != self.name)
                .cloned()
                .collect();
            (digest, candidates)
        };
        for seed in &self.seeds {
            if *seed != self.name && !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }
        let target = candidates.choose(&mut rand::thread_rng())?.clone();
        Some((
            target,
            GossipMessage::Syn {
                from: self.name.clone(),
                digest,
            },
        ))
    }

    /// Processes an inbound message and returns the reply to send back, if
    /// the exchange has another leg.
    pub fn handle_message(&self, msg: GossipMessage, now: Instant) -> Option<GossipMessage> {
        match msg {
            GossipMessage::Syn { from, digest } => {
                let mut events = Vec::new();
                let reply = {
                    let mut state = self.state.lock();
                    Self::note_contact(&mut state, &from, now, &mut events);

                    let mut wants = Vec::new();
                    let mut deltas = Vec::new();
                    for entry in &digest {
                        let ours = state.get(&entry.peer).map(|p| p.max_version).unwrap_or(0);
                        if entry.max_version > ours {
                            wants.push(Digest {
                                peer: entry.peer.clone(),
                                max_version: ours,
                            });
                        } else if ours > entry.max_version {
                            Self::collect_deltas(&state, &entry.peer, entry.max_version, &mut deltas);
                        }
                    }
                    // Peers the requester has never heard of.
                    for (name, peer) in state.iter() {
                        if peer.max_version > 0 && !digest.iter().any(|d| &d.peer == name) {
                            Self::collect_deltas(&state, name, 0, &mut deltas);
                        }
                    }
                    GossipMessage::Ack {
                        from: self.name.clone(),
                        deltas,
                        wants,
                    }
                };
                self.emit_all(events);
                Some(reply)
            }
            GossipMessage::Ack { from, deltas, wants } => {
                self.apply_deltas(&from, deltas, now);
                let deltas = {
                    let state = self.state.lock();
                    let mut out = Vec::new();
                    for want in &wants {
                        Self::collect_deltas(&state, &want.peer, want.max_version, &mut out);
                    }
                    out
                };
                Some(GossipMessage::Ack2 {
                    from: self.name.clone(),
                    deltas,
                })
            }
            GossipMessage::Ack2 { from, deltas } => {
                self.apply_deltas(&from, deltas, now);
                None
            }
        }
    }

    /// Merges a batch of deltas. Updates about this peer itself are skipped
    /// (we are authoritative for our own state); everything newer than what
    /// we hold is applied, feeds the sender's and subject's detectors, and
    /// becomes a `ValueChanged` event.
    pub fn apply_deltas(&self, sender: &str, deltas: Vec<Delta>, now: Instant) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            Self::note_contact(&mut state, sender, now, &mut events);

            let mut progressed: HashSet<String> = HashSet::new();
            for delta in deltas {
                if delta.peer == self.name {
                    continue;
                }
                if !state.contains_key(&delta.peer) {
                    state.insert(delta.peer.clone(), PeerState::new(&delta.peer, now));
                    events.push(GossipEvent::PeerAlive(delta.peer.clone()));
                }
                let peer = state.get_mut(&delta.peer).expect("peer state just ensured");
                if peer.apply(&delta.key, delta.value.clone(), delta.version) {
                    progressed.insert(delta.peer.clone());
                    if delta.key != HEARTBEAT_KEY {
                        events.push(GossipEvent::ValueChanged {
                            peer: delta.peer.clone(),
                            key: delta.key,
                            value: delta.value,
                        });
                    }
                }
            }
            for name in progressed {
                if let Some(peer) = state.get_mut(&name) {
                    peer.detector.report(now);
                    if !peer.alive {
                        peer.alive = true;
                        events.push(GossipEvent::PeerAlive(name));
                    }
                }
            }
        }
        self.emit_all(events);
    }

    /// Sweeps detectors and declares peers dead past the threshold.
    pub fn check_liveness(&self, now: Instant) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            for (name, peer) in state.iter_mut() {
                if *name == self.name || !peer.alive {
                    continue;
                }
                let phi = peer.detector.phi(now);
                if phi > self.phi_threshold {
                    peer.alive = false;
                    debug!(peer = %name, phi, "peer crossed the dead threshold");
                    events.push(GossipEvent::PeerDead(name.clone()));
                }
            }
        }
        self.emit_all(events);
    }

    // -- IO loop -----------------------------------------------------------

    /// Drives the substrate: receives datagrams, initiates rounds, bumps the
    /// heartbeat, and sweeps liveness. Runs until the process exits.
    pub async fn run(self: Arc<Self>, socket: UdpSocket) {
        let mut gossip_tick = tokio::time::interval(config::GOSSIP_INTERVAL);
        let mut heartbeat_tick = tokio::time::interval(config::HEARTBEAT_INTERVAL);
        let mut liveness_tick = tokio::time::interval(config::LIVENESS_INTERVAL);
        let mut heartbeats: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (len, src) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("gossip recv error: {}", e);
                            continue;
                        }
                    };
                    match GossipMessage::decode(&buf[..len]) {
                        Ok(msg) => {
                            trace!(from = msg.from(), %src, "gossip message");
                            if let Some(reply) = self.handle_message(msg, Instant::now()) {
                                if let Err(e) = socket.send_to(&reply.encode(), src).await {
                                    debug!(%src, "gossip reply failed: {}", e);
                                }
                            }
                        }
                        Err(e) => debug!(%src, "undecodable gossip datagram: {}", e),
                    }
                }
                _ = heartbeat_tick.tick() => {
                    heartbeats += 1;
                    self.set(HEARTBEAT_KEY, Value::Counter(heartbeats));
                }
                _ = gossip_tick.tick() => {
                    if let Some((target, syn)) = self.make_syn() {
                        if let Err(e) = socket.send_to(&syn.encode(), target.as_str()).await {
                            debug!(%target, "gossip send failed: {}", e);
                        }
                    }
                }
                _ = liveness_tick.tick() => {
                    self.check_liveness(Instant::now());
                }
            }
        }
    }

    // -- Internals ---------------------------------------------------------

    fn digest_of(state: &HashMap<String, PeerState>) -> Vec<Digest> {
        let mut digest: Vec<Digest> = state
            .values()
            .map(|p| Digest {
                peer: p.name.clone(),
                max_version: p.max_version,
            })
            .collect();
        digest.sort_by(|a, b| a.peer.cmp(&b.peer));
        digest
    }

    fn collect_deltas(
        state: &HashMap<String, PeerState>,
        peer: &str,
        after: u64,
        out: &mut Vec<Delta>,
    ) {
        let Some(peer_state) = state.get(peer) else {
            return;
        };
        for (key, value, version) in peer_state.deltas_after(after) {
            if out.len() >= MAX_DELTAS {
                return;
            }
            out.push(Delta {
                peer: peer.to_string(),
                key,
                value,
                version,
            });
        }
    }

    /// A peer spoke to us directly: make sure it exists and counts as alive.
    fn note_contact(
        state: &mut HashMap<String, PeerState>,
        name: &str,
        now: Instant,
        events: &mut Vec<GossipEvent>,
    ) {
        if !state.contains_key(name) {
            state.insert(name.to_string(), PeerState::new(name, now));
            events.push(GossipEvent::PeerAlive(name.to_string()));
            return;
        }
        let peer = state.get_mut(name).expect("peer state just checked");
        peer.detector.report(now);
        if !peer.alive {
            peer.alive = true;
            events.push(GossipEvent::PeerAlive(name.to_string()));
        }
    }

    fn emit(&self, event: GossipEvent) {
        // Receiver gone means shutdown; nothing useful left to do.
        let _ = self.events.send(event);
    }

    fn emit_all(&self, events: Vec<GossipEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
