//! # Leader Election
//!
//! Cooperative election piggy-backed on the replicated state. Three reserved
//! keys per peer carry the whole protocol:
//!
//! - `prio`   — configured priority, lower preferred, names break ties
//! - `vote`   — the peer this peer currently votes for
//! - `leader` — written by a peer that believes it won
//!
//! After any membership or election-key change, a peer waits out the vote
//! delay (so the live set can settle), votes for the best-priority live
//! peer, and tallies. A peer wins when a quorum of the electorate (live
//! peers plus itself) votes for it. Until the first tally produces a winner
//! the outcome is *unknown* — deliberately distinct from "not leader" — and
//! the controller sits on its hands.
//!
//! The election owns no timer of its own: it hands the caller a
//! [`ElectionAction::ScheduleVote`] carrying a round generation, and ignores
//! timer firings from superseded rounds.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{LEADER_KEY, PRIO_KEY, VOTE_KEY};
use crate::gossip::Gossiper;
use crate::value::Value;

/// What the caller must do after poking the election.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionAction {
    /// Arrange for [`Election::vote_timer_fired`] to be called with this
    /// generation after the vote delay.
    ScheduleVote(u64),
    /// The outcome changed. `is_leader` says whether this peer won.
    Outcome { is_leader: bool, leader: String },
}

/// Election state for one peer.
pub struct Election {
    gossiper: Arc<Gossiper>,
    vote_delay: Duration,
    generation: u64,
    is_leader: Option<bool>,
    leader: Option<String>,
}

impl Election {
    pub fn new(gossiper: Arc<Gossiper>, vote_delay: Duration) -> Self {
        Election {
            gossiper,
            vote_delay,
            generation: 0,
            is_leader: None,
            leader: None,
        }
    }

    /// `None` until the first election completes.
    pub fn is_leader(&self) -> Option<bool> {
        self.is_leader
    }

    /// The peer currently believed to lead, once known.
    pub fn leader(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    pub fn vote_delay(&self) -> Duration {
        self.vote_delay
    }

    /// Opens a new election round, invalidating any pending vote timer.
    pub fn start(&mut self) -> ElectionAction {
        self.generation += 1;
        debug!(round = self.generation, "election round opened");
        ElectionAction::ScheduleVote(self.generation)
    }

    /// Offers a key change to the election. Returns `None` when the key is
    /// not an election key (the caller continues its own dispatch); returns
    /// `Some(action)` when consumed.
    pub fn value_changed(
        &mut self,
        _peer: &str,
        key: &str,
        _value: &Value,
    ) -> Option<Option<ElectionAction>> {
        match key {
            PRIO_KEY => Some(Some(self.start())),
            VOTE_KEY | LEADER_KEY => Some(self.tally()),
            _ => None,
        }
    }

    /// A peer joined the live set.
    pub fn peer_alive(&mut self, peer: &str) -> ElectionAction {
        debug!(peer, "restarting election: peer alive");
        self.start()
    }

    /// A peer left the live set.
    pub fn peer_dead(&mut self, peer: &str) -> ElectionAction {
        debug!(peer, "restarting election: peer dead");
        self.start()
    }

    /// The vote delay for round `generation` elapsed. Stale rounds are
    /// ignored. Otherwise: publish a vote for the best candidate and tally.
    pub fn vote_timer_fired(&mut self, generation: u64) -> Option<ElectionAction> {
        if generation != self.generation {
            return None;
        }
        let prios = self.known_priorities();
        let candidate = choose_candidate(&prios)?;
        debug!(candidate = %candidate, "publishing vote");
        self.gossiper.set(VOTE_KEY, Value::Peer(candidate));
        self.tally()
    }

    /// Counts votes across the electorate. A quorum winner updates the
    /// recorded outcome; the winner additionally declares itself in its
    /// `leader` key so late joiners learn the result without a full round.
    pub fn tally(&mut self) -> Option<ElectionAction> {
        let electorate = self.electorate();
        let quorum = electorate.len() / 2 + 1;
        let votes: Vec<String> = electorate
            .iter()
            .filter_map(|member| {
                self.gossiper
                    .peer_get(member, VOTE_KEY)
                    .and_then(|v| v.as_peer().map(str::to_string))
            })
            .collect();

        let winner = tally_votes(&votes, quorum)?;
        let is_leader = winner == self.gossiper.name();

        if is_leader {
            let declared = self
                .gossiper
                .get(LEADER_KEY)
                .and_then(|v| v.as_peer().map(str::to_string));
            if declared.as_deref() != Some(self.gossiper.name()) {
                self.gossiper
                    .set(LEADER_KEY, Value::Peer(self.gossiper.name().to_string()));
            }
        }

        if self.is_leader == Some(is_leader) && self.leader.as_deref() == Some(winner.as_str()) {
            return None;
        }
        info!(leader = %winner, is_us = is_leader, "election settled");
        self.is_leader = Some(is_leader);
        self.leader = Some(winner.clone());
        Some(ElectionAction::Outcome {
            is_leader,
            leader: winner,
        })
    }

    /// Live peers plus this one.
    fn electorate(&self) -> Vec<String> {
        let mut members = self.gossiper.live_peers();
        members.push(self.gossiper.name().to_string());
        members
    }

    /// Priorities published by the electorate. Members that have not yet
    /// published one are not candidates.
    fn known_priorities(&self) -> Vec<(String, i64)> {
        self.electorate()
            .into_iter()
            .filter_map(|member| {
                self.gossiper
                    .peer_get(&member, PRIO_KEY)
                    .and_then(|v| v.as_priority())
                    .map(|prio| (member, prio))
            })
            .collect()
    }
}

/// The peer everyone should vote for: lowest priority, name breaks ties.
fn choose_candidate(prios: &[(String, i64)]) -> Option<String> {
    prios
        .iter()
        .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)))
        .map(|(name, _)| name.clone())
}

/// The candidate with at least `quorum` votes, if any.
fn tally_votes(votes: &[String], quorum: usize) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for vote in votes {
        *counts.entry(vote.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .find(|(_, count)| *count >= quorum)
        .map(|(name, _)| name.to_string())
}
