//! # Assignment Engine
//!
//! Decides which peer hosts which resource. The computation is deliberately
//! boring: resources are considered oldest-first, existing placements are
//! kept wherever the owner is still eligible, and anything unplaced goes to
//! the peer with the fewest resources. Because every input is sorted the
//! same way on every peer, two peers that transiently both believe they are
//! leader write identical `assign:*` entries and the cluster converges
//! anyway.
//!
//! Only the elected leader drives this engine; everyone else just watches
//! the `assign:*` keys it produces.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ASSIGN_PREFIX, RESOURCE_PREFIX};
use crate::store::KeyStore;
use crate::value::{ResourceState, Value};

/// Picks the peer that should receive the next assignment: fewest current
/// assignments wins, first-listed peer wins ties. `None` only when `peers`
/// is empty.
pub fn calculate_assignment<'a>(
    assignments: &HashMap<String, String>,
    peers: &'a [String],
) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for peer in peers {
        let count = assignments
            .values()
            .filter(|assigned| *assigned == peer)
            .count();
        match best {
            // Strict less-than keeps the earliest peer on a tie.
            Some((_, best_count)) if count >= best_count => {}
            _ => best = Some((peer.as_str(), count)),
        }
    }
    best.map(|(peer, _)| peer)
}

/// The assignment algorithm plus the keystore IO around it.
///
/// Data model: resources live under `resource:<rid>` as
/// `(timestamp, state, address)` records; placements live under
/// `assign:<rid>` with the owning peer's name as the value and `Null` as
/// the cleared state.
pub struct AssignmentComputer {
    store: Arc<KeyStore>,
}

impl AssignmentComputer {
    pub fn new(store: Arc<KeyStore>) -> Self {
        AssignmentComputer { store }
    }

    /// Extends `current_assignments` with placements for every resource not
    /// yet assigned. Existing pairs are preserved verbatim; new resources
    /// are placed one at a time so the counts balance.
    pub fn compute_assignments(
        &self,
        resources: &[String],
        current_assignments: &HashMap<String, String>,
        peers: &[String],
    ) -> HashMap<String, String> {
        let mut assignments = current_assignments.clone();
        for resource_id in resources {
            if !assignments.contains_key(resource_id) {
                if let Some(peer) = calculate_assignment(&assignments, peers) {
                    assignments.insert(resource_id.clone(), peer.to_string());
                }
            }
        }
        assignments
    }

    /// Resource ids that want hosting, ordered by creation time (ids break
    /// timestamp ties so every peer agrees on the order). Deleted records
    /// and `please-do-not-assign` records are skipped.
    pub fn collect_resources(&self) -> Vec<String> {
        let mut resources: Vec<(String, f64)> = Vec::new();
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
            let rid = key[RESOURCE_PREFIX.len()..].to_string();
            resources.push((rid, record.timestamp));
        }
        resources.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        resources.into_iter().map(|(rid, _)| rid).collect()
    }

    /// The current placement map, restricted to known resources and live,
    /// eligible owners. An assignment to a peer that dropped out of `peers`
    /// is treated as if it did not exist, which is exactly what frees the
    /// resource for re-placement.
    pub fn collect_assignments(
        &self,
        resources: &[String],
        peers: &[String],
    ) -> HashMap<String, String> {
        let mut assignments = HashMap::new();
        for key in self.store.keys(&format!("{}*", ASSIGN_PREFIX)) {
            let rid = &key[ASSIGN_PREFIX.len()..];
            if !resources.iter().any(|r| r == rid) {
                continue;
            }
            let Some(value) = self.store.get(&key) else {
                continue;
            };
            let Some(assigned_to) = value.as_peer() else {
                continue;
            };
            if peers.iter().any(|p| p == assigned_to) {
                assignments.insert(rid.to_string(), assigned_to.to_string());
            }
        }
        assignments
    }

    /// Publishes a placement map: clears every `assign:*` key not present
    /// in it, then writes every entry. Writing is unconditional here — the
    /// caller decides whether publishing is needed at all.
    pub fn update_assignments(&self, assignments: &HashMap<String, String>) {
        for key in self.store.keys(&format!("{}*", ASSIGN_PREFIX)) {
            let rid = &key[ASSIGN_PREFIX.len()..];
            if !assignments.contains_key(rid) {
                self.store.set(&key, Value::Null);
            }
        }
        for (rid, assign_to) in assignments {
            self.store
                .set(&format!("{}{}", ASSIGN_PREFIX, rid), Value::Peer(assign_to.clone()));
        }
    }

    /// The leader's whole job: collect, compute, publish when something
    /// changed. With no eligible peers the computed map is empty and every
    /// existing assignment is cleared; that clearing pass is re-issued even
    /// when nothing is assigned, and stays idempotent.
    pub fn assign_resources(&self, peers: &[String]) {
        let ordered_resources = self.collect_resources();
        let current_assignments = self.collect_assignments(&ordered_resources, peers);
        let mut assignments = HashMap::new();
        if !peers.is_empty() {
            assignments =
                self.compute_assignments(&ordered_resources, &current_assignments, peers);
        }
        if assignments != current_assignments || assignments.is_empty() {
            debug!(
                resources = ordered_resources.len(),
                peers = peers.len(),
                placements = assignments.len(),
                "publishing assignments"
            );
            self.update_assignments(&assignments);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ResourceRecord;

    fn peers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn assignments(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(r, p)| (r.to_string(), p.to_string()))
            .collect()
    }

    fn store_with(entries: &[(&str, Value)]) -> Arc<KeyStore> {
        let store = KeyStore::in_memory();
        for (key, value) in entries {
            store.set(key, value.clone());
        }
        store
    }

    fn resource(ts: f64) -> Value {
        Value::Resource(ResourceRecord {
            timestamp: ts,
            state: ResourceState::PleaseAssign,
            address: "eth0:10.0.0.1".into(),
        })
    }

    fn parked_resource(ts: f64) -> Value {
        Value::Resource(ResourceRecord {
            timestamp: ts,
            state: ResourceState::PleaseDoNotAssign,
            address: "eth0:10.0.0.1".into(),
        })
    }

    // -- calculate_assignment ---------------------------------------------

    #[test]
    fn selects_the_peer_with_least_assignments() {
        let current = assignments(&[("A", "a"), ("B", "a"), ("C", "b")]);
        assert_eq!(calculate_assignment(&current, &peers(&["a", "b"])), Some("b"));
    }

    #[test]
    fn selects_peer_in_order_when_theres_a_tie() {
        let current = assignments(&[("A", "a"), ("B", "a"), ("C", "b"), ("D", "b")]);
        assert_eq!(calculate_assignment(&current, &peers(&["b", "a"])), Some("b"));
        assert_eq!(calculate_assignment(&current, &peers(&["a", "b"])), Some("a"));
    }

    #[test]
    fn empty_peer_list_yields_nothing() {
        assert_eq!(calculate_assignment(&HashMap::new(), &[]), None);
    }

    // -- collect_resources -------------------------------------------------

    #[test]
    fn collect_resources_ignores_deleted_resources() {
        let store = store_with(&[("resource:A", Value::Null)]);
        let computer = AssignmentComputer::new(store);
        assert!(computer.collect_resources().is_empty());
    }

    #[test]
    fn collect_resources_ignores_parked_resources() {
        let store = store_with(&[("resource:A", parked_resource(0.0))]);
        let computer = AssignmentComputer::new(store);
        assert!(computer.collect_resources().is_empty());
    }

    #[test]
    fn collect_resources_sorts_by_timestamp() {
        let store = store_with(&[
            ("resource:A", resource(1.0)),
            ("resource:B", resource(0.0)),
        ]);
        let computer = AssignmentComputer::new(store);
        assert_eq!(computer.collect_resources(), vec!["B".to_string(), "A".to_string()]);
    }

    // -- collect_assignments ----------------------------------------------

    #[test]
    fn collect_assignments_collects_assignments() {
        let store = store_with(&[("assign:A", Value::Peer("a".into()))]);
        let computer = AssignmentComputer::new(store);
        let collected = computer.collect_assignments(&["A".to_string()], &peers(&["a"]));
        assert_eq!(collected, assignments(&[("A", "a")]));
    }

    #[test]
    fn collect_assignments_ignores_unknown_resources() {
        let store = store_with(&[("assign:A", Value::Peer("a".into()))]);
        let computer = AssignmentComputer::new(store);
        assert!(computer.collect_assignments(&[], &[]).is_empty());
    }

    #[test]
    fn collect_assignments_ignores_assignments_to_dead_peers() {
        let store = store_with(&[("assign:A", Value::Peer("a".into()))]);
        let computer = AssignmentComputer::new(store);
        assert!(computer
            .collect_assignments(&["A".to_string()], &[])
            .is_empty());
    }

    #[test]
    fn collect_assignments_ignores_cleared_assignments() {
        let store = store_with(&[("assign:A", Value::Null)]);
        let computer = AssignmentComputer::new(store);
        assert!(computer
            .collect_assignments(&["A".to_string()], &peers(&["a"]))
            .is_empty());
    }

    // -- compute_assignments ----------------------------------------------

    #[test]
    fn compute_assignments_keeps_existing_assignments() {
        let computer = AssignmentComputer::new(KeyStore::in_memory());
        let result = computer.compute_assignments(
            &["A".to_string()],
            &assignments(&[("A", "a")]),
            &peers(&["b", "a"]),
        );
        assert_eq!(result.get("A").map(String::as_str), Some("a"));
    }

    #[test]
    fn compute_assignments_places_new_resources() {
        let computer = AssignmentComputer::new(KeyStore::in_memory());
        let result = computer.compute_assignments(
            &["A".to_string(), "B".to_string()],
            &HashMap::new(),
            &peers(&["b", "a"]),
        );
        assert_eq!(result.get("A").map(String::as_str), Some("b"));
        assert_eq!(result.get("B").map(String::as_str), Some("a"));
    }

    #[test]
    fn compute_assignments_is_idempotent() {
        let computer = AssignmentComputer::new(KeyStore::in_memory());
        let resources: Vec<String> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
        let first =
            computer.compute_assignments(&resources, &HashMap::new(), &peers(&["a", "b"]));
        let second = computer.compute_assignments(&resources, &first, &peers(&["a", "b"]));
        assert_eq!(first, second);
    }

    // -- update_assignments ------------------------------------------------

    #[test]
    fn update_assignments_clears_stale_entries() {
        let store = store_with(&[("assign:A", Value::Peer("a".into()))]);
        let computer = AssignmentComputer::new(store.clone());
        computer.update_assignments(&assignments(&[("B", "b")]));
        assert_eq!(store.get("assign:A"), Some(Value::Null));
        assert_eq!(store.get("assign:B"), Some(Value::Peer("b".into())));
    }

    #[test]
    fn update_assignments_with_empty_map_clears_everything() {
        let store = store_with(&[
            ("assign:A", Value::Peer("a".into())),
            ("assign:B", Value::Peer("b".into())),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        computer.update_assignments(&HashMap::new());
        assert_eq!(store.get("assign:A"), Some(Value::Null));
        assert_eq!(store.get("assign:B"), Some(Value::Null));
    }

    // -- assign_resources (driver) ----------------------------------------

    #[test]
    fn steady_state_issues_no_writes() {
        let store = store_with(&[
            ("assign:A", Value::Peer("a".into())),
            ("resource:A", resource(0.0)),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        let writes_before = store.write_count();
        computer.assign_resources(&peers(&["a"]));
        assert_eq!(store.write_count(), writes_before, "steady state must be silent");
    }

    #[test]
    fn migrates_when_the_owner_is_replaced() {
        let store = store_with(&[
            ("assign:A", Value::Peer("a".into())),
            ("resource:A", resource(0.0)),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        computer.assign_resources(&peers(&["b"]));
        assert_eq!(store.get("assign:A"), Some(Value::Peer("b".into())));
    }

    #[test]
    fn losing_a_peer_rebalances_onto_survivors() {
        let store = store_with(&[
            ("resource:A", resource(0.0)),
            ("resource:B", resource(1.0)),
            ("assign:A", Value::Peer("a".into())),
            ("assign:B", Value::Peer("b".into())),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        // b dropped out of the eligible set.
        computer.assign_resources(&peers(&["a"]));
        assert_eq!(store.get("assign:A"), Some(Value::Peer("a".into())));
        assert_eq!(store.get("assign:B"), Some(Value::Peer("a".into())));
    }

    #[test]
    fn no_eligible_peers_clears_all_assignments() {
        let store = store_with(&[
            ("resource:A", resource(0.0)),
            ("assign:A", Value::Peer("a".into())),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        computer.assign_resources(&[]);
        assert_eq!(store.get("assign:A"), Some(Value::Null));
    }

    #[test]
    fn deleted_resource_loses_its_assignment() {
        let store = store_with(&[
            ("resource:A", Value::Null),
            ("assign:A", Value::Peer("a".into())),
        ]);
        let computer = AssignmentComputer::new(store.clone());
        computer.assign_resources(&peers(&["a"]));
        assert_eq!(store.get("assign:A"), Some(Value::Null));
    }
}
