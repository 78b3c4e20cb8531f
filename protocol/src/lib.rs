// Copyright (c) 2026 Hover Maintainers. MIT License.
// See LICENSE for details.

//! # Hover — Coordination Plane
//!
//! Hover keeps a set of virtual IPv4 addresses alive across a cluster: every
//! address is installed on exactly one live, healthy peer, and migrates on
//! its own when peers join, die, or lose their uplink. This crate is the
//! coordination plane; the `hover-node` binary wraps it in a daemon, an
//! HTTP admin surface, and a CLI.
//!
//! ## Architecture
//!
//! The modules mirror the moving parts of the protocol:
//!
//! - **gossip** — membership, per-peer replicated key-value state, and the
//!   phi-accrual failure detector. Everything else hangs off its events.
//! - **store** — the merged local view of the replicated map, with its
//!   durable backing.
//! - **election** — cooperative leader election piggy-backed on reserved
//!   keys in the replicated state.
//! - **assign** — the deterministic resource→peer placement algorithm and
//!   the keystore driver around it. Leader-only.
//! - **health** — administrative status ∧ gateway connectivity.
//! - **probe** — the raw-socket ICMP prober feeding the connectivity side.
//! - **platform** — the only OS-touching code: address install/release.
//! - **controller** — the event loop tying all of the above together.
//! - **config** — constants and reserved key names.
//! - **value** — the tagged union every replicated key stores.
//!
//! ## Design stance
//!
//! The cluster is AP: under partition both sides keep serving, and
//! convergence is restored by last-writer-wins replication plus a placement
//! function deterministic enough that even two simultaneous leaders write
//! identical assignments. Per-peer callbacks run strictly one at a time —
//! the assignment logic is simple *because* it never races itself.

pub mod assign;
pub mod config;
pub mod controller;
pub mod election;
pub mod gossip;
pub mod health;
pub mod platform;
pub mod probe;
pub mod store;
pub mod value;
