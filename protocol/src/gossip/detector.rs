//! # Phi-Accrual Failure Detection
//!
//! Instead of a binary timeout, each peer accrues a suspicion score (phi)
//! that grows the longer the peer stays silent relative to how chatty it
//! usually is. The daemon compares phi against a configurable threshold
//! (`--dead-at`) to decide when a peer crosses from alive to dead, and the
//! raw score is exposed over the admin surface so an operator can see a peer
//! getting quiet before it is declared gone.

use std::collections::VecDeque;
use std::time::Instant;

/// How many observed heartbeat intervals to keep. Enough history to smooth
/// over jitter, small enough to adapt when a peer's cadence changes.
const WINDOW_SIZE: usize = 100;

/// Assumed mean interval before any history exists, in seconds. Matches the
/// heartbeat cadence.
const BOOTSTRAP_MEAN: f64 = 1.0;

/// Lower bound on the mean interval. Guards the phi division against a peer
/// that bursts several observations within a few milliseconds.
const MIN_MEAN: f64 = 0.1;

/// log10(e) — converts the exponential-tail estimate into the phi scale.
const LOG10_E: f64 = std::f64::consts::LOG10_E;

/// Suspicion tracker for a single remote peer.
#[derive(Debug)]
pub struct PhiDetector {
    last_heard: Option<Instant>,
    intervals: VecDeque<f64>,
}

impl PhiDetector {
    pub fn new() -> Self {
        PhiDetector {
            last_heard: None,
            intervals: VecDeque::with_capacity(WINDOW_SIZE),
        }
    }

    /// Records a sign of life from the peer at `now`.
    pub fn report(&mut self, now: Instant) {
        if let Some(last) = self.last_heard {
            let interval = now.saturating_duration_since(last).as_secs_f64();
            if self.intervals.len() == WINDOW_SIZE {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval);
        }
        self.last_heard = Some(now);
    }

    /// Current suspicion level. 0 means the peer just spoke; the score grows
    /// without bound while the peer stays silent.
    pub fn phi(&self, now: Instant) -> f64 {
        let last = match self.last_heard {
            Some(last) => last,
            None => return 0.0,
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let mean = self.mean_interval().max(MIN_MEAN);
        LOG10_E * elapsed / mean
    }

    fn mean_interval(&self) -> f64 {
        if self.intervals.is_empty() {
            return BOOTSTRAP_MEAN;
        }
        self.intervals.iter().sum::<f64>() / self.intervals.len() as f64
    }
}

impl Default for PhiDetector {
    fn default() -> Self {
        Self::new()
    }
}
