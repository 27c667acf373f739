//! # Block Availability Registry
//!
//! Remembers, per masterchain seqno, how often archive requests came back
//! "not found" across the whole peer fleet. When a seqno looks unavailable
//! everywhere there is no point hammering more peers for it; the registry
//! recommends a back-off delay that grows with the number of misses.

use std::{collections::HashMap, sync::Mutex, time::Duration};

use tokio::time::Instant;

use galena_types::Seqno;

use crate::constants::{AVAILABILITY_DELAY_PER_MISS, AVAILABILITY_MAX_DELAY, AVAILABILITY_WINDOW};

/// Per-seqno attempt bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct BlockAvailability {
    pub total_attempts: u32,
    pub not_found_count: u32,
    pub first_attempt: Option<Instant>,
    pub last_not_found: Option<Instant>,
}

impl BlockAvailability {
    /// True when most recent attempts found nothing, fleet-wide.
    pub fn is_likely_unavailable(&self, now: Instant) -> bool {
        if self.total_attempts < 3 {
            return false;
        }
        let not_found_rate = f64::from(self.not_found_count) / f64::from(self.total_attempts);
        let recent = self
            .last_not_found
            .is_some_and(|at| now.duration_since(at) < AVAILABILITY_WINDOW);
        not_found_rate > 0.8 && recent
    }

    /// How long a fresh attempt should defer, zero when the seqno looks
    /// available.
    pub fn recommended_delay(&self, now: Instant) -> Duration {
        if !self.is_likely_unavailable(now) {
            return Duration::ZERO;
        }
        (AVAILABILITY_DELAY_PER_MISS * self.not_found_count).min(AVAILABILITY_MAX_DELAY)
    }
}

/// The process-wide availability store.
#[derive(Debug, Default)]
pub struct BlockAvailabilityRegistry {
    blocks: Mutex<HashMap<Seqno, BlockAvailability>>,
}

impl BlockAvailabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notes that a download of this seqno is starting.
    pub fn note_attempt(&self, seqno: Seqno) {
        let now = Instant::now();
        let mut blocks = self.blocks.lock().unwrap();
        let entry = blocks.entry(seqno).or_default();
        entry.total_attempts += 1;
        if entry.first_attempt.is_none() {
            entry.first_attempt = Some(now);
        }
    }

    /// Notes that a peer reported the archive for this seqno missing.
    pub fn note_not_found(&self, seqno: Seqno) {
        let now = Instant::now();
        let mut blocks = self.blocks.lock().unwrap();
        let entry = blocks.entry(seqno).or_default();
        entry.not_found_count += 1;
        entry.last_not_found = Some(now);
    }

    /// Returns a snapshot of the seqno's record, if any attempts were made.
    pub fn get(&self, seqno: Seqno) -> Option<BlockAvailability> {
        self.blocks.lock().unwrap().get(&seqno).cloned()
    }

    /// The recommended back-off before attempting this seqno.
    pub fn recommended_delay(&self, seqno: Seqno) -> Duration {
        let now = Instant::now();
        self.blocks
            .lock()
            .unwrap()
            .get(&seqno)
            .map(|entry| entry.recommended_delay(now))
            .unwrap_or(Duration::ZERO)
    }
}
