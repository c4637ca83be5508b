//! Slot → wall-clock mapping
//!
//! Transaction frames do not always carry a block time. Block-meta updates
//! feed observed times into the clock; anything else is estimated from the
//! nearest observed slot at ~400ms per slot. All outputs are clamped to
//! [epoch, 2100) so a corrupt frame can never produce a negative or
//! far-future timestamp downstream.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::warn;

use crate::constants::{MAX_BLOCK_TIME_SECS, SOLANA_SLOT_TIME_MS};

/// Clamp a raw unix timestamp into the valid block-time range
pub fn normalize_block_time(secs: i64) -> DateTime<Utc> {
    let clamped = if secs < 0 {
        warn!("⏰ Negative block time {} clamped to epoch", secs);
        0
    } else if secs > MAX_BLOCK_TIME_SECS {
        warn!("⏰ Far-future block time {} clamped", secs);
        MAX_BLOCK_TIME_SECS
    } else {
        secs
    };
    match Utc.timestamp_opt(clamped, 0) {
        chrono::LocalResult::Single(t) => t,
        _ => Utc.timestamp_opt(0, 0).unwrap(),
    }
}

#[derive(Clone)]
pub struct SlotClock {
    observed: std::sync::Arc<Mutex<BTreeMap<u64, i64>>>,
    capacity: usize,
}

impl Default for SlotClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotClock {
    pub fn new() -> Self {
        Self {
            observed: std::sync::Arc::new(Mutex::new(BTreeMap::new())),
            capacity: 4_096,
        }
    }

    /// Record an observed (slot, block_time) pair from a block-meta frame
    pub fn observe(&self, slot: u64, block_time_secs: i64) {
        let mut observed = self.observed.lock();
        observed.insert(slot, block_time_secs);
        while observed.len() > self.capacity {
            let oldest = *observed.keys().next().expect("non-empty map");
            observed.remove(&oldest);
        }
    }

    /// Best-effort time for a slot: exact when observed, otherwise an
    /// estimate extrapolated from the nearest observed slot, otherwise now.
    pub fn time_for_slot(&self, slot: u64) -> DateTime<Utc> {
        let observed = self.observed.lock();
        if let Some(&secs) = observed.get(&slot) {
            return normalize_block_time(secs);
        }

        let nearest = observed
            .range(..=slot)
            .next_back()
            .or_else(|| observed.range(slot..).next());

        match nearest {
            Some((&known_slot, &known_secs)) => {
                let slot_delta = slot as i64 - known_slot as i64;
                let secs_delta = slot_delta * SOLANA_SLOT_TIME_MS as i64 / 1000;
                normalize_block_time(known_secs + secs_delta)
            }
            None => Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_clamps_negative() {
        assert_eq!(normalize_block_time(-5).timestamp(), 0);
    }

    #[test]
    fn test_normalize_clamps_far_future() {
        assert_eq!(
            normalize_block_time(MAX_BLOCK_TIME_SECS + 100).timestamp(),
            MAX_BLOCK_TIME_SECS
        );
    }

    #[test]
    fn test_exact_observation() {
        let clock = SlotClock::new();
        clock.observe(1000, 1_700_000_000);
        assert_eq!(clock.time_for_slot(1000).timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_estimation_from_nearest_slot() {
        let clock = SlotClock::new();
        clock.observe(1000, 1_700_000_000);
        // 10 slots later at 400ms each = 4 seconds
        assert_eq!(clock.time_for_slot(1010).timestamp(), 1_700_000_004);
        // 10 slots earlier
        assert_eq!(clock.time_for_slot(990).timestamp(), 1_699_999_996);
    }

    #[test]
    fn test_eviction_keeps_recent() {
        let clock = SlotClock::new();
        for slot in 0..5000u64 {
            clock.observe(slot, 1_700_000_000 + slot as i64);
        }
        // Oldest entries evicted, newest still exact
        assert_eq!(
            clock.time_for_slot(4999).timestamp(),
            1_700_000_000 + 4999
        );
    }
}
