//! Fee attribution
//!
//! Accumulates collected fees per pool and per UTC day, split by
//! recipient class. Swap logs already separate LP and protocol cuts;
//! collect instructions land here as explicit events. The durability
//! layer reads daily snapshots for its roll-ups.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::events::{FeeEvent, FeeKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeTotals {
    pub lp_quote: u64,
    pub protocol_quote: u64,
    pub creator_quote: u64,
    pub lp_base: u64,
    pub protocol_base: u64,
    pub creator_base: u64,
    pub event_count: u64,
}

impl FeeTotals {
    pub fn total_quote(&self) -> u64 {
        self.lp_quote + self.protocol_quote + self.creator_quote
    }

    fn absorb(&mut self, kind: FeeKind, base: u64, quote: u64) {
        match kind {
            FeeKind::Lp => {
                self.lp_quote += quote;
                self.lp_base += base;
            }
            FeeKind::Protocol => {
                self.protocol_quote += quote;
                self.protocol_base += base;
            }
            FeeKind::Creator => {
                self.creator_quote += quote;
                self.creator_base += base;
            }
        }
        self.event_count += 1;
    }
}

pub struct FeeService {
    daily: RwLock<HashMap<(String, NaiveDate), FeeTotals>>,
}

impl Default for FeeService {
    fn default() -> Self {
        Self::new()
    }
}

impl FeeService {
    pub fn new() -> Self {
        Self {
            daily: RwLock::new(HashMap::new()),
        }
    }

    /// Record a fee event against its pool/day bucket
    pub fn record(&self, event: &FeeEvent) {
        let day = event.block_time.date_naive();
        let mut daily = self.daily.write();
        daily
            .entry((event.pool.clone(), day))
            .or_default()
            .absorb(event.kind, event.base_amount, event.quote_amount);
    }

    /// Record the per-swap fee split surfaced by AMM trade logs
    pub fn record_swap_fees(
        &self,
        pool: &str,
        block_time: DateTime<Utc>,
        lp_fee_quote: u64,
        protocol_fee_quote: u64,
    ) {
        let day = block_time.date_naive();
        let mut daily = self.daily.write();
        let totals = daily.entry((pool.to_string(), day)).or_default();
        totals.lp_quote += lp_fee_quote;
        totals.protocol_quote += protocol_fee_quote;
        totals.event_count += 1;
    }

    pub fn totals_for(&self, pool: &str, day: NaiveDate) -> FeeTotals {
        self.daily
            .read()
            .get(&(pool.to_string(), day))
            .copied()
            .unwrap_or_default()
    }

    /// All buckets for one day, consumed by the daily roll-up
    pub fn day_snapshot(&self, day: NaiveDate) -> Vec<(String, FeeTotals)> {
        self.daily
            .read()
            .iter()
            .filter(|((_, bucket_day), _)| *bucket_day == day)
            .map(|((pool, _), totals)| (pool.clone(), *totals))
            .collect()
    }

    /// Drop buckets older than the retention horizon
    pub fn prune_before(&self, horizon: NaiveDate) {
        self.daily.write().retain(|(_, day), _| *day >= horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fee(kind: FeeKind, quote: u64) -> FeeEvent {
        FeeEvent {
            signature: format!("feesig-{}-{}", kind.as_str(), quote),
            slot: 100,
            block_time: Utc::now(),
            pool: "pool1".to_string(),
            kind,
            base_amount: 0,
            quote_amount: quote,
            recipient: "recipient1".to_string(),
        }
    }

    #[test]
    fn test_attribution_by_kind() {
        let service = FeeService::new();
        service.record(&fee(FeeKind::Protocol, 5_000));
        service.record(&fee(FeeKind::Creator, 2_000));
        service.record(&fee(FeeKind::Lp, 10_000));

        let totals = service.totals_for("pool1", Utc::now().date_naive());
        assert_eq!(totals.protocol_quote, 5_000);
        assert_eq!(totals.creator_quote, 2_000);
        assert_eq!(totals.lp_quote, 10_000);
        assert_eq!(totals.total_quote(), 17_000);
        assert_eq!(totals.event_count, 3);
    }

    #[test]
    fn test_swap_fee_split() {
        let service = FeeService::new();
        service.record_swap_fees("pool1", Utc::now(), 250, 50);
        service.record_swap_fees("pool1", Utc::now(), 250, 50);

        let totals = service.totals_for("pool1", Utc::now().date_naive());
        assert_eq!(totals.lp_quote, 500);
        assert_eq!(totals.protocol_quote, 100);
    }

    #[test]
    fn test_day_snapshot_and_prune() {
        let service = FeeService::new();
        service.record(&fee(FeeKind::Lp, 1_000));

        let today = Utc::now().date_naive();
        let snapshot = service.day_snapshot(today);
        assert_eq!(snapshot.len(), 1);

        service.prune_before(today + chrono::Duration::days(1));
        assert!(service.day_snapshot(today).is_empty());
    }
}
