use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::events::TradeSide;

/// Individual trade record with timestamp
#[derive(Debug, Clone)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub volume_sol: f64,
    pub volume_usd: Option<f64>,
    pub side: TradeSide,
}

/// Per-mint rolling 24-hour aggregates
/// Automatically expires old trades; tracks volume, trade counts and the
/// all-time peak market cap.
#[derive(Debug, Clone, Default)]
pub struct VolumeTracker {
    trades: VecDeque<TradeRecord>,
    total_trades: u64,
    peak_market_cap_usd: f64,
}

impl VolumeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trade and expire records outside the 24h window
    pub fn add_trade(
        &mut self,
        volume_sol: f64,
        volume_usd: Option<f64>,
        market_cap_usd: Option<f64>,
        side: TradeSide,
    ) {
        let now = Utc::now();
        self.expire_before(now - chrono::Duration::hours(24));

        self.trades.push_back(TradeRecord {
            timestamp: now,
            volume_sol,
            volume_usd,
            side,
        });
        self.total_trades += 1;

        if let Some(mcap) = market_cap_usd {
            if mcap > self.peak_market_cap_usd {
                self.peak_market_cap_usd = mcap;
            }
        }
    }

    /// Total SOL volume in the last 24 hours
    pub fn volume_24h_sol(&self) -> f64 {
        self.trades.iter().map(|t| t.volume_sol).sum()
    }

    /// Total USD volume in the last 24 hours (priced trades only)
    pub fn volume_24h_usd(&self) -> f64 {
        self.trades.iter().filter_map(|t| t.volume_usd).sum()
    }

    /// Trades in the rolling window
    pub fn window_trade_count(&self) -> usize {
        self.trades.len()
    }

    /// Trades since first observation (never expires)
    pub fn total_trades(&self) -> u64 {
        self.total_trades
    }

    pub fn buy_count_24h(&self) -> usize {
        self.trades
            .iter()
            .filter(|t| t.side == TradeSide::Buy)
            .count()
    }

    pub fn sell_count_24h(&self) -> usize {
        self.trades
            .iter()
            .filter(|t| t.side == TradeSide::Sell)
            .count()
    }

    pub fn peak_market_cap_usd(&self) -> Option<f64> {
        (self.peak_market_cap_usd > 0.0).then_some(self.peak_market_cap_usd)
    }

    /// Remove trades older than 24 hours (called periodically for cleanup)
    pub fn cleanup_old_trades(&mut self) {
        self.expire_before(Utc::now() - chrono::Duration::hours(24));
    }

    fn expire_before(&mut self, cutoff: DateTime<Utc>) {
        while let Some(oldest) = self.trades.front() {
            if oldest.timestamp < cutoff {
                self.trades.pop_front();
            } else {
                break;
            }
        }
    }
}
