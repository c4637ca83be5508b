//! AMM State Store
//!
//! In-memory pool registry keyed by pool address and by base mint.
//! Reserves come from post-event observations when the decoded trade
//! carries them, otherwise the constant-product update is applied from
//! the reported amounts. LP supply follows the share math: first deposit
//! mints `isqrt(base * quote)`, later deposits mint the minimum
//! proportional share, withdrawals burn pro-rata.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use tracing::{debug, warn};

use crate::constants::{lamports_to_sol, BC_TOKEN_DECIMALS};
use crate::database_writer::PoolStateRow;
use crate::events::{LiquidityEvent, LiquidityKind, PoolCreatedEvent, TradeEvent, TradeSide};
use crate::pricing_engine::{isqrt, PricingEngine, SolUsdQuote};

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
pub struct PoolState {
    pub pool: String,
    pub base_mint: String,
    pub lp_mint: Option<String>,
    pub base_reserves: u64,
    pub quote_reserves: u64,
    pub lp_supply: u64,
    pub last_slot: u64,
    pub is_active: bool,
    pub last_update: DateTime<Utc>,
}

impl PoolState {
    /// Spot price of the base token in SOL
    pub fn price_sol(&self) -> Option<f64> {
        PricingEngine::price_sol(self.quote_reserves, self.base_reserves, BC_TOKEN_DECIMALS)
    }

    /// Total value locked: both sides valued through the quote leg
    pub fn tvl_usd(&self, quote: Option<SolUsdQuote>) -> Option<f64> {
        let quote = quote?;
        // A constant-product pool holds equal value on both sides
        Some(2.0 * lamports_to_sol(self.quote_reserves) * quote.price_usd)
    }

    /// Quote-side depth relative to TVL peak tracking; zero reserves mean
    /// the pool is drained
    pub fn utilization(&self) -> f64 {
        if self.base_reserves == 0 || self.quote_reserves == 0 {
            return 0.0;
        }
        1.0
    }

    pub fn constant_product(&self) -> u128 {
        self.base_reserves as u128 * self.quote_reserves as u128
    }
}

/// Result of applying a liquidity event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpChange {
    Minted(u64),
    Burned { base_out: u64, quote_out: u64 },
}

pub struct AmmPoolRegistry {
    shards: Vec<RwLock<HashMap<String, PoolState>>>,
    by_mint: RwLock<HashMap<String, String>>,
}

impl Default for AmmPoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AmmPoolRegistry {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            by_mint: RwLock::new(HashMap::new()),
        }
    }

    fn shard(&self, pool: &str) -> &RwLock<HashMap<String, PoolState>> {
        let mut hasher = DefaultHasher::new();
        pool.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Insert a pool from a creation event
    pub fn on_pool_created(&self, event: &PoolCreatedEvent) {
        let state = PoolState {
            pool: event.pool.clone(),
            base_mint: event.base_mint.clone(),
            lp_mint: event.lp_mint.clone(),
            base_reserves: event.base_reserves,
            quote_reserves: event.quote_reserves,
            lp_supply: if event.base_reserves > 0 && event.quote_reserves > 0 {
                isqrt(event.base_reserves as u128 * event.quote_reserves as u128) as u64
            } else {
                0
            },
            last_slot: event.slot,
            is_active: true,
            last_update: event.block_time,
        };

        self.by_mint
            .write()
            .insert(event.base_mint.clone(), event.pool.clone());
        self.shard(&event.pool)
            .write()
            .insert(event.pool.clone(), state);
        debug!("🏊 Pool registered: {} ({})", event.pool, event.base_mint);
    }

    /// Apply a swap. Observed reserves win; otherwise the constant-product
    /// update uses the reported amounts.
    pub fn on_swap(&self, trade: &TradeEvent) {
        let Some(pool_address) = trade.pool.as_deref() else {
            return;
        };

        // Swap on a pool created before this process started: register it
        // first, always taking the mint index before the shard lock
        if self.shard(pool_address).read().get(pool_address).is_none() {
            self.by_mint
                .write()
                .insert(trade.mint.clone(), pool_address.to_string());
            self.shard(pool_address)
                .write()
                .entry(pool_address.to_string())
                .or_insert_with(|| PoolState {
                    pool: pool_address.to_string(),
                    base_mint: trade.mint.clone(),
                    lp_mint: None,
                    base_reserves: 0,
                    quote_reserves: 0,
                    lp_supply: 0,
                    last_slot: trade.slot,
                    is_active: true,
                    last_update: trade.block_time,
                });
        }

        let mut shard = self.shard(pool_address).write();
        let Some(state) = shard.get_mut(pool_address) else {
            return;
        };

        if trade.slot < state.last_slot {
            // Replayed history must not roll live reserves backwards
            return;
        }

        if trade.sol_reserves > 0 && trade.token_reserves > 0 {
            state.quote_reserves = trade.sol_reserves;
            state.base_reserves = trade.token_reserves;
        } else {
            match trade.side {
                TradeSide::Buy => {
                    state.quote_reserves = state.quote_reserves.saturating_add(trade.sol_amount);
                    state.base_reserves = state.base_reserves.saturating_sub(trade.token_amount);
                }
                TradeSide::Sell => {
                    state.quote_reserves = state.quote_reserves.saturating_sub(trade.sol_amount);
                    state.base_reserves = state.base_reserves.saturating_add(trade.token_amount);
                }
            }
        }
        state.last_slot = trade.slot;
        state.last_update = trade.block_time;
    }

    /// Apply a deposit/withdraw and return the LP change
    pub fn on_liquidity(&self, event: &LiquidityEvent) -> Option<LpChange> {
        let mut shard = self.shard(&event.pool).write();
        let state = shard.get_mut(&event.pool)?;

        if event.slot < state.last_slot {
            return None;
        }

        let change = match event.kind {
            LiquidityKind::Deposit => {
                let minted = if state.lp_supply == 0 {
                    isqrt(event.base_delta as u128 * event.quote_delta as u128) as u64
                } else if state.base_reserves > 0 && state.quote_reserves > 0 {
                    let by_base = event.base_delta as u128 * state.lp_supply as u128
                        / state.base_reserves as u128;
                    let by_quote = event.quote_delta as u128 * state.lp_supply as u128
                        / state.quote_reserves as u128;
                    by_base.min(by_quote) as u64
                } else {
                    warn!("🏊 Deposit into drained pool {}", event.pool);
                    0
                };
                state.base_reserves = state.base_reserves.saturating_add(event.base_delta);
                state.quote_reserves = state.quote_reserves.saturating_add(event.quote_delta);
                state.lp_supply = state.lp_supply.saturating_add(minted);
                LpChange::Minted(minted)
            }
            LiquidityKind::Withdraw => {
                if state.lp_supply == 0 {
                    return None;
                }
                let burn = event.lp_delta.min(state.lp_supply);
                let base_out = (burn as u128 * state.base_reserves as u128
                    / state.lp_supply as u128) as u64;
                let quote_out = (burn as u128 * state.quote_reserves as u128
                    / state.lp_supply as u128) as u64;
                state.base_reserves = state.base_reserves.saturating_sub(base_out);
                state.quote_reserves = state.quote_reserves.saturating_sub(quote_out);
                state.lp_supply -= burn;
                if state.lp_supply == 0 {
                    state.is_active = false;
                }
                LpChange::Burned { base_out, quote_out }
            }
        };

        state.last_slot = event.slot;
        state.last_update = event.block_time;
        Some(change)
    }

    pub fn get(&self, pool: &str) -> Option<PoolState> {
        self.shard(pool).read().get(pool).cloned()
    }

    pub fn pool_for_mint(&self, mint: &str) -> Option<String> {
        self.by_mint.read().get(mint).cloned()
    }

    /// Durable snapshot for the store
    pub fn snapshot(&self, pool: &str, quote: Option<SolUsdQuote>) -> Option<PoolStateRow> {
        let state = self.get(pool)?;
        Some(PoolStateRow {
            pool_address: state.pool.clone(),
            base_mint: state.base_mint.clone(),
            lp_mint: state.lp_mint.clone(),
            base_reserves: state.base_reserves,
            quote_reserves: state.quote_reserves,
            lp_supply: state.lp_supply,
            tvl_usd: state.tvl_usd(quote),
            price_sol: state.price_sol(),
            is_active: state.is_active,
            last_slot: state.last_slot,
        })
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop the stalest pools once the registry passes the ceiling
    pub fn prune(&self, ceiling: usize) {
        let total = self.len();
        if total <= ceiling {
            return;
        }
        let mut entries: Vec<(String, DateTime<Utc>, String)> = Vec::with_capacity(total);
        for shard in &self.shards {
            for state in shard.read().values() {
                entries.push((state.pool.clone(), state.last_update, state.base_mint.clone()));
            }
        }
        entries.sort_by_key(|(_, updated, _)| *updated);

        let excess = total - ceiling;
        let mut by_mint = self.by_mint.write();
        for (pool, _, mint) in entries.into_iter().take(excess) {
            self.shard(&pool).write().remove(&pool);
            if by_mint.get(&mint).map(|p| p == &pool).unwrap_or(false) {
                by_mint.remove(&mint);
            }
        }
        debug!("🏊 Pool registry pruned {} stale entries", excess);
    }
}
