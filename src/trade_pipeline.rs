//! Trade Pipeline
//!
//! Consumes decoded events: prices them, applies the market-cap save
//! threshold, deduplicates by signature, updates per-mint aggregates
//! under the lifecycle engine's fine-grained locks and enqueues
//! idempotent persistence. The threshold is a soft filter: the first
//! crossing flips the mint to tracked-forever and emits
//! `ThresholdCrossed` exactly once.

use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::amm_pool_registry::{AmmPoolRegistry, LpChange};
use crate::config::IndexerConfig;
use crate::constants::{lamports_to_sol, BC_TOKEN_DECIMALS, SIGNATURE_DEDUP_CAPACITY};
use crate::database_writer::{DbHandle, WriteTask};
use crate::event_router::EventRouter;
use crate::events::{
    DecodedEvent, IndexerEvent, LiquidityEvent, Program, TradeEvent,
};
use crate::fee_service::FeeService;
use crate::lifecycle_engine::LifecycleEngine;
use crate::metrics;
use crate::pricing_engine::{PricingEngine, SupplySource};
use crate::sol_price_feed::SolPriceCache;
use crate::token_metadata_cache::TokenMetadataCache;

pub struct TradePipeline {
    config: Arc<IndexerConfig>,
    lifecycle: Arc<LifecycleEngine>,
    pools: Arc<AmmPoolRegistry>,
    fees: Arc<FeeService>,
    sol_price: SolPriceCache,
    mint_meta: TokenMetadataCache,
    router: Arc<EventRouter>,
    db: DbHandle,
    seen_signatures: Mutex<LruCache<String, ()>>,
    last_trade_at: Mutex<Option<DateTime<Utc>>>,
}

impl TradePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<IndexerConfig>,
        lifecycle: Arc<LifecycleEngine>,
        pools: Arc<AmmPoolRegistry>,
        fees: Arc<FeeService>,
        sol_price: SolPriceCache,
        mint_meta: TokenMetadataCache,
        router: Arc<EventRouter>,
        db: DbHandle,
    ) -> Self {
        Self {
            config,
            lifecycle,
            pools,
            fees,
            sol_price,
            mint_meta,
            router,
            db,
            seen_signatures: Mutex::new(LruCache::new(
                NonZeroUsize::new(SIGNATURE_DEDUP_CAPACITY).expect("nonzero capacity"),
            )),
            last_trade_at: Mutex::new(None),
        }
    }

    /// Wall-clock time of the last accepted trade, for gap detection
    pub fn last_trade_at(&self) -> Option<DateTime<Utc>> {
        *self.last_trade_at.lock()
    }

    /// Process one decoded event end to end
    pub async fn process(&self, event: DecodedEvent) {
        // Parser yields when the durability queue runs hot
        if self.db.backpressure() {
            tokio::task::yield_now().await;
        }

        match event {
            DecodedEvent::Trade(trade) => self.process_trade(trade).await,
            DecodedEvent::Create(create) => self.lifecycle.observe_create(&create),
            DecodedEvent::Graduation(graduation) => {
                self.lifecycle.observe_graduation(&graduation)
            }
            DecodedEvent::PoolCreated(pool) => {
                self.pools.on_pool_created(&pool);
                self.lifecycle.observe_pool_created(&pool);
                if let Some(row) = self.pools.snapshot(&pool.pool, self.sol_price.get()) {
                    self.db.submit(WriteTask::PoolState(row));
                }
                self.router.queue(IndexerEvent::PoolCreated(pool));
            }
            DecodedEvent::Liquidity(liquidity) => self.process_liquidity(liquidity).await,
            DecodedEvent::Fee(fee) => {
                self.fees.record(&fee);
                if self.dedup(&fee.signature) {
                    self.db.submit(WriteTask::Fee(fee.clone()));
                }
                self.router.queue(IndexerEvent::Fee(fee));
            }
            DecodedEvent::CurveParams(params) => {
                debug!("🔧 Curve params updated on {}", params.curve);
            }
        }
    }

    async fn process_trade(&self, mut trade: TradeEvent) {
        trade.price = self.price_trade(&trade);
        *self.last_trade_at.lock() = Some(Utc::now());

        // Pool registry sees every AMM swap, saved or not
        if trade.program == Program::AmmPool {
            self.pools.on_swap(&trade);
        }

        let market_cap = trade.price.and_then(|p| p.market_cap_usd);
        let threshold = self.config.save_threshold_usd(trade.program);

        // Secondary trades in the same signature are analytics-only
        if !trade.is_canonical {
            self.router.queue(IndexerEvent::TradeObserved(trade));
            return;
        }

        let (_discovered, decision) = self.lifecycle.with_mint_mut(&trade, |state| {
            let above = market_cap.map(|m| m >= threshold).unwrap_or(false);

            let mut crossing = false;
            if above && !state.threshold_crossed {
                state.threshold_crossed = true;
                state.threshold_crossed_at = Some(Utc::now());
                state.tracked = true;
                crossing = true;
            }

            let save = state.tracked || above;
            if save {
                let volume_usd = trade.price.and_then(|p| p.price_usd).map(|price_usd| {
                    price_usd * trade.token_amount as f64
                        / 10f64.powi(BC_TOKEN_DECIMALS as i32)
                });
                state.volume.add_trade(
                    lamports_to_sol(trade.sol_amount),
                    volume_usd,
                    market_cap,
                    trade.side,
                );
                state.last_price = trade.price;
            }

            SaveDecision { save, crossing }
        });

        if decision.crossing {
            metrics::THRESHOLD_CROSSINGS.inc();
            self.router.queue(IndexerEvent::ThresholdCrossed {
                mint: trade.mint.clone(),
                program: trade.program,
                market_cap_usd: market_cap.unwrap_or(threshold),
                crossed_at: Utc::now(),
            });
        }

        if !decision.save {
            // Below threshold on an untracked mint: diagnostic only
            self.router.queue(IndexerEvent::TradeObserved(trade));
            return;
        }

        // First save announces the mint (discovery event + phase rows)
        self.lifecycle.announce_mint(&trade.mint);

        if trade.program == Program::AmmPool {
            self.lifecycle.graduate_from_amm_observation(&trade);
            if let Some(pool) = trade.pool.as_deref() {
                if let Some(row) = self.pools.snapshot(pool, self.sol_price.get()) {
                    self.db.submit(WriteTask::PoolState(row));
                }
            }
        }

        metrics::TRADES_PROCESSED
            .with_label_values(&[trade.program.as_str()])
            .inc();

        if self.dedup(&trade.signature) {
            self.db.submit(WriteTask::Trade(trade.clone()));
        }
        self.lifecycle.persist_token(&trade.mint);

        if let Some(price) = trade.price {
            self.router.queue(IndexerEvent::PriceUpdated {
                mint: trade.mint.clone(),
                price_sol: price.price_sol,
                price_usd: price.price_usd,
                market_cap_usd: price.market_cap_usd,
                slot: trade.slot,
            });
        }
        self.router.queue(IndexerEvent::Trade(trade));
    }

    async fn process_liquidity(&self, mut liquidity: LiquidityEvent) {
        liquidity.price = self
            .pools
            .get(&liquidity.pool)
            .and_then(|pool| self.price_from_reserves(&pool.base_mint, pool.quote_reserves, pool.base_reserves));

        if let Some(change) = self.pools.on_liquidity(&liquidity) {
            // The registry's share math fills in deltas the args lacked
            if let LpChange::Minted(minted) = change {
                if liquidity.lp_delta == 0 {
                    liquidity.lp_delta = minted;
                }
            }
        }

        if let Some(row) = self.pools.snapshot(&liquidity.pool, self.sol_price.get()) {
            self.db.submit(WriteTask::PoolState(row));
        }
        if self.dedup(&liquidity.signature) {
            self.db.submit(WriteTask::Liquidity(liquidity.clone()));
        }
        self.router.queue(IndexerEvent::Liquidity(liquidity));
    }

    /// Curve account updates: a flipped `complete` flag is graduation
    /// evidence equal to a withdraw
    pub fn process_curve_account(
        &self,
        state: &crate::instruction_parser::CurveAccountState,
        slot: u64,
        block_time: DateTime<Utc>,
    ) {
        if state.complete {
            self.lifecycle
                .observe_curve_complete(&state.curve, slot, block_time);
        }
    }

    /// Price a trade from its observed reserves
    fn price_trade(&self, trade: &TradeEvent) -> Option<crate::events::PriceTag> {
        self.price_from_reserves(&trade.mint, trade.sol_reserves, trade.token_reserves)
    }

    fn price_from_reserves(
        &self,
        mint: &str,
        sol_reserves: u64,
        token_reserves: u64,
    ) -> Option<crate::events::PriceTag> {
        let meta = self.mint_meta.get_cached(mint);
        let decimals = meta.map(|m| m.decimals).unwrap_or(BC_TOKEN_DECIMALS);
        let supply = match meta {
            Some(m) if m.supply_base_units > 0 => SupplySource::Metadata(m.supply_tokens()),
            _ => SupplySource::AssumedDefault(self.config.default_total_supply),
        };
        PricingEngine::derive(
            sol_reserves,
            token_reserves,
            decimals,
            supply,
            self.sol_price.get(),
        )
    }

    /// True when the signature has not been enqueued before
    fn dedup(&self, signature: &str) -> bool {
        let mut seen = self.seen_signatures.lock();
        if seen.contains(signature) {
            false
        } else {
            seen.put(signature.to_string(), ());
            true
        }
    }
}

struct SaveDecision {
    save: bool,
    crossing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_writer::DatabaseWriter;
    use crate::events::{ParseConfidence, TradeSide};
    use crate::pricing_engine::SolUsdQuote;

    struct Fixture {
        pipeline: TradePipeline,
        writer: DatabaseWriter,
        router: Arc<EventRouter>,
    }

    fn fixture(sol_usd: f64) -> Fixture {
        let config = Arc::new(IndexerConfig::with_defaults(
            ":memory:",
            "http://localhost:10000",
        ));
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let router = Arc::new(EventRouter::new());
        let lifecycle = Arc::new(LifecycleEngine::new(writer.handle(), Arc::clone(&router)));
        let sol_price = SolPriceCache::new();
        sol_price.set(SolUsdQuote {
            price_usd: sol_usd,
            fetched_at: Utc::now(),
        });

        let pipeline = TradePipeline::new(
            config,
            lifecycle,
            Arc::new(AmmPoolRegistry::new()),
            Arc::new(FeeService::new()),
            sol_price,
            TokenMetadataCache::new("http://localhost:8899".to_string()),
            Arc::clone(&router),
            writer.handle(),
        );
        Fixture {
            pipeline,
            writer,
            router,
        }
    }

    fn bc_buy(signature: &str) -> TradeEvent {
        TradeEvent {
            signature: signature.to_string(),
            slot: 1000,
            block_time: Utc::now(),
            program: Program::BondingCurve,
            side: TradeSide::Buy,
            user: "trader1".to_string(),
            mint: "mintA".to_string(),
            curve: Some("curveA".to_string()),
            pool: None,
            sol_amount: 1_000_000_000,
            token_amount: 5_000_000_000,
            sol_reserves: 30_000_000_000,
            token_reserves: 150_000_000_000_000,
            confidence: ParseConfidence::High,
            is_canonical: true,
            price: None,
        }
    }

    async fn drain(writer: &mut DatabaseWriter) {
        writer.drain_now().await;
    }

    fn trade_count(writer: &DatabaseWriter) -> i64 {
        let conn = writer.connection();
        let conn = conn.lock();
        conn.query_row("SELECT COUNT(*) FROM trades_unified", [], |r| r.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_trade_above_threshold_is_saved_and_crosses_once() {
        let mut fx = fixture(100.0); // mcap = 20_000 > 8_888
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig1"))).await;
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig2"))).await;
        drain(&mut fx.writer).await;

        assert_eq!(trade_count(&fx.writer), 2);
        let state = fx.pipeline.lifecycle.get("mintA").unwrap();
        assert!(state.threshold_crossed);
        assert!(state.tracked);
        assert_eq!(state.volume.total_trades(), 2);
        assert!(state.threshold_crossed_at.is_some());
    }

    #[tokio::test]
    async fn test_trade_below_threshold_not_saved() {
        let mut fx = fixture(1.0); // mcap = 200 < 8_888
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig1"))).await;
        drain(&mut fx.writer).await;

        assert_eq!(trade_count(&fx.writer), 0);
        let state = fx.pipeline.lifecycle.get("mintA").unwrap();
        assert!(!state.threshold_crossed);
        assert!(!state.tracked);
    }

    #[tokio::test]
    async fn test_tracked_mint_saves_below_threshold_trades() {
        let mut fx = fixture(100.0);
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig1"))).await;

        // Price collapses below threshold; the mint stays tracked
        let mut cheap = bc_buy("sig2");
        cheap.sol_reserves = 1_000_000; // tiny reserves -> tiny mcap
        cheap.token_reserves = 150_000_000_000_000;
        fx.pipeline.process(DecodedEvent::Trade(cheap)).await;
        drain(&mut fx.writer).await;

        assert_eq!(trade_count(&fx.writer), 2);
    }

    #[tokio::test]
    async fn test_duplicate_signature_enqueued_once() {
        let mut fx = fixture(100.0);
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig1"))).await;
        fx.pipeline.process(DecodedEvent::Trade(bc_buy("sig1"))).await;
        drain(&mut fx.writer).await;
        assert_eq!(trade_count(&fx.writer), 1);
    }

    #[tokio::test]
    async fn test_secondary_trade_not_persisted() {
        let mut fx = fixture(100.0);
        let mut secondary = bc_buy("sig1");
        secondary.is_canonical = false;
        fx.pipeline.process(DecodedEvent::Trade(secondary)).await;
        drain(&mut fx.writer).await;
        assert_eq!(trade_count(&fx.writer), 0);
    }

    #[tokio::test]
    async fn test_unpriced_trade_on_untracked_mint_is_diagnostic_only() {
        let mut fx = fixture(100.0);
        let mut trade = bc_buy("sig1");
        trade.sol_reserves = 0; // price unavailable
        trade.token_reserves = 0;
        fx.pipeline.process(DecodedEvent::Trade(trade)).await;
        drain(&mut fx.writer).await;
        assert_eq!(trade_count(&fx.writer), 0);
    }
}
