//! SOL/USD price feed
//!
//! Polls an HTTPS endpoint returning `{"price": <number>}` every five
//! seconds behind a 30 req/min token bucket. 429 responses back off
//! exponentially up to 60 seconds. Every accepted quote lands in the
//! shared cache, the `sol_prices` table and the `sol_price:updated`
//! topic.

use anyhow::{anyhow, Result};
use chrono::Utc;
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::constants::{SOL_PRICE_MAX_BACKOFF, SOL_PRICE_POLL_INTERVAL};
use crate::database_writer::{DbHandle, WriteTask};
use crate::event_router::EventRouter;
use crate::events::IndexerEvent;
use crate::pricing_engine::SolUsdQuote;

/// Shared cache read by the pricing path
#[derive(Clone, Default)]
pub struct SolPriceCache {
    inner: Arc<RwLock<Option<SolUsdQuote>>>,
}

impl SolPriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<SolUsdQuote> {
        *self.inner.read()
    }

    pub fn set(&self, quote: SolUsdQuote) {
        *self.inner.write() = Some(quote);
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: f64,
}

pub struct SolPriceFeed {
    client: reqwest::Client,
    url: String,
    cache: SolPriceCache,
    db: DbHandle,
    router: Arc<EventRouter>,
}

impl SolPriceFeed {
    pub fn new(url: String, cache: SolPriceCache, db: DbHandle, router: Arc<EventRouter>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest client"),
            url,
            cache,
            db,
            router,
        }
    }

    /// Polling loop; runs until the process shuts down
    pub async fn run(self, shutdown: tokio::sync::watch::Receiver<bool>) {
        let limiter = RateLimiter::direct(Quota::per_minute(nonzero!(30u32)));
        let mut backoff = SOL_PRICE_POLL_INTERVAL;
        let mut shutdown = shutdown;

        info!("💵 SOL/USD feed polling {}", self.url);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            limiter.until_ready().await;

            match self.fetch_once().await {
                Ok(price_usd) => {
                    backoff = SOL_PRICE_POLL_INTERVAL;
                    let quote = SolUsdQuote {
                        price_usd,
                        fetched_at: Utc::now(),
                    };
                    self.cache.set(quote);
                    self.db.submit(WriteTask::SolPrice {
                        fetched_at: quote.fetched_at,
                        price_usd,
                    });
                    self.router.queue(IndexerEvent::SolPriceUpdated {
                        price_usd,
                        fetched_at: quote.fetched_at,
                    });
                    debug!("💵 SOL/USD = {:.4}", price_usd);
                }
                Err(e) if e.to_string().contains("429") => {
                    backoff = (backoff * 2).min(SOL_PRICE_MAX_BACKOFF);
                    warn!("💵 Rate limited by price source, backing off {:?}", backoff);
                }
                Err(e) => {
                    backoff = (backoff * 2).min(SOL_PRICE_MAX_BACKOFF);
                    warn!("💵 SOL/USD fetch failed ({}), retrying in {:?}", e, backoff);
                }
            }
        }
    }

    async fn fetch_once(&self) -> Result<f64> {
        let response = self.client.get(&self.url).send().await?;
        if response.status().as_u16() == 429 {
            return Err(anyhow!("429 rate limited"));
        }
        if !response.status().is_success() {
            return Err(anyhow!("price source returned {}", response.status()));
        }
        let body: PriceResponse = response.json().await?;
        if !body.price.is_finite() || body.price <= 0.0 {
            return Err(anyhow!("implausible SOL/USD price {}", body.price));
        }
        Ok(body.price)
    }
}
