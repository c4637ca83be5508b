//! Pricing Engine
//!
//! Derives token price and market cap from observed reserves under the
//! constant-product invariant. The reserve ratio is computed in 128-bit
//! integer space; floating point only enters for the USD conversion.
//! Zero reserves yield "price unavailable" (`None`), never zero.

use chrono::{DateTime, Utc};

use crate::constants::LAMPORTS_PER_SOL;
use crate::events::PriceTag;

/// Scale applied to the integer reserve ratio before the final float
/// conversion. 10^12 keeps nine significant digits for prices as small
/// as 10^-12 SOL per token.
const RATIO_SCALE: u128 = 1_000_000_000_000;

/// A cached SOL/USD observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolUsdQuote {
    pub price_usd: f64,
    pub fetched_at: DateTime<Utc>,
}

/// Supply input for market cap derivation
#[derive(Debug, Clone, Copy)]
pub enum SupplySource {
    /// Supply read from mint metadata (whole tokens)
    Metadata(u64),
    /// Configured default supply; flags the persisted record
    AssumedDefault(u64),
}

impl SupplySource {
    fn tokens(&self) -> u64 {
        match self {
            SupplySource::Metadata(supply) | SupplySource::AssumedDefault(supply) => *supply,
        }
    }

    fn assumed(&self) -> bool {
        matches!(self, SupplySource::AssumedDefault(_))
    }
}

pub struct PricingEngine;

impl PricingEngine {
    /// Price of one whole token in SOL, from base-unit reserves.
    ///
    /// `price_sol = (r_sol / 10^9) / (r_tok / 10^decimals)`, evaluated as
    /// `r_sol * 10^decimals * SCALE / (r_tok * 10^9)` in u128 space.
    pub fn price_sol(sol_reserves: u64, token_reserves: u64, token_decimals: u8) -> Option<f64> {
        if sol_reserves == 0 || token_reserves == 0 {
            return None;
        }

        let numerator = (sol_reserves as u128)
            .checked_mul(10u128.checked_pow(token_decimals as u32)?)?
            .checked_mul(RATIO_SCALE)?;
        let denominator = (token_reserves as u128).checked_mul(LAMPORTS_PER_SOL as u128)?;

        let scaled = numerator / denominator;
        Some(scaled as f64 / RATIO_SCALE as f64)
    }

    /// Full price derivation. `quote` being absent produces a tag with
    /// SOL price only; downstream persists without USD values.
    pub fn derive(
        sol_reserves: u64,
        token_reserves: u64,
        token_decimals: u8,
        supply: SupplySource,
        quote: Option<SolUsdQuote>,
    ) -> Option<PriceTag> {
        let price_sol = Self::price_sol(sol_reserves, token_reserves, token_decimals)?;

        let (price_usd, market_cap_usd, quote_time) = match quote {
            Some(quote) => {
                let price_usd = price_sol * quote.price_usd;
                let market_cap_usd = price_usd * supply.tokens() as f64;
                (Some(price_usd), Some(market_cap_usd), Some(quote.fetched_at))
            }
            None => (None, None, None),
        };

        Some(PriceTag {
            price_sol,
            price_usd,
            market_cap_usd,
            quote_time,
            supply_assumed: supply.assumed(),
        })
    }
}

/// Integer square root (Newton's method), used for initial LP minting
pub fn isqrt(value: u128) -> u128 {
    if value < 2 {
        return value;
    }
    let mut x = value;
    let mut y = (x + 1) / 2;
    while y < x {
        x = y;
        y = (x + value / x) / 2;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_from_reserves() {
        // 30 SOL vs 150M tokens (6 decimals): 30 / 150e6 = 2e-7 SOL/token
        let price =
            PricingEngine::price_sol(30_000_000_000, 150_000_000_000_000, 6).expect("priced");
        assert!((price - 2e-7).abs() < 1e-16);
    }

    #[test]
    fn test_zero_reserves_price_unavailable() {
        assert!(PricingEngine::price_sol(0, 150_000_000_000_000, 6).is_none());
        assert!(PricingEngine::price_sol(30_000_000_000, 0, 6).is_none());
    }

    #[test]
    fn test_market_cap_derivation() {
        // Scenario: reserves (30 SOL, 150M tokens), SOL/USD 100,
        // default supply 1e9 => mcap = 2e-7 * 100 * 1e9 = 20_000 USD
        let quote = SolUsdQuote {
            price_usd: 100.0,
            fetched_at: Utc::now(),
        };
        let tag = PricingEngine::derive(
            30_000_000_000,
            150_000_000_000_000,
            6,
            SupplySource::AssumedDefault(1_000_000_000),
            Some(quote),
        )
        .expect("priced");

        assert!((tag.price_sol - 2e-7).abs() < 1e-16);
        assert!((tag.price_usd.unwrap() - 2e-5).abs() < 1e-12);
        assert!((tag.market_cap_usd.unwrap() - 20_000.0).abs() < 1e-6);
        assert!(tag.supply_assumed);
    }

    #[test]
    fn test_cross_derivations_match() {
        // price_usd = price_sol * p and mcap = price_usd * supply must
        // agree to 1e-9 relative across a spread of magnitudes
        let quote = SolUsdQuote {
            price_usd: 173.42,
            fetched_at: Utc::now(),
        };
        for (sol_r, tok_r) in [
            (1_000_000u64, 1_000_000_000_000u64),
            (85_000_000_000, 10_000_000_000_000),
            (30_000_000_000, 150_000_000_000_000),
        ] {
            let supply = SupplySource::Metadata(1_000_000_000);
            let tag = PricingEngine::derive(sol_r, tok_r, 6, supply, Some(quote)).unwrap();
            let rebuilt_usd = tag.price_sol * quote.price_usd;
            let rel = (tag.price_usd.unwrap() - rebuilt_usd).abs() / rebuilt_usd;
            assert!(rel < 1e-9);

            let rebuilt_mcap = tag.price_usd.unwrap() * 1_000_000_000.0;
            let rel = (tag.market_cap_usd.unwrap() - rebuilt_mcap).abs() / rebuilt_mcap;
            assert!(rel < 1e-9);
        }
    }

    #[test]
    fn test_no_quote_leaves_usd_absent() {
        let tag = PricingEngine::derive(
            30_000_000_000,
            150_000_000_000_000,
            6,
            SupplySource::AssumedDefault(1_000_000_000),
            None,
        )
        .expect("priced");
        assert!(tag.price_usd.is_none());
        assert!(tag.market_cap_usd.is_none());
        assert!(tag.quote_time.is_none());
    }

    #[test]
    fn test_isqrt() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(4), 2);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(1_000_000_000_000), 1_000_000);
        // (2^64 - 1)^2 territory stays exact
        let big = u64::MAX as u128;
        assert_eq!(isqrt(big * big), big);
    }
}
