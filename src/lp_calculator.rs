//! LP position valuation
//!
//! Share-based accounting: a position's claim on the pool is
//! `lp_balance / lp_supply` of each reserve leg. Impermanent loss
//! compares the position's current USD value with the HODL value of the
//! originally deposited legs at current prices.

use crate::constants::lamports_to_sol;

/// A position's claim on the pool at current reserves
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionValue {
    /// Token base units attributable to the position
    pub base_share: u64,
    /// Lamports attributable to the position
    pub quote_share: u64,
    pub value_usd: f64,
}

/// Impermanent loss breakdown
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpermanentLoss {
    pub position_usd: f64,
    pub hodl_usd: f64,
    /// Negative when the position underperforms holding
    pub delta_usd: f64,
    /// `delta_usd / hodl_usd`, 0 when HODL value is 0
    pub delta_fraction: f64,
}

pub struct LpCalculator {
    token_decimals: u8,
}

impl LpCalculator {
    pub fn new(token_decimals: u8) -> Self {
        Self { token_decimals }
    }

    fn tokens(&self, base_units: u64) -> f64 {
        base_units as f64 / 10f64.powi(self.token_decimals as i32)
    }

    /// Value a position from its LP balance. `None` when the pool has no
    /// outstanding supply.
    pub fn position_value(
        &self,
        lp_balance: u64,
        lp_supply: u64,
        base_reserves: u64,
        quote_reserves: u64,
        token_price_usd: Option<f64>,
        sol_price_usd: f64,
    ) -> Option<PositionValue> {
        if lp_supply == 0 {
            return None;
        }
        let lp_balance = lp_balance.min(lp_supply);

        let base_share =
            (lp_balance as u128 * base_reserves as u128 / lp_supply as u128) as u64;
        let quote_share =
            (lp_balance as u128 * quote_reserves as u128 / lp_supply as u128) as u64;

        let base_usd = token_price_usd
            .map(|p| self.tokens(base_share) * p)
            .unwrap_or(0.0);
        let quote_usd = lamports_to_sol(quote_share) * sol_price_usd;

        Some(PositionValue {
            base_share,
            quote_share,
            value_usd: base_usd + quote_usd,
        })
    }

    /// Compare the position against holding the original deposit
    pub fn impermanent_loss(
        &self,
        position: PositionValue,
        deposited_base: u64,
        deposited_quote: u64,
        token_price_usd: Option<f64>,
        sol_price_usd: f64,
    ) -> ImpermanentLoss {
        let hodl_usd = token_price_usd
            .map(|p| self.tokens(deposited_base) * p)
            .unwrap_or(0.0)
            + lamports_to_sol(deposited_quote) * sol_price_usd;

        let delta_usd = position.value_usd - hodl_usd;
        let delta_fraction = if hodl_usd > 0.0 {
            delta_usd / hodl_usd
        } else {
            0.0
        };

        ImpermanentLoss {
            position_usd: position.value_usd,
            hodl_usd,
            delta_usd,
            delta_fraction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_value_is_prorata() {
        let calc = LpCalculator::new(6);
        // 25% of the pool: 1M tokens, 4 SOL
        let value = calc
            .position_value(
                250_000,
                1_000_000,
                4_000_000_000, // 4000 tokens
                16_000_000_000, // 16 SOL
                Some(0.004),
                100.0,
            )
            .unwrap();
        assert_eq!(value.base_share, 1_000_000_000);
        assert_eq!(value.quote_share, 4_000_000_000);
        // 1000 tokens * $0.004 + 4 SOL * $100 = 4 + 400
        assert!((value.value_usd - 404.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_supply_is_unpriceable() {
        let calc = LpCalculator::new(6);
        assert!(calc
            .position_value(100, 0, 1_000, 1_000, Some(1.0), 100.0)
            .is_none());
    }

    #[test]
    fn test_share_sum_conserved() {
        // Sum of all user shares stays within 1 base unit of supply
        let calc = LpCalculator::new(6);
        let lp_supply = 3_000_001u64;
        let base_reserves = 999_999_937u64;
        let quote_reserves = 123_456_789u64;

        let balances = [1_000_000u64, 1_999_999, 2];
        let mut base_total = 0u64;
        let mut quote_total = 0u64;
        for balance in balances {
            let value = calc
                .position_value(balance, lp_supply, base_reserves, quote_reserves, None, 0.0)
                .unwrap();
            base_total += value.base_share;
            quote_total += value.quote_share;
        }
        assert!(base_reserves - base_total <= balances.len() as u64);
        assert!(quote_reserves - quote_total <= balances.len() as u64);
    }

    #[test]
    fn test_impermanent_loss_against_hodl() {
        let calc = LpCalculator::new(6);
        // Deposited 1000 tokens + 4 SOL when token was $0.004.
        // Token halves in USD; the pool rebalanced into more tokens.
        let position = PositionValue {
            base_share: 1_400_000_000, // 1400 tokens
            quote_share: 2_900_000_000, // 2.9 SOL
            value_usd: 1_400.0 * 0.002 + 2.9 * 100.0,
        };
        let il = calc.impermanent_loss(
            position,
            1_000_000_000,
            4_000_000_000,
            Some(0.002),
            100.0,
        );
        // HODL: 1000 * 0.002 + 4 * 100 = 402
        assert!((il.hodl_usd - 402.0).abs() < 1e-9);
        assert!(il.delta_usd < 0.0);
        assert!(il.delta_fraction < 0.0);
    }

    #[test]
    fn test_empty_hodl_has_zero_fraction() {
        let calc = LpCalculator::new(6);
        let position = PositionValue {
            base_share: 0,
            quote_share: 0,
            value_usd: 0.0,
        };
        let il = calc.impermanent_loss(position, 0, 0, None, 100.0);
        assert_eq!(il.delta_fraction, 0.0);
    }
}
