//! Typed domain events produced by the instruction parser and carried
//! through the router, pipeline and durability layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Venue a token currently trades on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Program {
    BondingCurve,
    AmmPool,
}

impl Program {
    pub fn as_str(&self) -> &'static str {
        match self {
            Program::BondingCurve => "bonding_curve",
            Program::AmmPool => "amm_pool",
        }
    }

    pub fn trade_topic(&self) -> &'static str {
        match self {
            Program::BondingCurve => "bc:trade",
            Program::AmmPool => "amm:trade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

/// How much evidence backed the parsed amounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParseConfidence {
    /// Discriminator args and balance deltas agree
    High,
    /// Only one of the two strategies yielded amounts
    Medium,
}

/// Price derivation attached to an event once the pricing engine ran.
/// `price_usd`/`market_cap_usd` stay `None` when no SOL/USD quote exists;
/// absence is never rendered as zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceTag {
    pub price_sol: f64,
    pub price_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub quote_time: Option<DateTime<Utc>>,
    /// True when market cap used the configured default supply
    pub supply_assumed: bool,
}

/// A decoded swap on either venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub program: Program,
    pub side: TradeSide,
    pub user: String,
    pub mint: String,
    /// Bonding curve account (BC trades)
    pub curve: Option<String>,
    /// Pool account (AMM trades)
    pub pool: Option<String>,
    /// Lamports moved
    pub sol_amount: u64,
    /// Token base units moved
    pub token_amount: u64,
    /// Reserves observed at the transaction (SOL side, token side)
    pub sol_reserves: u64,
    pub token_reserves: u64,
    pub confidence: ParseConfidence,
    /// False for secondary trades sharing a signature with the canonical one
    pub is_canonical: bool,
    pub price: Option<PriceTag>,
}

/// Bonding curve token creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCreateEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub mint: String,
    pub curve: String,
    pub creator: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub uri: Option<String>,
}

/// Curve drained for migration. `mint` is absent when only the curve key
/// was observed; the lifecycle engine resolves it from the curve map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraduationEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub curve: String,
    pub mint: Option<String>,
}

/// AMM pool creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCreatedEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub pool: String,
    pub base_mint: String,
    pub lp_mint: Option<String>,
    pub creator: String,
    pub base_reserves: u64,
    pub quote_reserves: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidityKind {
    Deposit,
    Withdraw,
}

impl LiquidityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiquidityKind::Deposit => "deposit",
            LiquidityKind::Withdraw => "withdraw",
        }
    }
}

/// LP deposit or withdrawal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub pool: String,
    pub user: String,
    pub kind: LiquidityKind,
    pub lp_delta: u64,
    pub base_delta: u64,
    pub quote_delta: u64,
    pub price: Option<PriceTag>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeeKind {
    Lp,
    Protocol,
    Creator,
}

impl FeeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeeKind::Lp => "lp",
            FeeKind::Protocol => "protocol",
            FeeKind::Creator => "creator",
        }
    }
}

/// Fee collection attributed to a recipient class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub pool: String,
    pub kind: FeeKind,
    pub base_amount: u64,
    pub quote_amount: u64,
    pub recipient: String,
}

/// Curve parameter update (observed, not interpreted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveParamsEvent {
    pub signature: String,
    pub slot: u64,
    pub block_time: DateTime<Utc>,
    pub curve: String,
}

/// Everything the instruction parser can emit for one instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DecodedEvent {
    Trade(TradeEvent),
    Create(TokenCreateEvent),
    Graduation(GraduationEvent),
    PoolCreated(PoolCreatedEvent),
    Liquidity(LiquidityEvent),
    Fee(FeeEvent),
    CurveParams(CurveParamsEvent),
}

impl DecodedEvent {
    pub fn signature(&self) -> &str {
        match self {
            DecodedEvent::Trade(e) => &e.signature,
            DecodedEvent::Create(e) => &e.signature,
            DecodedEvent::Graduation(e) => &e.signature,
            DecodedEvent::PoolCreated(e) => &e.signature,
            DecodedEvent::Liquidity(e) => &e.signature,
            DecodedEvent::Fee(e) => &e.signature,
            DecodedEvent::CurveParams(e) => &e.signature,
        }
    }

    pub fn slot(&self) -> u64 {
        match self {
            DecodedEvent::Trade(e) => e.slot,
            DecodedEvent::Create(e) => e.slot,
            DecodedEvent::Graduation(e) => e.slot,
            DecodedEvent::PoolCreated(e) => e.slot,
            DecodedEvent::Liquidity(e) => e.slot,
            DecodedEvent::Fee(e) => e.slot,
            DecodedEvent::CurveParams(e) => e.slot,
        }
    }
}

/// Router/gateway event set: decoded events plus derived notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexerEvent {
    Trade(TradeEvent),
    TradeObserved(TradeEvent),
    TokenDiscovered {
        mint: String,
        program: Program,
        creator: Option<String>,
        slot: u64,
    },
    TokenGraduated {
        mint: String,
        curve: String,
        slot: u64,
        signature: String,
    },
    ThresholdCrossed {
        mint: String,
        program: Program,
        market_cap_usd: f64,
        crossed_at: DateTime<Utc>,
    },
    PoolCreated(PoolCreatedEvent),
    Liquidity(LiquidityEvent),
    Fee(FeeEvent),
    PriceUpdated {
        mint: String,
        price_sol: f64,
        price_usd: Option<f64>,
        market_cap_usd: Option<f64>,
        slot: u64,
    },
    SolPriceUpdated {
        price_usd: f64,
        fetched_at: DateTime<Utc>,
    },
    MonitorAlert {
        kind: String,
        detail: String,
        emitted_at: DateTime<Utc>,
    },
}

impl IndexerEvent {
    /// Topic string the router and gateway key subscriptions on
    pub fn topic(&self) -> String {
        match self {
            IndexerEvent::Trade(e) => e.program.trade_topic().to_string(),
            IndexerEvent::TradeObserved(_) => "monitor:trade_observed".to_string(),
            IndexerEvent::TokenDiscovered { .. } => "token:discovered".to_string(),
            IndexerEvent::TokenGraduated { .. } => "token:graduated".to_string(),
            IndexerEvent::ThresholdCrossed { .. } => "token:threshold_crossed".to_string(),
            IndexerEvent::PoolCreated(_) => "pool:created".to_string(),
            IndexerEvent::Liquidity(e) => format!("liquidity:{}", e.kind.as_str()),
            IndexerEvent::Fee(e) => format!("fee:{}", e.kind.as_str()),
            IndexerEvent::PriceUpdated { .. } => "price:updated".to_string(),
            IndexerEvent::SolPriceUpdated { .. } => "sol_price:updated".to_string(),
            IndexerEvent::MonitorAlert { kind, .. } => format!("monitor:{}", kind),
        }
    }

    /// Gateway wire frame. 64-bit integers are rendered as strings so
    /// JavaScript consumers never lose precision.
    pub fn frame(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.topic(),
            "payload": self.payload_json(),
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    fn payload_json(&self) -> serde_json::Value {
        match self {
            IndexerEvent::Trade(e) | IndexerEvent::TradeObserved(e) => serde_json::json!({
                "signature": &e.signature,
                "slot": e.slot.to_string(),
                "block_time": e.block_time.to_rfc3339(),
                "program": e.program.as_str(),
                "side": e.side.as_str(),
                "user": &e.user,
                "mint": &e.mint,
                "curve": &e.curve,
                "pool": &e.pool,
                "sol_amount": e.sol_amount.to_string(),
                "token_amount": e.token_amount.to_string(),
                "price_sol": e.price.map(|p| p.price_sol),
                "price_usd": e.price.and_then(|p| p.price_usd),
                "market_cap_usd": e.price.and_then(|p| p.market_cap_usd),
            }),
            IndexerEvent::TokenDiscovered {
                mint,
                program,
                creator,
                slot,
            } => serde_json::json!({
                "mint": mint,
                "program": program.as_str(),
                "creator": creator,
                "slot": slot.to_string(),
            }),
            IndexerEvent::TokenGraduated {
                mint,
                curve,
                slot,
                signature,
            } => serde_json::json!({
                "mint": mint,
                "curve": curve,
                "slot": slot.to_string(),
                "signature": signature,
            }),
            IndexerEvent::ThresholdCrossed {
                mint,
                program,
                market_cap_usd,
                crossed_at,
            } => serde_json::json!({
                "mint": mint,
                "program": program.as_str(),
                "market_cap_usd": market_cap_usd,
                "crossed_at": crossed_at.to_rfc3339(),
            }),
            IndexerEvent::PoolCreated(e) => serde_json::json!({
                "signature": &e.signature,
                "slot": e.slot.to_string(),
                "pool": &e.pool,
                "base_mint": &e.base_mint,
                "lp_mint": &e.lp_mint,
                "creator": &e.creator,
                "base_reserves": e.base_reserves.to_string(),
                "quote_reserves": e.quote_reserves.to_string(),
            }),
            IndexerEvent::Liquidity(e) => serde_json::json!({
                "signature": &e.signature,
                "slot": e.slot.to_string(),
                "pool": &e.pool,
                "user": &e.user,
                "kind": e.kind.as_str(),
                "lp_delta": e.lp_delta.to_string(),
                "base_delta": e.base_delta.to_string(),
                "quote_delta": e.quote_delta.to_string(),
            }),
            IndexerEvent::Fee(e) => serde_json::json!({
                "signature": &e.signature,
                "slot": e.slot.to_string(),
                "pool": &e.pool,
                "kind": e.kind.as_str(),
                "base_amount": e.base_amount.to_string(),
                "quote_amount": e.quote_amount.to_string(),
                "recipient": &e.recipient,
            }),
            IndexerEvent::PriceUpdated {
                mint,
                price_sol,
                price_usd,
                market_cap_usd,
                slot,
            } => serde_json::json!({
                "mint": mint,
                "price_sol": price_sol,
                "price_usd": price_usd,
                "market_cap_usd": market_cap_usd,
                "slot": slot.to_string(),
            }),
            IndexerEvent::SolPriceUpdated {
                price_usd,
                fetched_at,
            } => serde_json::json!({
                "price_usd": price_usd,
                "fetched_at": fetched_at.to_rfc3339(),
            }),
            IndexerEvent::MonitorAlert {
                kind,
                detail,
                emitted_at,
            } => serde_json::json!({
                "kind": kind,
                "detail": detail,
                "emitted_at": emitted_at.to_rfc3339(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_trade() -> TradeEvent {
        TradeEvent {
            signature: "sig1".to_string(),
            slot: 1000,
            block_time: Utc::now(),
            program: Program::BondingCurve,
            side: TradeSide::Buy,
            user: "user1".to_string(),
            mint: "mint1".to_string(),
            curve: Some("curve1".to_string()),
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

    #[test]
    fn test_topics() {
        let trade = IndexerEvent::Trade(sample_trade());
        assert_eq!(trade.topic(), "bc:trade");

        let mut amm = sample_trade();
        amm.program = Program::AmmPool;
        assert_eq!(IndexerEvent::Trade(amm).topic(), "amm:trade");
    }

    #[test]
    fn test_frame_serializes_u64_as_strings() {
        let frame = IndexerEvent::Trade(sample_trade()).frame();
        let payload = &frame["payload"];
        assert_eq!(payload["sol_amount"], "1000000000");
        assert_eq!(payload["slot"], "1000");
        assert_eq!(frame["type"], "bc:trade");
    }

    #[test]
    fn test_absent_price_is_null_not_zero() {
        let frame = IndexerEvent::Trade(sample_trade()).frame();
        assert!(frame["payload"]["price_usd"].is_null());
        assert!(frame["payload"]["market_cap_usd"].is_null());
    }
}
