//! Instruction Parser
//!
//! Maps instruction + account layouts of the bonding curve and AMM
//! programs onto typed domain events. Amounts come from three sources in
//! priority order: anchor event logs, instruction args, balance deltas.
//! When an explicit source and the delta reading disagree by more than
//! the cross-check tolerance the explicit reading wins with a warning.

use borsh::BorshDeserialize;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::constants::{
    AMM_BUY_EVENT, AMM_BUY_IX, AMM_COLLECT_CREATOR_FEE_IX, AMM_COLLECT_PROTOCOL_FEE_IX,
    AMM_CREATE_POOL_IX, AMM_DEPOSIT_IX, AMM_PROGRAM_ID, AMM_SELL_EVENT, AMM_SELL_IX,
    AMM_WITHDRAW_IX, AMOUNT_CROSSCHECK_TOLERANCE, ANCHOR_EVENT_PREFIX, BC_BUY_IX, BC_CREATE_IX,
    BC_CURVE_ACCOUNT, BC_MIGRATION_EVENT, BC_SELL_IX, BC_SET_PARAMS_IX, BC_TRADE_EVENT,
    BC_WITHDRAW_IX, BONDING_CURVE_PROGRAM_ID, WSOL_MINT,
};
use crate::events::{
    CurveParamsEvent, DecodedEvent, FeeEvent, FeeKind, GraduationEvent, LiquidityEvent,
    LiquidityKind, ParseConfidence, PoolCreatedEvent, Program, TokenCreateEvent, TradeEvent,
    TradeSide,
};
use crate::metrics;
use crate::wire_decoder::{RawAccountUpdate, RawInstruction, RawTx};

/// Parse verdict for one signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVerdict {
    /// No instruction of either program appeared
    Unrelated,
    Parsed(ParseConfidence),
    /// A known instruction appeared but no amount source yielded a value
    Rejected,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub events: Vec<DecodedEvent>,
    pub verdict: SignatureVerdict,
}

/// Bonding curve trade event payload carried in `Program data:` logs
#[derive(BorshDeserialize)]
struct BcTradeEventLog {
    mint: [u8; 32],
    sol_amount: u64,
    token_amount: u64,
    is_buy: bool,
    user: [u8; 32],
    timestamp: i64,
    virtual_sol_reserves: u64,
    virtual_token_reserves: u64,
    real_sol_reserves: u64,
    real_token_reserves: u64,
}

const BC_TRADE_EVENT_LOG_SIZE: usize = 121;

/// Migration-complete payload
#[derive(BorshDeserialize)]
struct BcMigrationEventLog {
    user: [u8; 32],
    mint: [u8; 32],
    mint_amount: u64,
    sol_amount: u64,
    pool_migration_fee: u64,
    bonding_curve: [u8; 32],
    timestamp: i64,
    pool: [u8; 32],
}

const BC_MIGRATION_EVENT_LOG_SIZE: usize = 160;

/// AMM swap event payload (identical layout for buy and sell)
#[derive(BorshDeserialize)]
struct AmmSwapEventLog {
    timestamp: i64,
    base_amount: u64,
    min_or_max_quote_amount: u64,
    user_base_token_reserves: u64,
    user_quote_token_reserves: u64,
    pool_base_token_reserves: u64,
    pool_quote_token_reserves: u64,
    quote_amount: u64,
    lp_fee_basis_points: u64,
    lp_fee: u64,
    protocol_fee_basis_points: u64,
    protocol_fee: u64,
    quote_amount_without_lp_fee: u64,
    user_quote_amount: u64,
    pool: [u8; 32],
    user: [u8; 32],
}

const AMM_SWAP_EVENT_LOG_SIZE: usize = 176;

pub struct InstructionParser {
    bc_program: [u8; 32],
    amm_program: [u8; 32],
}

impl Default for InstructionParser {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionParser {
    pub fn new() -> Self {
        Self {
            bc_program: decode_program_id(BONDING_CURVE_PROGRAM_ID),
            amm_program: decode_program_id(AMM_PROGRAM_ID),
        }
    }

    pub fn with_programs(bc_program: [u8; 32], amm_program: [u8; 32]) -> Self {
        Self {
            bc_program,
            amm_program,
        }
    }

    /// Decode every recognized instruction of one transaction
    pub fn parse(&self, tx: &RawTx) -> ParseOutcome {
        if tx.failed {
            return ParseOutcome {
                events: Vec::new(),
                verdict: SignatureVerdict::Unrelated,
            };
        }

        let logs = LogEvents::collect(&tx.logs);

        let mut events = Vec::new();
        let mut saw_known_program = false;
        let mut rejected = false;
        let mut best_confidence: Option<ParseConfidence> = None;

        let mut visit = |ix: &RawInstruction| {
            let Some(program_key) = tx.key_at(ix.program_id_index) else {
                return;
            };
            let program = if program_key.bytes == self.bc_program {
                Program::BondingCurve
            } else if program_key.bytes == self.amm_program {
                Program::AmmPool
            } else {
                return;
            };
            saw_known_program = true;

            match self.dispatch(tx, ix, program, &logs) {
                Dispatch::Event(event, confidence) => {
                    if let Some(confidence) = confidence {
                        best_confidence = Some(merge_confidence(best_confidence, confidence));
                    }
                    events.push(event);
                }
                Dispatch::Rejected => {
                    rejected = true;
                    metrics::PARSE_FAILED.inc();
                    debug!("🚫 parse_failed signature={}", tx.signature);
                }
                Dispatch::Skip => {}
            }
        };

        for (index, ix) in tx.instructions.iter().enumerate() {
            visit(ix);
            if let Some((_, inner)) = tx
                .inner_instructions
                .iter()
                .find(|(top_index, _)| *top_index == index)
            {
                for inner_ix in inner {
                    visit(inner_ix);
                }
            }
        }

        mark_canonical_trades(&mut events, tx);

        let verdict = if !saw_known_program {
            SignatureVerdict::Unrelated
        } else if let Some(confidence) = best_confidence {
            SignatureVerdict::Parsed(confidence)
        } else if rejected && events.is_empty() {
            SignatureVerdict::Rejected
        } else if !events.is_empty() {
            // Non-trade events (create, graduation, fees) parsed cleanly
            SignatureVerdict::Parsed(ParseConfidence::High)
        } else {
            // Known program but only unrecognized opcodes: nothing was
            // decoded, so this must not feed the parse-rate window
            SignatureVerdict::Unrelated
        };

        ParseOutcome { events, verdict }
    }

    /// Decode a bonding curve account update.
    ///
    /// Layout after the 8-byte account discriminator:
    /// virtual_token_reserves, virtual_sol_reserves, real_token_reserves,
    /// real_sol_reserves, token_total_supply (u64 LE each), complete (u8)
    pub fn parse_curve_account(&self, update: &RawAccountUpdate) -> Option<CurveAccountState> {
        if update.owner.bytes != self.bc_program {
            return None;
        }
        let data = update.data.as_ref();
        if data.len() < 49 || data[..8] != BC_CURVE_ACCOUNT {
            return None;
        }
        Some(CurveAccountState {
            curve: update.pubkey.base58.clone(),
            virtual_token_reserves: read_u64(data, 8)?,
            virtual_sol_reserves: read_u64(data, 16)?,
            real_token_reserves: read_u64(data, 24)?,
            real_sol_reserves: read_u64(data, 32)?,
            token_total_supply: read_u64(data, 40)?,
            complete: data[48] != 0,
        })
    }

    fn dispatch(
        &self,
        tx: &RawTx,
        ix: &RawInstruction,
        program: Program,
        logs: &LogEvents,
    ) -> Dispatch {
        let Some(discriminator) = ix.data.get(..8) else {
            return Dispatch::Skip;
        };
        let discriminator: [u8; 8] = discriminator.try_into().expect("8-byte slice");
        let args = &ix.data[8..];

        match program {
            Program::BondingCurve => match discriminator {
                BC_BUY_IX => self.parse_bc_trade(tx, ix, args, TradeSide::Buy, logs),
                BC_SELL_IX => self.parse_bc_trade(tx, ix, args, TradeSide::Sell, logs),
                BC_CREATE_IX => self.parse_bc_create(tx, ix, args),
                BC_WITHDRAW_IX => self.parse_bc_withdraw(tx, ix, logs),
                BC_SET_PARAMS_IX => self.parse_bc_set_params(tx, ix),
                other => {
                    debug!("❔ Unrecognized curve instruction {}", hex::encode(other));
                    Dispatch::Skip
                }
            },
            Program::AmmPool => match discriminator {
                AMM_BUY_IX => self.parse_amm_trade(tx, ix, args, TradeSide::Buy, logs),
                AMM_SELL_IX => self.parse_amm_trade(tx, ix, args, TradeSide::Sell, logs),
                AMM_DEPOSIT_IX => self.parse_amm_liquidity(tx, ix, args, LiquidityKind::Deposit),
                AMM_WITHDRAW_IX => self.parse_amm_liquidity(tx, ix, args, LiquidityKind::Withdraw),
                AMM_CREATE_POOL_IX => self.parse_amm_create_pool(tx, ix, args),
                AMM_COLLECT_CREATOR_FEE_IX => self.parse_amm_fee(tx, ix, FeeKind::Creator),
                AMM_COLLECT_PROTOCOL_FEE_IX => self.parse_amm_fee(tx, ix, FeeKind::Protocol),
                other => {
                    debug!("❔ Unrecognized pool instruction {}", hex::encode(other));
                    Dispatch::Skip
                }
            },
        }
    }

    /// Bonding curve buy/sell
    ///
    /// Account layout: [global, fee_recipient, mint, bonding_curve,
    /// associated_bonding_curve, associated_user, user, ...]
    fn parse_bc_trade(
        &self,
        tx: &RawTx,
        ix: &RawInstruction,
        args: &[u8],
        side: TradeSide,
        logs: &LogEvents,
    ) -> Dispatch {
        let Some(mint) = instruction_key(tx, ix, 2) else {
            return Dispatch::Rejected;
        };
        let Some(curve) = instruction_key(tx, ix, 3) else {
            return Dispatch::Rejected;
        };
        let user = instruction_signer(tx, ix, 6);

        // Args carry the token amount; the SOL leg is a cap/floor, so the
        // actual lamports come from the event log or the balance delta
        let args_token = read_u64(args, 0);

        let log_event = logs.bc_trade_for_mint(&mint);
        let (explicit_sol, explicit_token) = match &log_event {
            Some(event) => (Some(event.sol_amount), Some(event.token_amount)),
            None => (None, args_token),
        };

        let delta_sol = fee_payer_sol_delta(tx);
        let delta_token = user_token_delta(tx, &user, &mint);

        let Some((sol_amount, token_amount, confidence)) = resolve_amounts(
            &tx.signature,
            explicit_sol,
            explicit_token,
            delta_sol,
            delta_token,
        ) else {
            return Dispatch::Rejected;
        };

        let (sol_reserves, token_reserves) = match &log_event {
            Some(event) => (event.virtual_sol_reserves, event.virtual_token_reserves),
            None => (0, 0),
        };

        Dispatch::Event(
            DecodedEvent::Trade(TradeEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: block_time_or_log(tx, log_event.as_ref().map(|e| e.timestamp)),
                program: Program::BondingCurve,
                side,
                user,
                mint,
                curve: Some(curve),
                pool: None,
                sol_amount,
                token_amount,
                sol_reserves,
                token_reserves,
                confidence,
                is_canonical: true,
                price: None,
            }),
            Some(confidence),
        )
    }

    /// Token creation on the curve
    ///
    /// Account layout: [mint, mint_authority, bonding_curve,
    /// associated_bonding_curve, global, metadata_program, metadata,
    /// user, ...]
    fn parse_bc_create(&self, tx: &RawTx, ix: &RawInstruction, args: &[u8]) -> Dispatch {
        let Some(mint) = instruction_key(tx, ix, 0) else {
            return Dispatch::Rejected;
        };
        let Some(curve) = instruction_key(tx, ix, 2) else {
            return Dispatch::Rejected;
        };
        let creator = instruction_signer(tx, ix, 7);

        let (name, rest) = read_borsh_string(args);
        let (symbol, rest) = read_borsh_string(rest);
        let (uri, _) = read_borsh_string(rest);

        Dispatch::Event(
            DecodedEvent::Create(TokenCreateEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                mint,
                curve,
                creator,
                name,
                symbol,
                uri,
            }),
            None,
        )
    }

    /// Graduation withdraw. The full layout names the mint, but trimmed
    /// CPI variants only carry the curve; the mint is then resolved later
    /// from the curve map.
    ///
    /// Full layout: [global, last_withdraw, mint, bonding_curve, ...]
    /// Trimmed layout: [global, bonding_curve, ...]
    fn parse_bc_withdraw(&self, tx: &RawTx, ix: &RawInstruction, logs: &LogEvents) -> Dispatch {
        let (curve, mut mint) = if ix.accounts.len() >= 4 {
            let Some(curve) = instruction_key(tx, ix, 3) else {
                return Dispatch::Rejected;
            };
            (curve, instruction_key(tx, ix, 2))
        } else {
            let Some(curve) = instruction_key(tx, ix, 1) else {
                return Dispatch::Rejected;
            };
            (curve, None)
        };

        // A migration event in the same transaction settles the mint
        if mint.is_none() {
            mint = logs.migration_mint_for_curve(&curve);
        }

        Dispatch::Event(
            DecodedEvent::Graduation(GraduationEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                curve,
                mint,
            }),
            None,
        )
    }

    fn parse_bc_set_params(&self, tx: &RawTx, ix: &RawInstruction) -> Dispatch {
        let Some(curve) = instruction_key(tx, ix, 1).or_else(|| instruction_key(tx, ix, 0)) else {
            return Dispatch::Rejected;
        };
        Dispatch::Event(
            DecodedEvent::CurveParams(CurveParamsEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                curve,
            }),
            None,
        )
    }

    /// AMM buy/sell
    ///
    /// Account layout: [pool, user, global_config, base_mint, quote_mint,
    /// user_base_ata, user_quote_ata, pool_base_ata, pool_quote_ata, ...]
    fn parse_amm_trade(
        &self,
        tx: &RawTx,
        ix: &RawInstruction,
        args: &[u8],
        side: TradeSide,
        logs: &LogEvents,
    ) -> Dispatch {
        let Some(pool) = instruction_key(tx, ix, 0) else {
            return Dispatch::Rejected;
        };
        let Some(mint) = instruction_key(tx, ix, 3) else {
            return Dispatch::Rejected;
        };
        let user = instruction_signer(tx, ix, 1);

        let args_base = read_u64(args, 0);

        let log_event = logs.amm_swap_for_pool(&pool, side);
        let (explicit_sol, explicit_token) = match &log_event {
            Some(event) => (Some(event.quote_amount), Some(event.base_amount)),
            None => (None, args_base),
        };

        let delta_sol = fee_payer_sol_delta(tx);
        let delta_token = user_token_delta(tx, &user, &mint);

        let Some((sol_amount, token_amount, confidence)) = resolve_amounts(
            &tx.signature,
            explicit_sol,
            explicit_token,
            delta_sol,
            delta_token,
        ) else {
            return Dispatch::Rejected;
        };

        let (sol_reserves, token_reserves) = match &log_event {
            Some(event) => (
                event.pool_quote_token_reserves,
                event.pool_base_token_reserves,
            ),
            None => pool_reserves_from_balances(tx, &pool, &mint),
        };

        Dispatch::Event(
            DecodedEvent::Trade(TradeEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: block_time_or_log(tx, log_event.as_ref().map(|e| e.timestamp)),
                program: Program::AmmPool,
                side,
                user,
                mint,
                curve: None,
                pool: Some(pool),
                sol_amount,
                token_amount,
                sol_reserves,
                token_reserves,
                confidence,
                is_canonical: true,
                price: None,
            }),
            Some(confidence),
        )
    }

    /// Deposit/withdraw liquidity
    ///
    /// Account layout: [pool, global_config, user, base_mint, quote_mint,
    /// lp_mint, ...]
    fn parse_amm_liquidity(
        &self,
        tx: &RawTx,
        ix: &RawInstruction,
        args: &[u8],
        kind: LiquidityKind,
    ) -> Dispatch {
        let Some(pool) = instruction_key(tx, ix, 0) else {
            return Dispatch::Rejected;
        };
        let Some(base_mint) = instruction_key(tx, ix, 3) else {
            return Dispatch::Rejected;
        };
        let user = instruction_signer(tx, ix, 2);

        // args: lp_token_amount, max/min base, max/min quote
        let Some(lp_delta) = read_u64(args, 0) else {
            return Dispatch::Rejected;
        };
        let args_base = read_u64(args, 8);
        let args_quote = read_u64(args, 16);

        // Actual deltas from the user's token accounts beat the caps
        let base_delta = user_token_delta(tx, &user, &base_mint)
            .map(|d| d.unsigned_abs() as u64)
            .or(args_base);
        let quote_delta = user_token_delta_for_mint(tx, &user, WSOL_MINT)
            .map(|d| d.unsigned_abs() as u64)
            .or(args_quote);

        let (Some(base_delta), Some(quote_delta)) = (base_delta, quote_delta) else {
            return Dispatch::Rejected;
        };

        Dispatch::Event(
            DecodedEvent::Liquidity(LiquidityEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                pool,
                user,
                kind,
                lp_delta,
                base_delta,
                quote_delta,
                price: None,
            }),
            None,
        )
    }

    /// Pool creation
    ///
    /// Account layout: [pool, global_config, creator, base_mint,
    /// quote_mint, lp_mint, ...]
    fn parse_amm_create_pool(&self, tx: &RawTx, ix: &RawInstruction, args: &[u8]) -> Dispatch {
        let Some(pool) = instruction_key(tx, ix, 0) else {
            return Dispatch::Rejected;
        };
        let Some(base_mint) = instruction_key(tx, ix, 3) else {
            return Dispatch::Rejected;
        };
        let lp_mint = instruction_key(tx, ix, 5);
        let creator = instruction_signer(tx, ix, 2);

        // args: index (u16), base_amount_in, quote_amount_in
        let base_reserves = read_u64(args, 2).unwrap_or(0);
        let quote_reserves = read_u64(args, 10).unwrap_or(0);

        Dispatch::Event(
            DecodedEvent::PoolCreated(PoolCreatedEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                pool,
                base_mint,
                lp_mint,
                creator,
                base_reserves,
                quote_reserves,
            }),
            None,
        )
    }

    /// Fee collection: amounts reconstructed from the recipient's token
    /// account deltas
    ///
    /// Account layout: [pool, recipient, ...]
    fn parse_amm_fee(&self, tx: &RawTx, ix: &RawInstruction, kind: FeeKind) -> Dispatch {
        let Some(pool) = instruction_key(tx, ix, 0) else {
            return Dispatch::Rejected;
        };
        let Some(recipient) = instruction_key(tx, ix, 1) else {
            return Dispatch::Rejected;
        };

        let quote_amount = user_token_delta_for_mint(tx, &recipient, WSOL_MINT)
            .map(|d| d.unsigned_abs() as u64)
            .unwrap_or(0);
        let base_amount = tx
            .post_token_balances
            .iter()
            .filter(|b| b.owner.as_deref() == Some(recipient.as_str()) && b.mint != WSOL_MINT)
            .filter_map(|post| {
                let pre = tx
                    .pre_token_balances
                    .iter()
                    .find(|p| p.account_index == post.account_index)
                    .map(|p| p.amount)
                    .unwrap_or(0);
                post.amount.checked_sub(pre)
            })
            .sum();

        Dispatch::Event(
            DecodedEvent::Fee(FeeEvent {
                signature: tx.signature.clone(),
                slot: tx.slot,
                block_time: tx.block_time,
                pool,
                kind,
                base_amount,
                quote_amount,
                recipient,
            }),
            None,
        )
    }
}

/// Bonding curve account snapshot decoded from an account update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurveAccountState {
    pub curve: String,
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
}

enum Dispatch {
    Event(DecodedEvent, Option<ParseConfidence>),
    Rejected,
    Skip,
}

/// Anchor events decoded once per transaction from `Program data:` logs
struct LogEvents {
    bc_trades: Vec<BcTradeEventLog>,
    migrations: Vec<BcMigrationEventLog>,
    amm_buys: Vec<AmmSwapEventLog>,
    amm_sells: Vec<AmmSwapEventLog>,
}

impl LogEvents {
    fn collect(logs: &[String]) -> Self {
        let mut out = Self {
            bc_trades: Vec::new(),
            migrations: Vec::new(),
            amm_buys: Vec::new(),
            amm_sells: Vec::new(),
        };

        for line in logs {
            let Some(encoded) = line.strip_prefix("Program data: ") else {
                continue;
            };
            let Ok(data) = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                encoded.trim(),
            ) else {
                continue;
            };
            if data.len() < 16 || data[..8] != ANCHOR_EVENT_PREFIX {
                continue;
            }
            let event_disc: [u8; 8] = data[8..16].try_into().expect("8-byte slice");
            let payload = &data[16..];

            match event_disc {
                BC_TRADE_EVENT => {
                    if payload.len() >= BC_TRADE_EVENT_LOG_SIZE {
                        if let Ok(event) =
                            BcTradeEventLog::try_from_slice(&payload[..BC_TRADE_EVENT_LOG_SIZE])
                        {
                            out.bc_trades.push(event);
                        }
                    }
                }
                BC_MIGRATION_EVENT => {
                    if payload.len() >= BC_MIGRATION_EVENT_LOG_SIZE {
                        if let Ok(event) = BcMigrationEventLog::try_from_slice(
                            &payload[..BC_MIGRATION_EVENT_LOG_SIZE],
                        ) {
                            out.migrations.push(event);
                        }
                    }
                }
                AMM_BUY_EVENT | AMM_SELL_EVENT => {
                    if payload.len() >= AMM_SWAP_EVENT_LOG_SIZE {
                        if let Ok(event) =
                            AmmSwapEventLog::try_from_slice(&payload[..AMM_SWAP_EVENT_LOG_SIZE])
                        {
                            if event_disc == AMM_BUY_EVENT {
                                out.amm_buys.push(event);
                            } else {
                                out.amm_sells.push(event);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        out
    }

    fn bc_trade_for_mint(&self, mint: &str) -> Option<&BcTradeEventLog> {
        self.bc_trades
            .iter()
            .find(|e| bs58::encode(e.mint).into_string() == mint)
    }

    fn migration_mint_for_curve(&self, curve: &str) -> Option<String> {
        self.migrations
            .iter()
            .find(|e| bs58::encode(e.bonding_curve).into_string() == curve)
            .map(|e| bs58::encode(e.mint).into_string())
    }

    fn amm_swap_for_pool(&self, pool: &str, side: TradeSide) -> Option<&AmmSwapEventLog> {
        let source = match side {
            TradeSide::Buy => &self.amm_buys,
            TradeSide::Sell => &self.amm_sells,
        };
        source
            .iter()
            .find(|e| bs58::encode(e.pool).into_string() == pool)
    }
}

/// Resolve final amounts and confidence from the explicit and delta
/// strategies. `None` when neither strategy produced both legs.
fn resolve_amounts(
    signature: &str,
    explicit_sol: Option<u64>,
    explicit_token: Option<u64>,
    delta_sol: Option<i128>,
    delta_token: Option<i128>,
) -> Option<(u64, u64, ParseConfidence)> {
    let delta_sol_abs = delta_sol.map(|d| d.unsigned_abs() as u64);
    let delta_token_abs = delta_token.map(|d| d.unsigned_abs() as u64);

    let sol_amount = explicit_sol.or(delta_sol_abs)?;
    let token_amount = explicit_token.or(delta_token_abs)?;

    let explicit_present = explicit_sol.is_some() || explicit_token.is_some();
    let delta_present = delta_sol_abs.is_some() && delta_token_abs.is_some();

    let confidence = if explicit_present && delta_present {
        // Explicit wins; the delta reading is a cross-check only
        if let (Some(explicit), Some(delta)) = (explicit_sol, delta_sol_abs) {
            if relative_mismatch(explicit, delta) > AMOUNT_CROSSCHECK_TOLERANCE {
                warn!(
                    "⚖️ Amount cross-check mismatch on {}: args={} delta={}",
                    signature, explicit, delta
                );
            }
        }
        ParseConfidence::High
    } else {
        ParseConfidence::Medium
    };

    Some((sol_amount, token_amount, confidence))
}

fn relative_mismatch(a: u64, b: u64) -> f64 {
    let max = a.max(b);
    if max == 0 {
        return 0.0;
    }
    (a as f64 - b as f64).abs() / max as f64
}

fn merge_confidence(
    current: Option<ParseConfidence>,
    next: ParseConfidence,
) -> ParseConfidence {
    match (current, next) {
        (Some(ParseConfidence::High), _) | (_, ParseConfidence::High) => ParseConfidence::High,
        _ => ParseConfidence::Medium,
    }
}

/// Among multiple trades sharing a signature, the fee payer's trade is
/// canonical; the rest become secondary analytics events.
fn mark_canonical_trades(events: &mut [DecodedEvent], tx: &RawTx) {
    let trade_count = events
        .iter()
        .filter(|e| matches!(e, DecodedEvent::Trade(_)))
        .count();
    if trade_count <= 1 {
        return;
    }

    let fee_payer = tx.fee_payer().map(|k| k.base58.clone()).unwrap_or_default();
    let mut canonical_chosen = false;
    for event in events.iter_mut() {
        if let DecodedEvent::Trade(trade) = event {
            if !canonical_chosen && trade.user == fee_payer {
                trade.is_canonical = true;
                canonical_chosen = true;
            } else {
                trade.is_canonical = false;
            }
        }
    }
    // No trade matched the fee payer: keep the first as canonical
    if !canonical_chosen {
        for event in events.iter_mut() {
            if let DecodedEvent::Trade(trade) = event {
                trade.is_canonical = true;
                break;
            }
        }
    }
}

fn decode_program_id(base58: &str) -> [u8; 32] {
    bs58::decode(base58)
        .into_vec()
        .ok()
        .and_then(|v| v.try_into().ok())
        .expect("valid program id constant")
}

/// Resolve the key behind an instruction account slot
fn instruction_key(tx: &RawTx, ix: &RawInstruction, slot: usize) -> Option<String> {
    let index = *ix.accounts.get(slot)? as usize;
    tx.key_at(index).map(|k| k.base58.clone())
}

/// The declared user slot if it signs, otherwise the fee payer
fn instruction_signer(tx: &RawTx, ix: &RawInstruction, slot: usize) -> String {
    if let Some(&index) = ix.accounts.get(slot) {
        if (index as usize) < tx.num_signers {
            if let Some(key) = tx.key_at(index as usize) {
                return key.base58.clone();
            }
        }
    }
    tx.fee_payer().map(|k| k.base58.clone()).unwrap_or_default()
}

/// SOL moved by the fee payer (post - pre, lamports)
fn fee_payer_sol_delta(tx: &RawTx) -> Option<i128> {
    let pre = *tx.pre_balances.first()? as i128;
    let post = *tx.post_balances.first()? as i128;
    Some(post - pre)
}

/// Token delta across the user's accounts for one mint
fn user_token_delta(tx: &RawTx, user: &str, mint: &str) -> Option<i128> {
    user_token_delta_for_mint(tx, user, mint)
}

fn user_token_delta_for_mint(tx: &RawTx, owner: &str, mint: &str) -> Option<i128> {
    let mut found = false;
    let mut delta: i128 = 0;

    for post in tx
        .post_token_balances
        .iter()
        .filter(|b| b.mint == mint && b.owner.as_deref() == Some(owner))
    {
        found = true;
        let pre = tx
            .pre_token_balances
            .iter()
            .find(|p| p.account_index == post.account_index)
            .map(|p| p.amount)
            .unwrap_or(0);
        delta += post.amount as i128 - pre as i128;
    }
    // Account emptied and dropped from post balances
    for pre in tx
        .pre_token_balances
        .iter()
        .filter(|b| b.mint == mint && b.owner.as_deref() == Some(owner))
    {
        if !tx
            .post_token_balances
            .iter()
            .any(|p| p.account_index == pre.account_index)
        {
            found = true;
            delta -= pre.amount as i128;
        }
    }

    found.then_some(delta)
}

/// Pool reserves from the pool's own token account snapshots
fn pool_reserves_from_balances(tx: &RawTx, pool: &str, base_mint: &str) -> (u64, u64) {
    let mut quote = 0u64;
    let mut base = 0u64;
    for balance in tx
        .post_token_balances
        .iter()
        .filter(|b| b.owner.as_deref() == Some(pool))
    {
        if balance.mint == WSOL_MINT {
            quote = balance.amount;
        } else if balance.mint == base_mint {
            base = balance.amount;
        }
    }
    (quote, base)
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes: [u8; 8] = data.get(offset..offset + 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(bytes))
}

/// Borsh string: u32 length prefix + utf8 bytes. Returns the remainder.
fn read_borsh_string(data: &[u8]) -> (Option<String>, &[u8]) {
    let Some(len_bytes) = data.get(..4) else {
        return (None, data);
    };
    let len = u32::from_le_bytes(len_bytes.try_into().expect("4-byte slice")) as usize;
    let Some(raw) = data.get(4..4 + len) else {
        return (None, data);
    };
    match std::str::from_utf8(raw) {
        Ok(s) => (Some(s.to_string()), &data[4 + len..]),
        Err(_) => (None, &data[4 + len..]),
    }
}

fn block_time_or_log(tx: &RawTx, log_timestamp: Option<i64>) -> DateTime<Utc> {
    match log_timestamp {
        Some(secs) if secs > 0 => crate::blocktime::normalize_block_time(secs),
        _ => tx.block_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_decoder::{AccountKey, RawTokenBalance};
    use base64::Engine;
    use bytes::Bytes;

    fn key(byte: u8) -> AccountKey {
        AccountKey::from_bytes(&[byte; 32]).unwrap()
    }

    fn bc_program_key() -> AccountKey {
        AccountKey::from_base58(BONDING_CURVE_PROGRAM_ID).unwrap()
    }

    /// Keys: 0 = fee payer/user, 1 = global, 2 = fee recipient, 3 = mint,
    /// 4 = curve, 5 = ata curve, 6 = ata user, 7 = program
    fn bc_buy_tx(with_log: bool, with_balances: bool) -> RawTx {
        let keys = vec![
            key(1),
            key(2),
            key(3),
            key(4),
            key(5),
            key(6),
            key(7),
            bc_program_key(),
        ];

        let mut data = BC_BUY_IX.to_vec();
        data.extend_from_slice(&5_000_000_000u64.to_le_bytes()); // token amount
        data.extend_from_slice(&1_100_000_000u64.to_le_bytes()); // max sol cost

        let instruction = RawInstruction {
            program_id_index: 7,
            // [global, fee_recipient, mint, curve, ata_curve, ata_user, user]
            accounts: vec![1, 2, 3, 4, 5, 6, 0],
            data: Bytes::from(data),
        };

        let logs = if with_log {
            let mut payload = Vec::new();
            payload.extend_from_slice(&ANCHOR_EVENT_PREFIX);
            payload.extend_from_slice(&BC_TRADE_EVENT);
            payload.extend_from_slice(&[4u8; 32]); // mint (key 4 bytes)
            payload.extend_from_slice(&1_000_000_000u64.to_le_bytes()); // sol
            payload.extend_from_slice(&5_000_000_000u64.to_le_bytes()); // tokens
            payload.push(1); // is_buy
            payload.extend_from_slice(&[1u8; 32]); // user
            payload.extend_from_slice(&1_700_000_000i64.to_le_bytes());
            payload.extend_from_slice(&30_000_000_000u64.to_le_bytes()); // v sol
            payload.extend_from_slice(&150_000_000_000_000u64.to_le_bytes()); // v tok
            payload.extend_from_slice(&28_000_000_000u64.to_le_bytes());
            payload.extend_from_slice(&120_000_000_000_000u64.to_le_bytes());
            vec![format!(
                "Program data: {}",
                base64::engine::general_purpose::STANDARD.encode(&payload)
            )]
        } else {
            Vec::new()
        };

        let (pre_balances, post_balances, pre_tok, post_tok) = if with_balances {
            (
                vec![10_000_000_000u64],
                vec![8_995_000_000u64],
                vec![RawTokenBalance {
                    account_index: 6,
                    mint: key(4).base58,
                    owner: Some(key(1).base58),
                    amount: 0,
                    decimals: 6,
                }],
                vec![RawTokenBalance {
                    account_index: 6,
                    mint: key(4).base58,
                    owner: Some(key(1).base58),
                    amount: 5_000_000_000,
                    decimals: 6,
                }],
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new(), Vec::new())
        };

        RawTx {
            signature: "testsig".to_string(),
            slot: 1000,
            block_time: Utc::now(),
            account_keys: keys,
            num_signers: 1,
            instructions: vec![instruction],
            inner_instructions: Vec::new(),
            logs,
            pre_balances,
            post_balances,
            pre_token_balances: pre_tok,
            post_token_balances: post_tok,
            failed: false,
        }
    }

    #[test]
    fn test_bc_buy_with_log_and_deltas_is_high_confidence() {
        let parser = InstructionParser::new();
        let outcome = parser.parse(&bc_buy_tx(true, true));

        assert_eq!(outcome.verdict, SignatureVerdict::Parsed(ParseConfidence::High));
        assert_eq!(outcome.events.len(), 1);
        let DecodedEvent::Trade(trade) = &outcome.events[0] else {
            panic!("expected trade");
        };
        assert_eq!(trade.program, Program::BondingCurve);
        assert_eq!(trade.side, TradeSide::Buy);
        assert_eq!(trade.sol_amount, 1_000_000_000);
        assert_eq!(trade.token_amount, 5_000_000_000);
        assert_eq!(trade.sol_reserves, 30_000_000_000);
        assert_eq!(trade.token_reserves, 150_000_000_000_000);
        assert_eq!(trade.mint, key(4).base58);
        assert_eq!(trade.curve.as_deref(), Some(key(5).base58.as_str()));
        assert!(trade.is_canonical);
    }

    #[test]
    fn test_bc_buy_log_only_is_medium_confidence() {
        let parser = InstructionParser::new();
        let outcome = parser.parse(&bc_buy_tx(true, false));

        // Log event but no balance deltas to cross-check against
        assert_eq!(
            outcome.verdict,
            SignatureVerdict::Parsed(ParseConfidence::Medium)
        );
        let DecodedEvent::Trade(trade) = &outcome.events[0] else {
            panic!("expected trade");
        };
        assert_eq!(trade.sol_amount, 1_000_000_000);
        assert_eq!(trade.token_amount, 5_000_000_000);
        assert_eq!(trade.sol_reserves, 30_000_000_000);
    }

    #[test]
    fn test_bc_buy_args_and_deltas_agree_is_high_confidence() {
        let parser = InstructionParser::new();
        let outcome = parser.parse(&bc_buy_tx(false, true));

        // No log event: token amount from args agrees with the token
        // delta, sol reconstructed from the fee payer balance delta
        assert_eq!(outcome.verdict, SignatureVerdict::Parsed(ParseConfidence::High));
        let DecodedEvent::Trade(trade) = &outcome.events[0] else {
            panic!("expected trade");
        };
        assert_eq!(trade.token_amount, 5_000_000_000);
        assert_eq!(trade.sol_amount, 1_005_000_000); // fee payer delta
        assert_eq!(trade.sol_reserves, 0); // no reserve observation
    }

    #[test]
    fn test_unrelated_transaction() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(false, false);
        tx.account_keys[7] = key(9); // not a known program
        let outcome = parser.parse(&tx);
        assert_eq!(outcome.verdict, SignatureVerdict::Unrelated);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_unrecognized_opcode_on_known_program_is_unrelated() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(false, true);
        // Known program, unknown discriminator: nothing decodes, and the
        // verdict must not count as a healthy parse
        let mut data = vec![0xde, 0xad, 0xbe, 0xef, 0x00, 0x11, 0x22, 0x33];
        data.extend_from_slice(&[0u8; 16]);
        tx.instructions[0].data = Bytes::from(data);

        let before = metrics::PARSE_FAILED.get();
        let outcome = parser.parse(&tx);
        assert_eq!(outcome.verdict, SignatureVerdict::Unrelated);
        assert!(outcome.events.is_empty());
        assert_eq!(metrics::PARSE_FAILED.get(), before);
    }

    #[test]
    fn test_failed_transaction_is_skipped() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(true, true);
        tx.failed = true;
        let outcome = parser.parse(&tx);
        assert!(outcome.events.is_empty());
    }

    #[test]
    fn test_withdraw_with_trimmed_accounts_has_no_mint() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(false, false);
        let mut data = BC_WITHDRAW_IX.to_vec();
        data.extend_from_slice(&[0u8; 8]);
        tx.instructions = vec![RawInstruction {
            program_id_index: 7,
            accounts: vec![1, 4], // [global, curve] only
            data: Bytes::from(data),
        }];

        let outcome = parser.parse(&tx);
        assert_eq!(outcome.events.len(), 1);
        let DecodedEvent::Graduation(grad) = &outcome.events[0] else {
            panic!("expected graduation");
        };
        assert_eq!(grad.curve, key(5).base58);
        assert!(grad.mint.is_none());
    }

    #[test]
    fn test_create_parses_metadata_strings() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(false, false);

        let mut data = BC_CREATE_IX.to_vec();
        for s in ["Test Token", "TEST", "https://meta.example/t.json"] {
            data.extend_from_slice(&(s.len() as u32).to_le_bytes());
            data.extend_from_slice(s.as_bytes());
        }
        tx.instructions = vec![RawInstruction {
            program_id_index: 7,
            // [mint, authority, curve, ata, global, mpl, metadata, user]
            accounts: vec![3, 1, 4, 5, 1, 1, 1, 0],
            data: Bytes::from(data),
        }];

        let outcome = parser.parse(&tx);
        let DecodedEvent::Create(create) = &outcome.events[0] else {
            panic!("expected create");
        };
        assert_eq!(create.mint, key(4).base58);
        assert_eq!(create.curve, key(5).base58);
        assert_eq!(create.name.as_deref(), Some("Test Token"));
        assert_eq!(create.symbol.as_deref(), Some("TEST"));
    }

    #[test]
    fn test_secondary_trades_share_signature() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(true, true);
        // Same instruction twice: only one canonical trade must remain
        let ix = tx.instructions[0].clone();
        tx.instructions.push(ix);

        let outcome = parser.parse(&tx);
        let canonical = outcome
            .events
            .iter()
            .filter(|e| matches!(e, DecodedEvent::Trade(t) if t.is_canonical))
            .count();
        assert_eq!(canonical, 1);
        assert_eq!(outcome.events.len(), 2);
    }

    #[test]
    fn test_curve_account_complete_flag() {
        let parser = InstructionParser::new();
        let mut data = Vec::new();
        data.extend_from_slice(&BC_CURVE_ACCOUNT);
        data.extend_from_slice(&100_000_000_000_000u64.to_le_bytes());
        data.extend_from_slice(&85_000_000_000u64.to_le_bytes());
        data.extend_from_slice(&0u64.to_le_bytes());
        data.extend_from_slice(&79_000_000_000u64.to_le_bytes());
        data.extend_from_slice(&1_000_000_000_000_000u64.to_le_bytes());
        data.push(1); // complete

        let update = crate::wire_decoder::RawAccountUpdate {
            pubkey: key(9),
            owner: bc_program_key(),
            lamports: 1,
            data: Bytes::from(data),
            slot: 2000,
        };
        let state = parser.parse_curve_account(&update).unwrap();
        assert!(state.complete);
        assert_eq!(state.virtual_sol_reserves, 85_000_000_000);
        assert_eq!(state.curve, key(9).base58);

        // Wrong owner is not a curve account
        let mut foreign = update.clone();
        foreign.owner = key(8);
        assert!(parser.parse_curve_account(&foreign).is_none());
    }

    #[test]
    fn test_rejected_when_no_amount_source() {
        let parser = InstructionParser::new();
        let mut tx = bc_buy_tx(false, false);
        // Strip args so neither args, logs nor balances yield amounts
        tx.instructions[0].data = Bytes::from(BC_BUY_IX.to_vec());
        let outcome = parser.parse(&tx);
        assert_eq!(outcome.verdict, SignatureVerdict::Rejected);
    }
}
