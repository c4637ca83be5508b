/// Global constants for the token lifecycle indexer
///
/// This module centralizes program IDs, instruction discriminators and
/// tuning defaults so the decode path never carries inline magic numbers.
use std::time::Duration;

// ============================================================================
// SOLANA BLOCKCHAIN CONSTANTS
// ============================================================================

/// 1 SOL = 1 billion lamports
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Convert lamports to SOL (floating point, display only)
pub const fn lamports_to_sol(lamports: u64) -> f64 {
    lamports as f64 / LAMPORTS_PER_SOL as f64
}

/// Solana block time (approximately 400ms per slot)
pub const SOLANA_SLOT_TIME_MS: u64 = 400;

/// Wrapped SOL mint
pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

// ============================================================================
// PROGRAM IDS
// ============================================================================

/// Bonding curve (primary market) program ID
pub const BONDING_CURVE_PROGRAM_ID: &str = "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P";

/// AMM (secondary market) program ID
pub const AMM_PROGRAM_ID: &str = "pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA";

// ============================================================================
// INSTRUCTION DISCRIMINATORS (8-byte anchor prefixes)
// ============================================================================

/// Bonding curve program instructions
pub const BC_BUY_IX: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
pub const BC_SELL_IX: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];
pub const BC_CREATE_IX: [u8; 8] = [24, 30, 200, 40, 5, 28, 7, 119];
pub const BC_SET_PARAMS_IX: [u8; 8] = [27, 234, 178, 52, 147, 2, 187, 141];
/// Graduation withdraw (curve drained into the AMM)
pub const BC_WITHDRAW_IX: [u8; 8] = [183, 18, 70, 156, 148, 109, 161, 34];

/// AMM program instructions (anchor hashes share the `buy`/`sell` names)
pub const AMM_BUY_IX: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
pub const AMM_SELL_IX: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];
pub const AMM_DEPOSIT_IX: [u8; 8] = [242, 35, 198, 137, 82, 225, 242, 182];
pub const AMM_WITHDRAW_IX: [u8; 8] = [183, 18, 70, 156, 148, 109, 161, 34];
pub const AMM_CREATE_POOL_IX: [u8; 8] = [233, 146, 209, 142, 207, 104, 64, 188];
pub const AMM_COLLECT_CREATOR_FEE_IX: [u8; 8] = [160, 57, 89, 42, 181, 139, 43, 66];
pub const AMM_COLLECT_PROTOCOL_FEE_IX: [u8; 8] = [136, 136, 252, 221, 194, 66, 126, 89];

// ============================================================================
// LOG-EMITTED EVENT DISCRIMINATORS
// ============================================================================

/// Anchor event prefix shared by every `Program data:` log payload
pub const ANCHOR_EVENT_PREFIX: [u8; 8] = [228, 69, 165, 46, 81, 203, 154, 29];

/// Bonding curve trade event (suffix after the anchor prefix)
pub const BC_TRADE_EVENT: [u8; 8] = [189, 219, 127, 211, 78, 230, 97, 238];

/// Migration-complete event emitted when the curve hands over to the AMM
pub const BC_MIGRATION_EVENT: [u8; 8] = [189, 233, 93, 185, 92, 148, 234, 148];

/// Bonding curve account discriminator (account data prefix)
pub const BC_CURVE_ACCOUNT: [u8; 8] = [23, 183, 248, 55, 96, 216, 172, 96];

/// AMM swap events (suffix after the anchor prefix)
pub const AMM_BUY_EVENT: [u8; 8] = [103, 244, 82, 31, 44, 245, 119, 119];
pub const AMM_SELL_EVENT: [u8; 8] = [62, 47, 55, 10, 165, 3, 220, 42];

// ============================================================================
// BONDING CURVE CONSTANTS
// ============================================================================

/// Token base-unit decimals on the bonding curve (all curve mints use 6)
pub const BC_TOKEN_DECIMALS: u8 = 6;

/// Default total supply used for market cap when mint metadata is unknown
pub const DEFAULT_TOTAL_SUPPLY_TOKENS: u64 = 1_000_000_000;

/// Minimum virtual reserves for a curve to be considered live
pub const MINIMUM_VIRTUAL_RESERVES: u64 = 1_000_000;

// ============================================================================
// PIPELINE THRESHOLDS & WINDOWS
// ============================================================================

/// Market cap save threshold (USD) for bonding-curve trades
pub const DEFAULT_BC_SAVE_THRESHOLD_USD: f64 = 8_888.0;

/// Market cap save threshold (USD) for AMM trades
pub const DEFAULT_AMM_SAVE_THRESHOLD_USD: f64 = 8_888.0;

/// Explicit-args vs balance-delta mismatch tolerance before a warning
pub const AMOUNT_CROSSCHECK_TOLERANCE: f64 = 0.005;

/// Signature dedup window (entries)
pub const SIGNATURE_DEDUP_CAPACITY: usize = 65_536;

/// Abandonment: mint older than this with too few trades is closed out
pub const DEFAULT_ABANDONMENT_WINDOW_MS: u64 = 48 * 60 * 60 * 1000;
pub const DEFAULT_ABANDONMENT_MIN_TRADES: u64 = 3;

/// Parked graduations older than this are surfaced in the logs
pub const GRADUATION_RESOLUTION_WINDOW_MS: u64 = 10 * 60 * 1000;

// ============================================================================
// EVENT ROUTER
// ============================================================================

/// Bounded router queue capacity
pub const ROUTER_QUEUE_CAPACITY: usize = 8_192;

/// Drain batch size before a cooperative yield
pub const ROUTER_DRAIN_BATCH: usize = 100;

// ============================================================================
// DURABILITY LAYER
// ============================================================================

/// Max rows per statement batch
pub const DB_BATCH_MAX_ROWS: usize = 100;

/// Max interval between flushes
pub const DB_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded durability queue capacity
pub const DB_QUEUE_CAPACITY: usize = 16_384;

/// Producers yield when the durability queue passes this fill fraction
pub const DB_QUEUE_BACKPRESSURE_FRACTION: f64 = 0.8;

/// In-memory cache ceilings for the maintenance pruner
pub const MINT_CACHE_CEILING: usize = 100_000;
pub const POOL_CACHE_CEILING: usize = 50_000;

// ============================================================================
// STREAM SESSION
// ============================================================================

/// Parse-rate window length (frames) for the Degraded transition
pub const PARSE_RATE_WINDOW: usize = 200;

/// Parse-rate floor under which a Healthy connection degrades
pub const PARSE_RATE_FLOOR: f64 = 0.5;

/// Circuit breaker failure threshold
pub const CIRCUIT_BREAKER_THRESHOLD: u32 = 5;

/// Circuit breaker recovery timeout
pub const CIRCUIT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Half-open probe successes required to close the circuit
pub const HALF_OPEN_PROBE_SUCCESSES: u32 = 3;

/// Base reconnect backoff delay
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Reconnect backoff cap
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Maximum restart attempts before the process exits with code 2
pub const MAX_STREAM_RESTART_ATTEMPTS: u32 = 10;

// ============================================================================
// RECOVERY SUBSYSTEM
// ============================================================================

/// Default checkpoint interval
pub const DEFAULT_CHECKPOINT_INTERVAL_MS: u64 = 30_000;

/// Replay range cap (slots) to bound catch-up time
pub const DEFAULT_MAX_REPLAY_SLOTS: u64 = 10_000;

/// Runtime gap detection: no trades for this long opens a replay request
pub const DEFAULT_MIN_GAP_DURATION: Duration = Duration::from_secs(120);

// ============================================================================
// SOL/USD PRICE FEED
// ============================================================================

/// Poll interval for the SOL/USD quote
pub const SOL_PRICE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Token-bucket rate limit (requests per minute)
pub const SOL_PRICE_RATE_LIMIT_PER_MIN: u32 = 30;

/// Backoff cap on 429 responses
pub const SOL_PRICE_MAX_BACKOFF: Duration = Duration::from_secs(60);

// ============================================================================
// METADATA ENRICHMENT
// ============================================================================

/// Mints per enrichment batch
pub const METADATA_BATCH_SIZE: usize = 50;

/// Enrichment query timeout
pub const METADATA_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// RETRY & BACKOFF
// ============================================================================

/// Maximum retry attempts for transient store failures
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff (milliseconds)
pub const BASE_RETRY_DELAY_MS: u64 = 100;

/// Maximum retry delay (milliseconds)
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Jitter factor for retry delays
pub const RETRY_JITTER_FACTOR: f64 = 0.1;

// ============================================================================
// GATEWAY
// ============================================================================

/// WebSocket gateway port
pub const GATEWAY_DEFAULT_PORT: u16 = 8090;

/// Per-client outbound broadcast buffer
pub const GATEWAY_CLIENT_BUFFER: usize = 1_024;

// ============================================================================
// TIMESTAMP BOUNDS
// ============================================================================

/// Upper clamp for block times (2100-01-01T00:00:00Z)
pub const MAX_BLOCK_TIME_SECS: i64 = 4_102_444_800;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lamports_conversion() {
        assert_eq!(lamports_to_sol(LAMPORTS_PER_SOL), 1.0);
        assert_eq!(lamports_to_sol(500_000_000), 0.5);
    }

    #[test]
    fn test_discriminators_are_distinct_per_program() {
        // buy/sell share anchor hashes across programs, but within one
        // program every dispatch key must be unique
        let bc = [BC_BUY_IX, BC_SELL_IX, BC_CREATE_IX, BC_SET_PARAMS_IX, BC_WITHDRAW_IX];
        for i in 0..bc.len() {
            for j in (i + 1)..bc.len() {
                assert_ne!(bc[i], bc[j]);
            }
        }
        let amm = [
            AMM_BUY_IX,
            AMM_SELL_IX,
            AMM_DEPOSIT_IX,
            AMM_WITHDRAW_IX,
            AMM_CREATE_POOL_IX,
            AMM_COLLECT_CREATOR_FEE_IX,
            AMM_COLLECT_PROTOCOL_FEE_IX,
        ];
        for i in 0..amm.len() {
            for j in (i + 1)..amm.len() {
                assert_ne!(amm[i], amm[j]);
            }
        }
    }
}
