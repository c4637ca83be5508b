use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

use crate::constants;

/// How pricing sources behave after a token graduates to the AMM.
///
/// The crossing/graduation relationship is policy, not behavior baked into
/// the pipeline: operators choose whether graduated tokens switch to
/// AMM-reserve pricing or keep whatever source priced them last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostGraduationPriceSource {
    AmmReserves,
    Unchanged,
}

/// Runtime configuration assembled once at startup and passed down
/// explicitly. No module reads the environment after this point.
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub database_url: String,
    pub stream_endpoint: String,
    pub stream_token: Option<String>,
    pub rpc_endpoint: String,
    pub sol_price_url: String,
    pub metadata_primary_url: String,
    pub metadata_fallback_url: String,
    pub gateway_port: u16,
    pub bc_save_threshold_usd: f64,
    pub amm_save_threshold_usd: f64,
    pub checkpoint_interval: Duration,
    pub checkpoint_path: String,
    pub max_replay_slots: u64,
    pub min_gap_duration: Duration,
    pub abandonment_window: Duration,
    pub abandonment_min_trades: u64,
    pub default_total_supply: u64,
    pub post_graduation_price_source: PostGraduationPriceSource,
}

impl IndexerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url =
            env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;

        let stream_endpoint =
            env::var("STREAM_ENDPOINT").context("STREAM_ENDPOINT environment variable required")?;

        let stream_token = env::var("STREAM_TOKEN").ok().filter(|t| !t.is_empty());

        let rpc_endpoint = env::var("SOLANA_RPC_ENDPOINT")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());

        let sol_price_url = env::var("SOL_PRICE_URL")
            .unwrap_or_else(|_| "https://price.jup.ag/v6/price?ids=SOL".to_string());

        let metadata_primary_url = env::var("METADATA_PRIMARY_URL")
            .unwrap_or_else(|_| "https://graphql.example-metadata.io/v1".to_string());

        let metadata_fallback_url = env::var("METADATA_FALLBACK_URL")
            .unwrap_or_else(|_| "https://rest.example-metadata.io/tokens".to_string());

        let gateway_port = parse_env("GATEWAY_PORT", constants::GATEWAY_DEFAULT_PORT)?;

        let bc_save_threshold_usd =
            parse_env("BC_SAVE_THRESHOLD", constants::DEFAULT_BC_SAVE_THRESHOLD_USD)?;
        let amm_save_threshold_usd =
            parse_env("AMM_SAVE_THRESHOLD", constants::DEFAULT_AMM_SAVE_THRESHOLD_USD)?;

        let checkpoint_interval = Duration::from_millis(parse_env(
            "CHECKPOINT_INTERVAL_MS",
            constants::DEFAULT_CHECKPOINT_INTERVAL_MS,
        )?);
        let checkpoint_path =
            env::var("CHECKPOINT_PATH").unwrap_or_else(|_| "data/checkpoints.bin".to_string());

        let max_replay_slots =
            parse_env("MAX_REPLAY_SLOTS", constants::DEFAULT_MAX_REPLAY_SLOTS)?;

        let min_gap_duration = Duration::from_millis(parse_env(
            "MIN_GAP_DURATION_MS",
            constants::DEFAULT_MIN_GAP_DURATION.as_millis() as u64,
        )?);

        let abandonment_window = Duration::from_millis(parse_env(
            "ABANDONMENT_WINDOW_MS",
            constants::DEFAULT_ABANDONMENT_WINDOW_MS,
        )?);
        let abandonment_min_trades = parse_env(
            "ABANDONMENT_MIN_TRADES",
            constants::DEFAULT_ABANDONMENT_MIN_TRADES,
        )?;

        let default_total_supply = parse_env(
            "DEFAULT_TOTAL_SUPPLY",
            constants::DEFAULT_TOTAL_SUPPLY_TOKENS,
        )?;

        let post_graduation_price_source =
            match env::var("POST_GRADUATION_PRICE_SOURCE").as_deref() {
                Ok("unchanged") => PostGraduationPriceSource::Unchanged,
                _ => PostGraduationPriceSource::AmmReserves,
            };

        Ok(Self {
            database_url,
            stream_endpoint,
            stream_token,
            rpc_endpoint,
            sol_price_url,
            metadata_primary_url,
            metadata_fallback_url,
            gateway_port,
            bc_save_threshold_usd,
            amm_save_threshold_usd,
            checkpoint_interval,
            checkpoint_path,
            max_replay_slots,
            min_gap_duration,
            abandonment_window,
            abandonment_min_trades,
            default_total_supply,
            post_graduation_price_source,
        })
    }

    /// Programmatic construction with library defaults, for embedding and
    /// test harnesses that do not read the environment
    pub fn with_defaults(
        database_url: impl Into<String>,
        stream_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            stream_endpoint: stream_endpoint.into(),
            stream_token: None,
            rpc_endpoint: "https://api.mainnet-beta.solana.com".to_string(),
            sol_price_url: "https://price.jup.ag/v6/price?ids=SOL".to_string(),
            metadata_primary_url: "https://graphql.example-metadata.io/v1".to_string(),
            metadata_fallback_url: "https://rest.example-metadata.io/tokens".to_string(),
            gateway_port: constants::GATEWAY_DEFAULT_PORT,
            bc_save_threshold_usd: constants::DEFAULT_BC_SAVE_THRESHOLD_USD,
            amm_save_threshold_usd: constants::DEFAULT_AMM_SAVE_THRESHOLD_USD,
            checkpoint_interval: Duration::from_millis(constants::DEFAULT_CHECKPOINT_INTERVAL_MS),
            checkpoint_path: "data/checkpoints.bin".to_string(),
            max_replay_slots: constants::DEFAULT_MAX_REPLAY_SLOTS,
            min_gap_duration: constants::DEFAULT_MIN_GAP_DURATION,
            abandonment_window: Duration::from_millis(constants::DEFAULT_ABANDONMENT_WINDOW_MS),
            abandonment_min_trades: constants::DEFAULT_ABANDONMENT_MIN_TRADES,
            default_total_supply: constants::DEFAULT_TOTAL_SUPPLY_TOKENS,
            post_graduation_price_source: PostGraduationPriceSource::AmmReserves,
        }
    }

    /// Save threshold for a given program
    pub fn save_threshold_usd(&self, program: crate::events::Program) -> f64 {
        match program {
            crate::events::Program::BondingCurve => self.bc_save_threshold_usd,
            crate::events::Program::AmmPool => self.amm_save_threshold_usd,
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}
