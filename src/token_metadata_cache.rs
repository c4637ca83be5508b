//! On-chain mint metadata cache
//!
//! Supply and decimals read straight from the SPL mint account. The hot
//! path only ever touches the synchronous cache; fetches run from the
//! enrichment task. Market cap falls back to the configured default
//! supply (flagged on the record) until a fetch lands.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::constants::WSOL_MINT;

/// Safe string truncation to prevent panics on short strings
fn truncate_safe(s: &str, max_len: usize) -> String {
    s.chars().take(max_len).collect()
}

#[derive(Debug, Clone, Copy)]
pub struct MintMeta {
    pub decimals: u8,
    /// Raw supply in base units
    pub supply_base_units: u64,
}

impl MintMeta {
    /// Whole-token supply for market cap math
    pub fn supply_tokens(&self) -> u64 {
        self.supply_base_units / 10u64.pow(self.decimals as u32)
    }
}

#[derive(Clone)]
pub struct TokenMetadataCache {
    cache: Arc<RwLock<HashMap<String, MintMeta>>>,
    rpc_client: Arc<RpcClient>,
}

impl TokenMetadataCache {
    pub fn new(rpc_url: String) -> Self {
        let cache = Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            rpc_client: Arc::new(RpcClient::new(rpc_url)),
        };
        cache.add_known_tokens();
        cache
    }

    /// Non-blocking lookup for the pricing path
    pub fn get_cached(&self, mint: &str) -> Option<MintMeta> {
        self.cache.read().get(mint).copied()
    }

    /// Fetch mint metadata from chain and cache it
    pub async fn fetch_and_cache(&self, mint: &str) -> Result<MintMeta> {
        if let Some(meta) = self.get_cached(mint) {
            return Ok(meta);
        }

        let meta = self.fetch_from_chain(mint).await?;
        self.cache.write().insert(mint.to_string(), meta);
        debug!(
            "🔢 Cached mint meta for {}: decimals={} supply={}",
            truncate_safe(mint, 8),
            meta.decimals,
            meta.supply_base_units
        );
        Ok(meta)
    }

    /// SPL Token mint account layout:
    /// - bytes 0-35: mint_authority (36 bytes)
    /// - bytes 36-43: supply (8 bytes, little endian)
    /// - byte 44: decimals
    async fn fetch_from_chain(&self, mint: &str) -> Result<MintMeta> {
        let pubkey =
            Pubkey::from_str(mint).map_err(|e| anyhow!("invalid mint pubkey: {}", e))?;

        let account = self
            .rpc_client
            .get_account(&pubkey)
            .await
            .map_err(|e| anyhow!("failed to fetch mint account: {}", e))?;

        if account.owner != spl_token::id() {
            return Err(anyhow!("account {} not owned by the token program", mint));
        }
        if account.data.len() < 45 {
            return Err(anyhow!(
                "invalid mint account data length: {}",
                account.data.len()
            ));
        }

        let supply_bytes: [u8; 8] = account.data[36..44].try_into().expect("8-byte slice");
        let decimals = account.data[44];
        if decimals > 18 {
            warn!(
                "⚠️ Unusual decimals {} for mint {}, using anyway",
                decimals,
                truncate_safe(mint, 8)
            );
        }

        Ok(MintMeta {
            decimals,
            supply_base_units: u64::from_le_bytes(supply_bytes),
        })
    }

    /// Pre-warm with known mints to avoid RPC round trips
    fn add_known_tokens(&self) {
        let mut cache = self.cache.write();
        cache.insert(
            WSOL_MINT.to_string(),
            MintMeta {
                decimals: 9,
                supply_base_units: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    /// Ceiling maintenance for the pruner
    pub fn prune(&self, ceiling: usize) {
        let mut cache = self.cache.write();
        if cache.len() <= ceiling {
            return;
        }
        let excess = cache.len() - ceiling;
        let doomed: Vec<String> = cache
            .keys()
            .filter(|k| k.as_str() != WSOL_MINT)
            .take(excess)
            .cloned()
            .collect();
        for key in doomed {
            cache.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supply_tokens_scaling() {
        let meta = MintMeta {
            decimals: 6,
            supply_base_units: 1_000_000_000_000_000,
        };
        assert_eq!(meta.supply_tokens(), 1_000_000_000);
    }

    #[test]
    fn test_known_tokens_prewarmed() {
        let cache = TokenMetadataCache::new("http://localhost:8899".to_string());
        assert_eq!(cache.get_cached(WSOL_MINT).unwrap().decimals, 9);
    }

    #[test]
    fn test_prune_keeps_wsol() {
        let cache = TokenMetadataCache::new("http://localhost:8899".to_string());
        for i in 0..10 {
            cache.cache.write().insert(
                format!("mint{}", i),
                MintMeta {
                    decimals: 6,
                    supply_base_units: 1,
                },
            );
        }
        cache.prune(3);
        assert!(cache.get_cached(WSOL_MINT).is_some());
        assert!(cache.len() <= 4);
    }
}
