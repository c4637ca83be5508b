//! Metadata Enrichment
//!
//! Out-of-band lookups for names, symbols and creators. Batches of up to
//! fifty mints go to the primary GraphQL-style source; mints it returns
//! nothing for fall through to the REST source. Results are written back
//! with their source and timestamp. Runs entirely off the hot path.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::constants::{METADATA_BATCH_SIZE, METADATA_QUERY_TIMEOUT};
use crate::database_writer::{DbHandle, MetadataRow, WriteTask};
use crate::token_metadata_cache::TokenMetadataCache;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenMetadata {
    pub mint: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub uri: Option<String>,
    pub decimals: Option<u8>,
    #[serde(default)]
    pub supply: Option<u64>,
}

/// Provider seam so tests can run without a network
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_batch(&self, mints: &[String]) -> Result<Vec<TokenMetadata>>;
}

/// Primary source: batched GraphQL-style POST
pub struct GraphqlMetadataProvider {
    client: reqwest::Client,
    url: String,
}

impl GraphqlMetadataProvider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(METADATA_QUERY_TIMEOUT)
                .gzip(true)
                .build()
                .expect("reqwest client"),
            url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<GraphqlData>,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    tokens: Vec<TokenMetadata>,
}

#[async_trait]
impl MetadataProvider for GraphqlMetadataProvider {
    fn name(&self) -> &'static str {
        "graphql_primary"
    }

    async fn fetch_batch(&self, mints: &[String]) -> Result<Vec<TokenMetadata>> {
        let query = serde_json::json!({
            "query": "query Tokens($mints: [String!]!) { tokens(mints: $mints) { mint symbol name uri decimals supply } }",
            "variables": { "mints": mints },
        });
        let response = self.client.post(&self.url).json(&query).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("metadata primary returned {}", response.status()));
        }
        let body: GraphqlResponse = response.json().await?;
        Ok(body.data.map(|d| d.tokens).unwrap_or_default())
    }
}

/// Fallback source: plain REST with comma-joined mints
pub struct RestMetadataProvider {
    client: reqwest::Client,
    url: String,
}

impl RestMetadataProvider {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(METADATA_QUERY_TIMEOUT)
                .gzip(true)
                .build()
                .expect("reqwest client"),
            url,
        }
    }
}

#[async_trait]
impl MetadataProvider for RestMetadataProvider {
    fn name(&self) -> &'static str {
        "rest_fallback"
    }

    async fn fetch_batch(&self, mints: &[String]) -> Result<Vec<TokenMetadata>> {
        let url = format!("{}?mints={}", self.url, mints.join(","));
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("metadata fallback returned {}", response.status()));
        }
        let tokens: Vec<TokenMetadata> = response.json().await?;
        Ok(tokens)
    }
}

pub struct MetadataEnricher {
    primary: Box<dyn MetadataProvider>,
    fallback: Box<dyn MetadataProvider>,
    conn: Arc<Mutex<Connection>>,
    db: DbHandle,
    mint_meta: TokenMetadataCache,
    poll_interval: Duration,
}

impl MetadataEnricher {
    pub fn new(
        primary: Box<dyn MetadataProvider>,
        fallback: Box<dyn MetadataProvider>,
        conn: Arc<Mutex<Connection>>,
        db: DbHandle,
        mint_meta: TokenMetadataCache,
    ) -> Self {
        Self {
            primary,
            fallback,
            conn,
            db,
            mint_meta,
            poll_interval: Duration::from_secs(30),
        }
    }

    /// Mints persisted without metadata yet, oldest first
    fn pending_mints(&self) -> Vec<String> {
        let conn = self.conn.lock();
        let mut stmt = match conn.prepare(
            "SELECT mint_address FROM tokens_unified
             WHERE metadata_updated_at IS NULL
             ORDER BY first_seen_at ASC
             LIMIT ?1",
        ) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!("🔎 Pending-mint query failed: {}", e);
                return Vec::new();
            }
        };
        stmt.query_map([METADATA_BATCH_SIZE as i64], |row| row.get::<_, String>(0))
            .map(|rows| rows.filter_map(|r| r.ok()).collect())
            .unwrap_or_default()
    }

    /// Enrich one batch; returns how many rows were written back
    pub async fn enrich_batch(&self, mints: &[String]) -> usize {
        if mints.is_empty() {
            return 0;
        }

        let primary_results = match self.primary.fetch_batch(mints).await {
            Ok(results) => results,
            Err(e) => {
                warn!("🔎 {} failed: {}", self.primary.name(), e);
                Vec::new()
            }
        };

        let found: HashSet<String> =
            primary_results.iter().map(|t| t.mint.clone()).collect();
        let missing: Vec<String> = mints
            .iter()
            .filter(|m| !found.contains(*m))
            .cloned()
            .collect();

        let fallback_results = if missing.is_empty() {
            Vec::new()
        } else {
            match self.fallback.fetch_batch(&missing).await {
                Ok(results) => results,
                Err(e) => {
                    warn!("🔎 {} failed: {}", self.fallback.name(), e);
                    Vec::new()
                }
            }
        };

        let mut written = 0;
        for (source, results) in [
            (self.primary.name(), primary_results),
            (self.fallback.name(), fallback_results),
        ] {
            for token in results {
                self.db.submit(WriteTask::Metadata(MetadataRow {
                    mint_address: token.mint.clone(),
                    symbol: token.symbol,
                    name: token.name,
                    uri: token.uri,
                    decimals: token.decimals,
                    total_supply: token.supply,
                    source: source.to_string(),
                }));
                written += 1;

                // Supply missing from the provider: read the mint account
                if token.supply.is_none() {
                    if let Err(e) = self.mint_meta.fetch_and_cache(&token.mint).await {
                        debug!("🔎 On-chain supply fetch failed for {}: {}", token.mint, e);
                    }
                }
            }
        }
        written
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("🔎 Metadata enrichment running every {:?}", self.poll_interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let pending = self.pending_mints();
            if pending.is_empty() {
                continue;
            }
            let written = self.enrich_batch(&pending).await;
            if written > 0 {
                info!("🔎 Enriched {}/{} mints", written, pending.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_writer::DatabaseWriter;

    struct StaticProvider {
        name: &'static str,
        results: Vec<TokenMetadata>,
        calls: Arc<Mutex<Vec<Vec<String>>>>,
    }

    #[async_trait]
    impl MetadataProvider for StaticProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_batch(&self, mints: &[String]) -> Result<Vec<TokenMetadata>> {
            self.calls.lock().push(mints.to_vec());
            Ok(self
                .results
                .iter()
                .filter(|t| mints.contains(&t.mint))
                .cloned()
                .collect())
        }
    }

    fn meta(mint: &str, symbol: &str) -> TokenMetadata {
        TokenMetadata {
            mint: mint.to_string(),
            symbol: Some(symbol.to_string()),
            name: Some(format!("{} token", symbol)),
            uri: None,
            decimals: Some(6),
            supply: Some(1_000_000_000),
        }
    }

    #[tokio::test]
    async fn test_fallback_receives_only_missing_mints() {
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let primary_calls = Arc::new(Mutex::new(Vec::new()));
        let fallback_calls = Arc::new(Mutex::new(Vec::new()));

        let enricher = MetadataEnricher::new(
            Box::new(StaticProvider {
                name: "graphql_primary",
                results: vec![meta("mintA", "AAA")],
                calls: Arc::clone(&primary_calls),
            }),
            Box::new(StaticProvider {
                name: "rest_fallback",
                results: vec![meta("mintB", "BBB")],
                calls: Arc::clone(&fallback_calls),
            }),
            writer.connection(),
            writer.handle(),
            TokenMetadataCache::new("http://localhost:8899".to_string()),
        );

        let written = enricher
            .enrich_batch(&["mintA".to_string(), "mintB".to_string()])
            .await;
        assert_eq!(written, 2);

        assert_eq!(primary_calls.lock().len(), 1);
        let fallback_batches = fallback_calls.lock();
        assert_eq!(fallback_batches.len(), 1);
        assert_eq!(fallback_batches[0], vec!["mintB".to_string()]);
    }

    #[tokio::test]
    async fn test_no_fallback_when_primary_covers_batch() {
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let fallback_calls = Arc::new(Mutex::new(Vec::new()));

        let enricher = MetadataEnricher::new(
            Box::new(StaticProvider {
                name: "graphql_primary",
                results: vec![meta("mintA", "AAA")],
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
            Box::new(StaticProvider {
                name: "rest_fallback",
                results: Vec::new(),
                calls: Arc::clone(&fallback_calls),
            }),
            writer.connection(),
            writer.handle(),
            TokenMetadataCache::new("http://localhost:8899".to_string()),
        );

        enricher.enrich_batch(&["mintA".to_string()]).await;
        assert!(fallback_calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_writeback_marks_source() {
        let mut writer = DatabaseWriter::open_in_memory().unwrap();

        // Seed a token row so the metadata UPDATE has a target
        {
            let conn = writer.connection();
            let conn = conn.lock();
            conn.execute(
                "INSERT INTO tokens_unified (mint_address, first_seen_slot, first_seen_at,
                 first_program, current_program, updated_at)
                 VALUES ('mintA', 1, '2026-01-01T00:00:00Z', 'bonding_curve', 'bonding_curve',
                 '2026-01-01T00:00:00Z')",
                [],
            )
            .unwrap();
        }

        let enricher = MetadataEnricher::new(
            Box::new(StaticProvider {
                name: "graphql_primary",
                results: vec![meta("mintA", "AAA")],
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
            Box::new(StaticProvider {
                name: "rest_fallback",
                results: Vec::new(),
                calls: Arc::new(Mutex::new(Vec::new())),
            }),
            writer.connection(),
            writer.handle(),
            TokenMetadataCache::new("http://localhost:8899".to_string()),
        );

        enricher.enrich_batch(&["mintA".to_string()]).await;
        writer.drain_now().await;

        let conn = writer.connection();
        let conn = conn.lock();
        let (symbol, source, supply_assumed): (String, String, i64) = conn
            .query_row(
                "SELECT symbol, metadata_source, supply_assumed FROM tokens_unified WHERE mint_address = 'mintA'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(symbol, "AAA");
        assert_eq!(source, "graphql_primary");
        assert_eq!(supply_assumed, 0);
    }
}
