//! Durability Layer
//!
//! Batches write tasks from the pipeline, lifecycle engine and pool
//! registry into per-interval flushes over a single SQLite transaction.
//! Signature-keyed inserts ride on `ON CONFLICT DO NOTHING`; token rows
//! UPSERT on mint. Transient failures re-queue the batch at the head and
//! back off; fatal rows are quarantined to the dead-letter table.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::constants::{
    BASE_RETRY_DELAY_MS, DB_BATCH_MAX_ROWS, DB_FLUSH_INTERVAL, DB_QUEUE_BACKPRESSURE_FRACTION,
    DB_QUEUE_CAPACITY, MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS, RETRY_JITTER_FACTOR,
};
use crate::events::{FeeEvent, LiquidityEvent, TradeEvent};
use crate::metrics;

/// Token row assembled by the lifecycle engine for UPSERT on mint
#[derive(Debug, Clone)]
pub struct TokenRow {
    pub mint_address: String,
    pub first_seen_slot: u64,
    pub first_seen_at: DateTime<Utc>,
    pub creator: Option<String>,
    pub first_program: String,
    pub current_program: String,
    pub graduated: bool,
    pub graduation_slot: Option<u64>,
    pub graduation_at: Option<DateTime<Utc>>,
    pub peak_market_cap_usd: Option<f64>,
    pub total_trades: u64,
    pub volume_24h_usd: Option<f64>,
    pub current_price_sol: Option<f64>,
    pub current_price_usd: Option<f64>,
    pub current_mcap_usd: Option<f64>,
    pub supply_assumed: bool,
    pub threshold_crossed: bool,
    pub threshold_crossed_at: Option<DateTime<Utc>>,
}

/// Pool snapshot persisted by the registry
#[derive(Debug, Clone)]
pub struct PoolStateRow {
    pub pool_address: String,
    pub base_mint: String,
    pub lp_mint: Option<String>,
    pub base_reserves: u64,
    pub quote_reserves: u64,
    pub lp_supply: u64,
    pub tvl_usd: Option<f64>,
    pub price_sol: Option<f64>,
    pub is_active: bool,
    pub last_slot: u64,
}

/// Metadata write-back from the enrichment task
#[derive(Debug, Clone)]
pub struct MetadataRow {
    pub mint_address: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub uri: Option<String>,
    pub decimals: Option<u8>,
    pub total_supply: Option<u64>,
    pub source: String,
}

#[derive(Debug, Clone)]
pub enum WriteTask {
    Trade(TradeEvent),
    TokenUpsert(TokenRow),
    Liquidity(LiquidityEvent),
    Fee(FeeEvent),
    PoolState(PoolStateRow),
    CurveMapping {
        curve: String,
        mint: String,
        slot: u64,
        complete: bool,
    },
    LifecyclePhase {
        mint: String,
        phase: String,
        started_at: DateTime<Utc>,
        ended_at: Option<DateTime<Utc>>,
        signature: Option<String>,
    },
    SolPrice {
        fetched_at: DateTime<Utc>,
        price_usd: f64,
    },
    Metadata(MetadataRow),
    RecoveryRequest {
        id: String,
        from_slot: u64,
        to_slot: u64,
        reason: String,
        status: String,
        detail: Option<String>,
    },
    RecoveryCheckpoint {
        connection_id: String,
        last_slot: u64,
        circuit_state: String,
        subscriptions: String,
    },
}

impl WriteTask {
    fn table(&self) -> &'static str {
        match self {
            WriteTask::Trade(_) => "trades_unified",
            WriteTask::TokenUpsert(_) => "tokens_unified",
            WriteTask::Liquidity(_) => "liquidity_events",
            WriteTask::Fee(_) => "amm_fee_events",
            WriteTask::PoolState(_) => "amm_pool_states",
            WriteTask::CurveMapping { .. } => "bonding_curve_mappings",
            WriteTask::LifecyclePhase { .. } => "token_lifecycle",
            WriteTask::SolPrice { .. } => "sol_prices",
            WriteTask::Metadata(_) => "tokens_unified",
            WriteTask::RecoveryRequest { .. } => "recovery_requests",
            WriteTask::RecoveryCheckpoint { .. } => "recovery_checkpoints",
        }
    }
}

/// Cheap clonable producer side of the durability queue
#[derive(Clone)]
pub struct DbHandle {
    sender: mpsc::Sender<WriteTask>,
    overflow: Arc<Mutex<VecDeque<WriteTask>>>,
    depth: Arc<AtomicUsize>,
}

impl DbHandle {
    /// Enqueue a task. When the bounded queue is full the task lands on
    /// the overflow queue, tagged for the next flush cycle.
    pub fn submit(&self, task: WriteTask) {
        match self.sender.try_send(task) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
                metrics::DB_QUEUE_DEPTH.set(depth as f64);
            }
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!("🗄️ Durability queue full, task routed to overflow");
                self.overflow.lock().push_back(task);
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                error!("🗄️ Durability queue closed, dropping {} task", task.table());
            }
        }
    }

    /// Fill fraction of the bounded queue, used for parser backpressure
    pub fn fill_fraction(&self) -> f64 {
        self.depth.load(Ordering::SeqCst) as f64 / DB_QUEUE_CAPACITY as f64
    }

    /// Whether producers should yield before enqueuing more work
    pub fn backpressure(&self) -> bool {
        self.fill_fraction() >= DB_QUEUE_BACKPRESSURE_FRACTION
    }
}

pub struct DatabaseWriter {
    conn: Arc<Mutex<Connection>>,
    receiver: mpsc::Receiver<WriteTask>,
    handle: DbHandle,
    /// Batch that failed transiently, retried ahead of new work
    requeued: VecDeque<WriteTask>,
}

impl DatabaseWriter {
    /// Open (or create) the store and initialize the schema
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(include_str!("../data/schema.sql"))?;
        info!("✅ Database initialized");
        Ok(Self::with_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(include_str!("../data/schema.sql"))?;
        Ok(Self::with_connection(conn))
    }

    fn with_connection(conn: Connection) -> Self {
        let (sender, receiver) = mpsc::channel(DB_QUEUE_CAPACITY);
        let handle = DbHandle {
            sender,
            overflow: Arc::new(Mutex::new(VecDeque::new())),
            depth: Arc::new(AtomicUsize::new(0)),
        };
        Self {
            conn: Arc::new(Mutex::new(conn)),
            receiver,
            handle,
            requeued: VecDeque::new(),
        }
    }

    pub fn handle(&self) -> DbHandle {
        self.handle.clone()
    }

    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Flusher loop: drains the queue into batched transactions until the
    /// channel closes, then performs one final drain.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(DB_FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let open = self.flush_cycle().await;
            if !open {
                // Grace drain on shutdown
                self.flush_cycle().await;
                info!("🗄️ Durability flusher drained and stopped");
                return;
            }
        }
    }

    /// One flush cycle. Returns false once the producer side is gone.
    async fn flush_cycle(&mut self) -> bool {
        let mut open = true;
        loop {
            let batch = self.collect_batch(&mut open);
            if batch.is_empty() {
                break;
            }
            self.write_batch_with_retry(batch).await;
            if self.requeued.is_empty() {
                continue;
            }
            // A batch is stuck at the head; try again next cycle
            break;
        }
        open
    }

    /// Drain every queued task synchronously. Used on shutdown and by
    /// test harnesses that want deterministic persistence.
    pub async fn drain_now(&mut self) {
        let mut open = true;
        loop {
            let batch = self.collect_batch(&mut open);
            if batch.is_empty() {
                break;
            }
            self.write_batch_with_retry(batch).await;
        }
    }

    fn collect_batch(&mut self, open: &mut bool) -> Vec<WriteTask> {
        let mut batch = Vec::with_capacity(DB_BATCH_MAX_ROWS);

        while batch.len() < DB_BATCH_MAX_ROWS {
            if let Some(task) = self.requeued.pop_front() {
                batch.push(task);
                continue;
            }
            let overflowed = self.handle.overflow.lock().pop_front();
            if let Some(task) = overflowed {
                batch.push(task);
                continue;
            }
            match self.receiver.try_recv() {
                Ok(task) => {
                    let depth = self.handle.depth.fetch_sub(1, Ordering::SeqCst) - 1;
                    metrics::DB_QUEUE_DEPTH.set(depth as f64);
                    batch.push(task);
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    *open = false;
                    break;
                }
            }
        }
        batch
    }

    async fn write_batch_with_retry(&mut self, batch: Vec<WriteTask>) {
        let mut attempt = 0u32;
        let mut batch = batch;
        loop {
            match self.write_batch(&batch) {
                Ok(rows) => {
                    debug!("🗄️ Flushed batch of {} tasks ({} rows)", batch.len(), rows);
                    return;
                }
                Err(e) if is_transient(&e) && attempt < MAX_RETRY_ATTEMPTS => {
                    attempt += 1;
                    let delay = backoff_delay(attempt);
                    warn!(
                        "🗄️ Transient store failure (attempt {}/{}), retrying in {:?}: {}",
                        attempt, MAX_RETRY_ATTEMPTS, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    // Budget exhausted: park the batch at the head for the
                    // next cycle rather than losing it
                    warn!("🗄️ Retry budget exhausted, re-queuing batch: {}", e);
                    for task in batch.drain(..).rev() {
                        self.requeued.push_front(task);
                    }
                    return;
                }
                Err(e) => {
                    // Fatal: isolate the poisoned rows one by one
                    error!("🗄️ Fatal batch failure, quarantining: {}", e);
                    self.quarantine(batch);
                    return;
                }
            }
        }
    }

    /// Apply a batch inside one transaction
    fn write_batch(&self, batch: &[WriteTask]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut rows = 0usize;
        for task in batch {
            rows += apply_task(&tx, task)?;
        }
        tx.commit()?;
        Ok(rows)
    }

    /// Write rows individually; failures land in the dead-letter table
    fn quarantine(&self, batch: Vec<WriteTask>) {
        let conn = self.conn.lock();
        for task in batch {
            let applied = {
                let result = conn
                    .unchecked_transaction()
                    .map_err(anyhow::Error::from)
                    .and_then(|tx| {
                        apply_task(&tx, &task)?;
                        tx.commit()?;
                        Ok(())
                    });
                result
            };
            if let Err(e) = applied {
                metrics::DLQ_WRITES.inc();
                let payload = serde_json::to_string(&DeadLetterPayload::from(&task))
                    .unwrap_or_else(|_| "{}".to_string());
                let _ = conn.execute(
                    "INSERT INTO dead_letter_records (table_name, payload, error, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![task.table(), payload, e.to_string(), Utc::now().to_rfc3339()],
                );
            }
        }
    }
}

#[derive(serde::Serialize)]
struct DeadLetterPayload {
    table: String,
    detail: String,
}

impl From<&WriteTask> for DeadLetterPayload {
    fn from(task: &WriteTask) -> Self {
        Self {
            table: task.table().to_string(),
            detail: format!("{:?}", task),
        }
    }
}

/// Apply one task; returns affected row count (0 for idempotent no-ops)
fn apply_task(conn: &rusqlite::Transaction<'_>, task: &WriteTask) -> Result<usize> {
    let rows = match task {
        WriteTask::Trade(trade) => conn.execute(
            "INSERT INTO trades_unified (
                signature, mint_address, program, side, trader,
                sol_amount, token_amount, price_sol, price_usd, market_cap_usd,
                sol_reserves, token_reserves, curve_address, pool_address,
                slot, block_time, is_canonical, confidence
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            ON CONFLICT(signature) DO NOTHING",
            params![
                trade.signature,
                trade.mint,
                trade.program.as_str(),
                trade.side.as_str(),
                trade.user,
                trade.sol_amount.to_string(),
                trade.token_amount.to_string(),
                trade.price.map(|p| p.price_sol),
                trade.price.and_then(|p| p.price_usd),
                trade.price.and_then(|p| p.market_cap_usd).map(round4),
                trade.sol_reserves.to_string(),
                trade.token_reserves.to_string(),
                trade.curve,
                trade.pool,
                trade.slot,
                trade.block_time.to_rfc3339(),
                trade.is_canonical,
                match trade.confidence {
                    crate::events::ParseConfidence::High => "high",
                    crate::events::ParseConfidence::Medium => "medium",
                },
            ],
        )?,
        WriteTask::TokenUpsert(row) => conn.execute(
            "INSERT INTO tokens_unified (
                mint_address, first_seen_slot, first_seen_at, creator,
                first_program, current_program, graduated, graduation_slot,
                graduation_at, peak_market_cap_usd, total_trades,
                volume_24h_usd, current_price_sol, current_price_usd,
                current_mcap_usd, supply_assumed, threshold_crossed,
                threshold_crossed_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(mint_address) DO UPDATE SET
                current_program = excluded.current_program,
                graduated = excluded.graduated,
                graduation_slot = COALESCE(excluded.graduation_slot, graduation_slot),
                graduation_at = COALESCE(excluded.graduation_at, graduation_at),
                peak_market_cap_usd = MAX(COALESCE(peak_market_cap_usd, 0), COALESCE(excluded.peak_market_cap_usd, 0)),
                total_trades = excluded.total_trades,
                volume_24h_usd = excluded.volume_24h_usd,
                current_price_sol = excluded.current_price_sol,
                current_price_usd = excluded.current_price_usd,
                current_mcap_usd = excluded.current_mcap_usd,
                supply_assumed = excluded.supply_assumed,
                threshold_crossed = MAX(threshold_crossed, excluded.threshold_crossed),
                threshold_crossed_at = COALESCE(threshold_crossed_at, excluded.threshold_crossed_at),
                updated_at = excluded.updated_at",
            params![
                row.mint_address,
                row.first_seen_slot,
                row.first_seen_at.to_rfc3339(),
                row.creator,
                row.first_program,
                row.current_program,
                row.graduated,
                row.graduation_slot,
                row.graduation_at.map(|t| t.to_rfc3339()),
                row.peak_market_cap_usd.map(round4),
                row.total_trades,
                row.volume_24h_usd.map(round4),
                row.current_price_sol,
                row.current_price_usd,
                row.current_mcap_usd.map(round4),
                row.supply_assumed,
                row.threshold_crossed,
                row.threshold_crossed_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?,
        WriteTask::Liquidity(event) => conn.execute(
            "INSERT INTO liquidity_events (
                signature, pool_address, user_address, kind, lp_delta,
                base_delta, quote_delta, price_sol, price_usd, slot, block_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(signature) DO NOTHING",
            params![
                event.signature,
                event.pool,
                event.user,
                event.kind.as_str(),
                event.lp_delta.to_string(),
                event.base_delta.to_string(),
                event.quote_delta.to_string(),
                event.price.map(|p| p.price_sol),
                event.price.and_then(|p| p.price_usd),
                event.slot,
                event.block_time.to_rfc3339(),
            ],
        )?,
        WriteTask::Fee(event) => conn.execute(
            "INSERT INTO amm_fee_events (
                signature, pool_address, kind, base_amount, quote_amount,
                recipient, slot, block_time
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(signature) DO NOTHING",
            params![
                event.signature,
                event.pool,
                event.kind.as_str(),
                event.base_amount.to_string(),
                event.quote_amount.to_string(),
                event.recipient,
                event.slot,
                event.block_time.to_rfc3339(),
            ],
        )?,
        WriteTask::PoolState(row) => conn.execute(
            "INSERT INTO amm_pool_states (
                pool_address, base_mint, lp_mint, base_reserves,
                quote_reserves, lp_supply, tvl_usd, price_sol, is_active,
                last_slot, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(pool_address) DO UPDATE SET
                base_reserves = excluded.base_reserves,
                quote_reserves = excluded.quote_reserves,
                lp_supply = excluded.lp_supply,
                tvl_usd = excluded.tvl_usd,
                price_sol = excluded.price_sol,
                is_active = excluded.is_active,
                last_slot = excluded.last_slot,
                updated_at = excluded.updated_at",
            params![
                row.pool_address,
                row.base_mint,
                row.lp_mint,
                row.base_reserves.to_string(),
                row.quote_reserves.to_string(),
                row.lp_supply.to_string(),
                row.tvl_usd.map(round4),
                row.price_sol,
                row.is_active,
                row.last_slot,
                Utc::now().to_rfc3339(),
            ],
        )?,
        WriteTask::CurveMapping {
            curve,
            mint,
            slot,
            complete,
        } => conn.execute(
            "INSERT INTO bonding_curve_mappings (curve_address, mint_address, first_seen_slot, complete)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(curve_address) DO UPDATE SET
                complete = MAX(complete, excluded.complete)",
            params![curve, mint, slot, complete],
        )?,
        WriteTask::LifecyclePhase {
            mint,
            phase,
            started_at,
            ended_at,
            signature,
        } => conn.execute(
            "INSERT INTO token_lifecycle (mint_address, phase, started_at, ended_at, triggering_signature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(mint_address, phase) DO UPDATE SET
                ended_at = COALESCE(excluded.ended_at, ended_at)",
            params![
                mint,
                phase,
                started_at.to_rfc3339(),
                ended_at.map(|t| t.to_rfc3339()),
                signature,
            ],
        )?,
        WriteTask::SolPrice {
            fetched_at,
            price_usd,
        } => conn.execute(
            "INSERT INTO sol_prices (fetched_at, price_usd) VALUES (?1, ?2)
             ON CONFLICT(fetched_at) DO NOTHING",
            params![fetched_at.to_rfc3339(), price_usd],
        )?,
        WriteTask::Metadata(row) => conn.execute(
            "UPDATE tokens_unified SET
                symbol = COALESCE(?2, symbol),
                name = COALESCE(?3, name),
                uri = COALESCE(?4, uri),
                decimals = COALESCE(?5, decimals),
                total_supply = COALESCE(?6, total_supply),
                supply_assumed = CASE WHEN ?6 IS NULL THEN supply_assumed ELSE 0 END,
                metadata_source = ?7,
                metadata_updated_at = ?8
             WHERE mint_address = ?1",
            params![
                row.mint_address,
                row.symbol,
                row.name,
                row.uri,
                row.decimals,
                row.total_supply.map(|s| s.to_string()),
                row.source,
                Utc::now().to_rfc3339(),
            ],
        )?,
        WriteTask::RecoveryRequest {
            id,
            from_slot,
            to_slot,
            reason,
            status,
            detail,
        } => conn.execute(
            "INSERT INTO recovery_requests (id, from_slot, to_slot, reason, status, created_at, updated_at, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                detail = COALESCE(excluded.detail, detail)",
            params![
                id,
                from_slot,
                to_slot,
                reason,
                status,
                Utc::now().to_rfc3339(),
                detail,
            ],
        )?,
        WriteTask::RecoveryCheckpoint {
            connection_id,
            last_slot,
            circuit_state,
            subscriptions,
        } => conn.execute(
            "INSERT INTO recovery_checkpoints (connection_id, last_slot, circuit_state, subscriptions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                connection_id,
                last_slot,
                circuit_state,
                subscriptions,
                Utc::now().to_rfc3339(),
            ],
        )?,
    };
    Ok(rows)
}

/// USD columns are decimal(20,4) in the contract
fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

/// Busy/locked/IO errors retry; constraint violations (other than the
/// signature-unique no-ops, which never error) are fatal.
fn is_transient(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(inner, _)) => matches!(
            inner.code,
            rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::SystemIoFailure
                | rusqlite::ErrorCode::DiskFull
        ),
        Some(_) => false,
        None => true,
    }
}

fn backoff_delay(attempt: u32) -> std::time::Duration {
    let exp = BASE_RETRY_DELAY_MS.saturating_mul(2u64.saturating_pow(attempt - 1));
    let capped = exp.min(MAX_RETRY_DELAY_MS);
    let jitter = 1.0 + RETRY_JITTER_FACTOR * (fastrand::f64() * 2.0 - 1.0);
    std::time::Duration::from_millis((capped as f64 * jitter) as u64)
}

/// Hourly and daily per-pool roll-ups driven by the maintenance task
pub fn run_rollup(conn: &Connection, table: &str, bucket_format: &str) -> Result<usize> {
    if table != "pool_metrics_hourly" && table != "pool_metrics_daily" {
        return Err(anyhow!("unknown rollup table {}", table));
    }
    let sql = format!(
        "INSERT OR REPLACE INTO {table} (
            pool_address, bucket, open_usd, high_usd, low_usd, close_usd,
            volume_sol, volume_usd, fees_quote, tvl_open_usd, tvl_close_usd,
            unique_traders, trade_count
        )
        SELECT
            t.pool_address,
            strftime('{bucket}', t.block_time) AS bucket,
            (SELECT t2.price_usd FROM trades_unified t2
              WHERE t2.pool_address = t.pool_address
                AND strftime('{bucket}', t2.block_time) = strftime('{bucket}', t.block_time)
              ORDER BY t2.slot ASC LIMIT 1),
            MAX(t.price_usd),
            MIN(t.price_usd),
            (SELECT t2.price_usd FROM trades_unified t2
              WHERE t2.pool_address = t.pool_address
                AND strftime('{bucket}', t2.block_time) = strftime('{bucket}', t.block_time)
              ORDER BY t2.slot DESC LIMIT 1),
            CAST(SUM(CAST(t.sol_amount AS INTEGER)) AS TEXT),
            SUM(COALESCE(t.price_usd, 0) * CAST(t.token_amount AS REAL) / 1000000.0),
            COALESCE((SELECT CAST(SUM(CAST(f.quote_amount AS INTEGER)) AS TEXT)
              FROM amm_fee_events f
              WHERE f.pool_address = t.pool_address
                AND strftime('{bucket}', f.block_time) = strftime('{bucket}', t.block_time)), '0'),
            NULL,
            (SELECT p.tvl_usd FROM amm_pool_states p WHERE p.pool_address = t.pool_address),
            COUNT(DISTINCT t.trader),
            COUNT(*)
        FROM trades_unified t
        WHERE t.pool_address IS NOT NULL
        GROUP BY t.pool_address, bucket",
        table = table,
        bucket = bucket_format,
    );
    let rows = conn.execute(&sql, [])?;
    Ok(rows)
}

pub fn run_hourly_rollup(conn: &Connection) -> Result<usize> {
    run_rollup(conn, "pool_metrics_hourly", "%Y-%m-%dT%H:00")
}

pub fn run_daily_rollup(conn: &Connection) -> Result<usize> {
    run_rollup(conn, "pool_metrics_daily", "%Y-%m-%d")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ParseConfidence, Program, TradeSide};

    fn sample_trade(signature: &str) -> TradeEvent {
        TradeEvent {
            signature: signature.to_string(),
            slot: 1000,
            block_time: Utc::now(),
            program: Program::BondingCurve,
            side: TradeSide::Buy,
            user: "trader1".to_string(),
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

    fn count(conn: &Arc<Mutex<Connection>>, table: &str) -> i64 {
        let conn = conn.lock();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_duplicate_signature_is_noop() {
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let conn = writer.connection();

        {
            let mut guard = conn.lock();
            let tx = guard.transaction().unwrap();
            let first = apply_task(&tx, &WriteTask::Trade(sample_trade("dupsig"))).unwrap();
            let second = apply_task(&tx, &WriteTask::Trade(sample_trade("dupsig"))).unwrap();
            tx.commit().unwrap();
            assert_eq!(first, 1);
            assert_eq!(second, 0); // conflict -> rowcount 0
        }
        assert_eq!(count(&conn, "trades_unified"), 1);
    }

    #[test]
    fn test_token_upsert_preserves_threshold_crossing() {
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let conn = writer.connection();

        let mut row = TokenRow {
            mint_address: "mint1".to_string(),
            first_seen_slot: 10,
            first_seen_at: Utc::now(),
            creator: None,
            first_program: "bonding_curve".to_string(),
            current_program: "bonding_curve".to_string(),
            graduated: false,
            graduation_slot: None,
            graduation_at: None,
            peak_market_cap_usd: Some(20_000.0),
            total_trades: 1,
            volume_24h_usd: None,
            current_price_sol: Some(2e-7),
            current_price_usd: Some(2e-5),
            current_mcap_usd: Some(20_000.0),
            supply_assumed: true,
            threshold_crossed: true,
            threshold_crossed_at: Some(Utc::now()),
        };

        {
            let mut guard = conn.lock();
            let tx = guard.transaction().unwrap();
            apply_task(&tx, &WriteTask::TokenUpsert(row.clone())).unwrap();
            tx.commit().unwrap();
        }

        // Second upsert with lower peak and no crossing must not regress
        row.peak_market_cap_usd = Some(10_000.0);
        row.threshold_crossed = false;
        row.threshold_crossed_at = None;
        {
            let mut guard = conn.lock();
            let tx = guard.transaction().unwrap();
            apply_task(&tx, &WriteTask::TokenUpsert(row)).unwrap();
            tx.commit().unwrap();
        }

        let guard = conn.lock();
        let (peak, crossed): (f64, i64) = guard
            .query_row(
                "SELECT peak_market_cap_usd, threshold_crossed FROM tokens_unified WHERE mint_address = 'mint1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(peak, 20_000.0);
        assert_eq!(crossed, 1);
    }

    #[tokio::test]
    async fn test_flush_cycle_persists_submitted_tasks() {
        let mut writer = DatabaseWriter::open_in_memory().unwrap();
        let handle = writer.handle();
        let conn = writer.connection();

        handle.submit(WriteTask::Trade(sample_trade("flushsig")));
        handle.submit(WriteTask::SolPrice {
            fetched_at: Utc::now(),
            price_usd: 142.5,
        });

        let mut open = true;
        let batch = writer.collect_batch(&mut open);
        assert_eq!(batch.len(), 2);
        writer.write_batch_with_retry(batch).await;

        assert_eq!(count(&conn, "trades_unified"), 1);
        assert_eq!(count(&conn, "sol_prices"), 1);
    }

    #[test]
    fn test_rollups_execute() {
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let conn = writer.connection();
        {
            let mut guard = conn.lock();
            let tx = guard.transaction().unwrap();
            let mut trade = sample_trade("rollupsig");
            trade.pool = Some("pool1".to_string());
            trade.program = Program::AmmPool;
            trade.price = Some(crate::events::PriceTag {
                price_sol: 2e-7,
                price_usd: Some(2e-5),
                market_cap_usd: Some(20_000.0),
                quote_time: None,
                supply_assumed: true,
            });
            apply_task(&tx, &WriteTask::Trade(trade)).unwrap();
            tx.commit().unwrap();
        }

        let guard = conn.lock();
        run_hourly_rollup(&guard).unwrap();
        run_daily_rollup(&guard).unwrap();
        let hourly: i64 = guard
            .query_row("SELECT COUNT(*) FROM pool_metrics_hourly", [], |r| r.get(0))
            .unwrap();
        assert_eq!(hourly, 1);
    }

    #[test]
    fn test_backoff_delay_bounded() {
        for attempt in 1..=10 {
            let delay = backoff_delay(attempt);
            assert!(delay.as_millis() as u64 <= MAX_RETRY_DELAY_MS + MAX_RETRY_DELAY_MS / 5);
        }
    }
}
