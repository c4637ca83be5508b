//! Recovery Subsystem
//!
//! Persists periodic checkpoints, reopens slot gaps found on restart and
//! watches the live stream for temporal gaps. Replays are bounded by
//! `max_replay_slots` and idempotent by signature (inserts conflict away
//! downstream). Replay work travels as intent messages so the recovery
//! task never reaches back into the stream supervisor.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint_store::{
    AggregateMetrics, Checkpoint, CheckpointStore, ConnectionCheckpoint,
};
use crate::config::IndexerConfig;
use crate::database_writer::{DbHandle, WriteTask};
use crate::metrics;
use crate::stream_session::{ConnectionSnapshot, StreamSupervisor};

/// Intent message asking the stream layer to replay a slot range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayCommand {
    pub request_id: String,
    pub from_slot: u64,
    pub to_slot: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }
}

pub struct RecoveryManager {
    config: Arc<IndexerConfig>,
    store: CheckpointStore,
    db: DbHandle,
    replay_tx: mpsc::Sender<ReplayCommand>,
}

impl RecoveryManager {
    pub fn new(
        config: Arc<IndexerConfig>,
        store: CheckpointStore,
        db: DbHandle,
        replay_tx: mpsc::Sender<ReplayCommand>,
    ) -> Self {
        Self {
            config,
            store,
            db,
            replay_tx,
        }
    }

    /// Resume slots per connection from the latest checkpoint, if any
    pub fn load_resume_points(&self) -> Result<Vec<ConnectionCheckpoint>> {
        Ok(self
            .store
            .load_latest()?
            .map(|c| c.connections)
            .unwrap_or_default())
    }

    /// On restart: open a bounded replay for the gap between the
    /// checkpointed slot and the live tip
    pub async fn schedule_startup_replays(
        &self,
        resume_points: &[ConnectionCheckpoint],
        current_slot: u64,
    ) {
        for point in resume_points {
            if point.last_slot == 0 || current_slot <= point.last_slot {
                continue;
            }
            let from = point.last_slot + 1;
            let to = current_slot.min(from + self.config.max_replay_slots - 1);
            if current_slot - point.last_slot > self.config.max_replay_slots {
                warn!(
                    "⏪ Gap for {} exceeds replay cap, truncating to [{}, {}]",
                    point.id, from, to
                );
            }
            self.open_replay(from, to, &format!("restart gap on {}", point.id))
                .await;
        }
    }

    /// Open a replay request and hand the intent to the stream layer
    pub async fn open_replay(&self, from_slot: u64, to_slot: u64, reason: &str) {
        let request_id = Uuid::new_v4().to_string();
        info!(
            "⏪ Recovery request {} for slots [{}, {}]: {}",
            request_id, from_slot, to_slot, reason
        );
        metrics::REPLAYS_OPENED.inc();

        self.db.submit(WriteTask::RecoveryRequest {
            id: request_id.clone(),
            from_slot,
            to_slot,
            reason: reason.to_string(),
            status: RequestStatus::Pending.as_str().to_string(),
            detail: None,
        });

        let command = ReplayCommand {
            request_id: request_id.clone(),
            from_slot,
            to_slot,
        };
        if self.replay_tx.send(command).await.is_err() {
            error!("⏪ Replay channel closed, marking request {} failed", request_id);
            self.update_request(&request_id, from_slot, to_slot, RequestStatus::Failed, Some("replay channel closed"));
        }
    }

    /// Status transition for a request row
    pub fn update_request(
        &self,
        request_id: &str,
        from_slot: u64,
        to_slot: u64,
        status: RequestStatus,
        detail: Option<&str>,
    ) {
        self.db.submit(WriteTask::RecoveryRequest {
            id: request_id.to_string(),
            from_slot,
            to_slot,
            reason: String::new(),
            status: status.as_str().to_string(),
            detail: detail.map(String::from),
        });
    }

    /// Persist one checkpoint from the supervisor's snapshots
    pub fn checkpoint(&self, snapshots: &[ConnectionSnapshot]) -> Result<()> {
        let connections: Vec<ConnectionCheckpoint> = snapshots
            .iter()
            .map(|s| ConnectionCheckpoint {
                id: s.id.clone(),
                last_slot: s.last_slot,
                circuit_state: s.state.as_str().to_string(),
                subscriptions: s.subscriptions.clone(),
            })
            .collect();

        let checkpoint = Checkpoint {
            created_at_ms: Utc::now().timestamp_millis(),
            connections: connections.clone(),
            aggregate: AggregateMetrics {
                trades_processed: 0,
                decode_errors: metrics::INGEST_DECODE_ERRORS.get(),
                parse_failures: metrics::PARSE_FAILED.get(),
            },
        };
        self.store.append(&checkpoint)?;

        for connection in connections {
            self.db.submit(WriteTask::RecoveryCheckpoint {
                connection_id: connection.id,
                last_slot: connection.last_slot,
                circuit_state: connection.circuit_state,
                subscriptions: serde_json::to_string(&connection.subscriptions)
                    .unwrap_or_else(|_| "[]".to_string()),
            });
        }
        Ok(())
    }

    /// Background task: periodic checkpoints plus temporal gap watching.
    /// A final checkpoint is persisted on shutdown.
    pub async fn run(
        self: Arc<Self>,
        supervisor: Arc<StreamSupervisor>,
        pipeline: Arc<crate::trade_pipeline::TradePipeline>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.checkpoint_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut gap_open = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        if let Err(e) = self.checkpoint(&supervisor.snapshots()) {
                            error!("💾 Final checkpoint failed: {}", e);
                        } else {
                            info!("💾 Final checkpoint persisted");
                        }
                        return;
                    }
                }
            }

            if let Err(e) = self.checkpoint(&supervisor.snapshots()) {
                warn!("💾 Checkpoint failed: {}", e);
            }

            // Temporal gap: a healthy stream that stopped producing
            // trades for longer than the configured window
            let silent_for = pipeline
                .last_trade_at()
                .map(|at| Utc::now().signed_duration_since(at));
            if let Some(silent) = silent_for {
                let gapped =
                    silent.num_milliseconds() as u128 > self.config.min_gap_duration.as_millis();
                if gapped && !gap_open && supervisor.any_healthy() {
                    gap_open = true;
                    let snapshots = supervisor.snapshots();
                    let tip = snapshots.iter().map(|s| s.last_slot).max().unwrap_or(0);
                    if tip > 0 {
                        let estimated_gap_slots = (silent.num_milliseconds() as u64
                            / crate::constants::SOLANA_SLOT_TIME_MS)
                            .min(self.config.max_replay_slots);
                        let from = tip.saturating_sub(estimated_gap_slots).max(1);
                        self.open_replay(from, tip, "temporal gap in trade stream").await;
                    }
                } else if !gapped {
                    gap_open = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_writer::DatabaseWriter;

    fn manager(
        tmp_name: &str,
    ) -> (
        RecoveryManager,
        DatabaseWriter,
        mpsc::Receiver<ReplayCommand>,
    ) {
        let config = Arc::new(IndexerConfig::with_defaults(
            ":memory:",
            "http://localhost:10000",
        ));
        let writer = DatabaseWriter::open_in_memory().unwrap();
        let path = std::env::temp_dir().join(format!("{}-{}", tmp_name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let (replay_tx, replay_rx) = mpsc::channel(16);
        let manager = RecoveryManager::new(
            config,
            CheckpointStore::new(path),
            writer.handle(),
            replay_tx,
        );
        (manager, writer, replay_rx)
    }

    fn request_rows(writer: &DatabaseWriter) -> Vec<(String, u64, u64, String)> {
        let conn = writer.connection();
        let conn = conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, from_slot, to_slot, status FROM recovery_requests ORDER BY created_at")
            .unwrap();
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        rows
    }

    #[tokio::test]
    async fn test_open_replay_creates_request_and_command() {
        let (manager, mut writer, mut replay_rx) = manager("recovery-open");
        manager.open_replay(1000, 1600, "test gap").await;
        writer.drain_now().await;

        let command = replay_rx.recv().await.unwrap();
        assert_eq!(command.from_slot, 1000);
        assert_eq!(command.to_slot, 1600);

        let rows = request_rows(&writer);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, "pending");
    }

    #[tokio::test]
    async fn test_request_status_transitions() {
        let (manager, mut writer, mut replay_rx) = manager("recovery-status");
        manager.open_replay(1000, 1600, "test gap").await;
        let command = replay_rx.recv().await.unwrap();

        manager.update_request(
            &command.request_id,
            1000,
            1600,
            RequestStatus::Processing,
            None,
        );
        manager.update_request(
            &command.request_id,
            1000,
            1600,
            RequestStatus::Completed,
            None,
        );
        writer.drain_now().await;

        let rows = request_rows(&writer);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].3, "completed");
    }

    #[tokio::test]
    async fn test_startup_replay_capped() {
        let (manager, mut writer, mut replay_rx) = manager("recovery-cap");
        let resume = vec![ConnectionCheckpoint {
            id: "conn-1".to_string(),
            last_slot: 1000,
            circuit_state: "healthy".to_string(),
            subscriptions: vec![],
        }];
        // Gap far larger than the cap
        manager.schedule_startup_replays(&resume, 1_000_000).await;
        writer.drain_now().await;

        let command = replay_rx.recv().await.unwrap();
        assert_eq!(command.from_slot, 1001);
        assert_eq!(
            command.to_slot,
            1000 + crate::constants::DEFAULT_MAX_REPLAY_SLOTS
        );
    }

    #[tokio::test]
    async fn test_no_replay_when_caught_up() {
        let (manager, _writer, mut replay_rx) = manager("recovery-caughtup");
        let resume = vec![ConnectionCheckpoint {
            id: "conn-1".to_string(),
            last_slot: 5000,
            circuit_state: "healthy".to_string(),
            subscriptions: vec![],
        }];
        manager.schedule_startup_replays(&resume, 5000).await;
        assert!(replay_rx.try_recv().is_err());
    }
}
