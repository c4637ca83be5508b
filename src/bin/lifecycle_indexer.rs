//! Indexer entrypoint
//!
//! Wires the stream sessions, parser workers, pipeline, durability layer
//! and background services together. Exit codes: 0 on clean shutdown,
//! 1 on initialization failure, 2 when the stream is irrecoverable after
//! the maximum number of restart attempts.

use anyhow::Result;
use clap::Parser;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use token_lifecycle_indexer::{
    constants, database_writer, AmmPoolRegistry, CheckpointStore, Commitment, ConnectionConfig,
    DatabaseWriter, DecodedFrame, EventRouter, FeeService, FramePayload, GraphqlMetadataProvider,
    GrpcFrameSource, IndexerConfig, InstructionParser, LifecycleEngine, MetadataEnricher,
    ParseRateTracker, RecoveryManager, ReplayCommand, RequestStatus, RestMetadataProvider,
    SessionFrame, SignatureVerdict, SlotClock, SolPriceCache, SolPriceFeed, SourceFactory,
    StreamSession, StreamSupervisor, TokenMetadataCache, TradePipeline, WebSocketGateway,
    WireDecoder,
};

#[derive(Parser, Debug)]
#[command(name = "lifecycle_indexer", about = "Bonding curve + AMM lifecycle indexer")]
struct Cli {
    /// Override the WebSocket gateway port
    #[arg(long)]
    gateway_port: Option<u16>,

    /// One-shot replay range as FROM:TO, then run normally
    #[arg(long)]
    replay: Option<String>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let config = match IndexerConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("❌ Initialization failed: {}", e);
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("❌ Runtime construction failed: {}", e);
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(config, cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("❌ Initialization failed: {}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(config: Arc<IndexerConfig>, cli: Cli) -> Result<ExitCode> {
    let writer = DatabaseWriter::open(&config.database_url)?;
    let db = writer.handle();
    let store_conn = writer.connection();

    let router = Arc::new(EventRouter::new());
    let slot_clock = SlotClock::new();
    let decoder = Arc::new(WireDecoder::new(slot_clock.clone()));
    let parser = Arc::new(InstructionParser::new());

    let sol_price = SolPriceCache::new();
    let mint_meta = TokenMetadataCache::new(config.rpc_endpoint.clone());
    let pools = Arc::new(AmmPoolRegistry::new());
    let fees = Arc::new(FeeService::new());
    let lifecycle = Arc::new(LifecycleEngine::new(db.clone(), Arc::clone(&router)));
    let pipeline = Arc::new(TradePipeline::new(
        Arc::clone(&config),
        Arc::clone(&lifecycle),
        Arc::clone(&pools),
        Arc::clone(&fees),
        sol_price.clone(),
        mint_meta.clone(),
        Arc::clone(&router),
        db.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Durability flusher
    let flusher = tokio::spawn(writer.run());

    // SOL/USD feed
    tokio::spawn(
        SolPriceFeed::new(
            config.sol_price_url.clone(),
            sol_price.clone(),
            db.clone(),
            Arc::clone(&router),
        )
        .run(shutdown_rx.clone()),
    );

    // Metadata enrichment
    tokio::spawn(
        MetadataEnricher::new(
            Box::new(GraphqlMetadataProvider::new(config.metadata_primary_url.clone())),
            Box::new(RestMetadataProvider::new(config.metadata_fallback_url.clone())),
            Arc::clone(&store_conn),
            db.clone(),
            mint_meta.clone(),
        )
        .run(shutdown_rx.clone()),
    );

    // WebSocket gateway
    let gateway_port = cli.gateway_port.unwrap_or(config.gateway_port);
    tokio::spawn(
        WebSocketGateway::new(gateway_port, Arc::clone(&router)).run(shutdown_rx.clone()),
    );

    // Frame channel feeding the parser worker pool
    let (frame_tx, frame_rx) = mpsc::channel::<SessionFrame>(4_096);
    let frame_rx = Arc::new(tokio::sync::Mutex::new(frame_rx));

    // Stream sessions: confirmed for trade monitoring, finalized for
    // critical operations
    let supervisor = Arc::new(StreamSupervisor::new(Arc::clone(&router)));
    let recovery_store = CheckpointStore::new(&config.checkpoint_path);
    let (replay_tx, mut replay_rx) = mpsc::channel::<ReplayCommand>(64);
    let recovery = Arc::new(RecoveryManager::new(
        Arc::clone(&config),
        recovery_store,
        db.clone(),
        replay_tx,
    ));

    let resume_points = recovery.load_resume_points().unwrap_or_default();
    let resume_for = |id: &str| {
        resume_points
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.last_slot + 1)
    };

    let programs = vec![
        constants::BONDING_CURVE_PROGRAM_ID.to_string(),
        constants::AMM_PROGRAM_ID.to_string(),
    ];
    let grpc_factory: SourceFactory = Arc::new(|config: &ConnectionConfig| {
        Box::new(GrpcFrameSource::new(config.clone())) as Box<dyn token_lifecycle_indexer::FrameSource>
    });

    let mut parse_trackers: HashMap<String, ParseRateTracker> = HashMap::new();
    let tip_slot = Arc::new(AtomicU64::new(0));

    for (id, commitment) in [
        ("trades-confirmed", Commitment::Confirmed),
        ("critical-finalized", Commitment::Finalized),
    ] {
        let connection = ConnectionConfig {
            id: id.to_string(),
            endpoint: config.stream_endpoint.clone(),
            token: config.stream_token.clone(),
            programs: Arc::new(RwLock::new(programs.clone())),
            commitment,
        };
        let session = StreamSession::new(connection, Arc::clone(&grpc_factory))
            .with_resume_slot(resume_for(id));
        parse_trackers.insert(id.to_string(), session.parse_rate_tracker());
        supervisor.register(&session);
        tokio::spawn(session.run(frame_tx.clone(), shutdown_rx.clone()));
    }

    // Parser worker pool sized to logical CPUs
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    info!("⚙️ Starting {} parser workers", workers);
    for _ in 0..workers {
        let frame_rx = Arc::clone(&frame_rx);
        let decoder = Arc::clone(&decoder);
        let parser = Arc::clone(&parser);
        let pipeline = Arc::clone(&pipeline);
        let trackers = parse_trackers.clone();
        let tip_slot = Arc::clone(&tip_slot);
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut rx = frame_rx.lock().await;
                    rx.recv().await
                };
                let Some(frame) = frame else {
                    return;
                };
                let Some(decoded) = decoder.decode(frame.payload) else {
                    continue;
                };
                match decoded {
                    DecodedFrame::Transaction(tx) => {
                        tip_slot.fetch_max(tx.slot, Ordering::SeqCst);
                        let outcome = parser.parse(&tx);
                        if let Some(tracker) = trackers.get(&frame.connection_id) {
                            match outcome.verdict {
                                SignatureVerdict::Parsed(_) => tracker.record(true),
                                SignatureVerdict::Rejected => tracker.record(false),
                                SignatureVerdict::Unrelated => {}
                            }
                        }
                        for event in outcome.events {
                            pipeline.process(event).await;
                        }
                    }
                    DecodedFrame::Account(update) => {
                        if let Some(state) = parser.parse_curve_account(&update) {
                            pipeline.process_curve_account(&state, update.slot, chrono::Utc::now());
                        }
                    }
                    DecodedFrame::BlockMeta { .. } => {}
                }
            }
        });
    }

    // Recovery: startup gap replay, periodic checkpoints, gap watching
    if let Some(range) = cli.replay.as_deref() {
        if let Some((from, to)) = parse_replay_range(range) {
            recovery.open_replay(from, to, "operator requested replay").await;
        } else {
            warn!("⏪ Ignoring malformed --replay {}", range);
        }
    }
    {
        // Give the sessions a moment to learn the live tip, then close
        // any checkpoint gap
        let recovery = Arc::clone(&recovery);
        let resume_points = resume_points.clone();
        let tip_slot = Arc::clone(&tip_slot);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            let tip = tip_slot.load(Ordering::SeqCst);
            if tip > 0 {
                recovery.schedule_startup_replays(&resume_points, tip).await;
            }
        });
    }
    tokio::spawn(Arc::clone(&recovery).run(
        Arc::clone(&supervisor),
        Arc::clone(&pipeline),
        shutdown_rx.clone(),
    ));

    // Replay executor: bounded catch-up connections driven by intent
    // messages from the recovery manager
    {
        let config = Arc::clone(&config);
        let recovery = Arc::clone(&recovery);
        let frame_tx = frame_tx.clone();
        let grpc_factory = Arc::clone(&grpc_factory);
        tokio::spawn(async move {
            while let Some(command) = replay_rx.recv().await {
                recovery.update_request(
                    &command.request_id,
                    command.from_slot,
                    command.to_slot,
                    RequestStatus::Processing,
                    None,
                );
                let result = run_replay(
                    &config,
                    &grpc_factory,
                    &command,
                    frame_tx.clone(),
                )
                .await;
                match result {
                    Ok(frames) => {
                        info!(
                            "⏪ Replay {} completed ({} frames)",
                            command.request_id, frames
                        );
                        recovery.update_request(
                            &command.request_id,
                            command.from_slot,
                            command.to_slot,
                            RequestStatus::Completed,
                            None,
                        );
                    }
                    Err(e) => {
                        error!("⏪ Replay {} failed: {}", command.request_id, e);
                        recovery.update_request(
                            &command.request_id,
                            command.from_slot,
                            command.to_slot,
                            RequestStatus::Failed,
                            Some(&e.to_string()),
                        );
                    }
                }
            }
        });
    }

    // Supervision, maintenance and roll-ups
    let emergency_exit = spawn_supervision(
        Arc::clone(&supervisor),
        Arc::clone(&lifecycle),
        Arc::clone(&pools),
        Arc::clone(&fees),
        mint_meta.clone(),
        Arc::clone(&store_conn),
        Arc::clone(&config),
        shutdown_rx.clone(),
    );

    info!("🚀 Indexer running (gateway on port {})", gateway_port);

    // Wait for ctrl-c or an irrecoverable stream
    let exit_code = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutdown requested");
            ExitCode::SUCCESS
        }
        _ = emergency_exit => {
            error!("❌ Stream irrecoverable after maximum restart attempts");
            ExitCode::from(2)
        }
    };

    // Cancel workers; the flusher drains its queue within the grace
    // period and recovery persists a final checkpoint
    let _ = shutdown_tx.send(true);
    drop(frame_tx);
    drop(db);
    drop(pipeline);
    drop(lifecycle);
    drop(recovery);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), flusher).await;

    Ok(exit_code)
}

fn parse_replay_range(raw: &str) -> Option<(u64, u64)> {
    let (from, to) = raw.split_once(':')?;
    let from = from.trim().parse().ok()?;
    let to = to.trim().parse().ok()?;
    (from <= to).then_some((from, to))
}

/// Drive one bounded replay subscription until it passes `to_slot`
async fn run_replay(
    config: &IndexerConfig,
    factory: &SourceFactory,
    command: &ReplayCommand,
    frames: mpsc::Sender<SessionFrame>,
) -> Result<u64> {
    use token_lifecycle_indexer::FrameSource;

    let connection = ConnectionConfig {
        id: format!("replay-{}", command.request_id),
        endpoint: config.stream_endpoint.clone(),
        token: config.stream_token.clone(),
        programs: Arc::new(RwLock::new(vec![
            constants::BONDING_CURVE_PROGRAM_ID.to_string(),
            constants::AMM_PROGRAM_ID.to_string(),
        ])),
        commitment: Commitment::Finalized,
    };
    let mut source = factory(&connection);
    source.connect(Some(command.from_slot)).await?;

    let mut forwarded = 0u64;
    loop {
        let Some(payload) = source.next_frame().await? else {
            return Ok(forwarded);
        };
        let past_range = match &payload {
            FramePayload::GrpcTransaction(tx) => tx.slot > command.to_slot,
            FramePayload::GrpcBlockMeta(meta) => meta.slot > command.to_slot,
            _ => false,
        };
        if past_range {
            return Ok(forwarded);
        }
        forwarded += 1;
        if frames
            .send(SessionFrame {
                connection_id: connection.id.clone(),
                payload,
            })
            .await
            .is_err()
        {
            return Ok(forwarded);
        }
    }
}

/// Supervisor tick plus periodic maintenance. The returned future
/// resolves only when the stream is declared irrecoverable.
#[allow(clippy::too_many_arguments)]
fn spawn_supervision(
    supervisor: Arc<StreamSupervisor>,
    lifecycle: Arc<LifecycleEngine>,
    pools: Arc<AmmPoolRegistry>,
    fees: Arc<FeeService>,
    mint_meta: TokenMetadataCache,
    store_conn: Arc<parking_lot::Mutex<rusqlite::Connection>>,
    config: Arc<IndexerConfig>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut supervise_tick = tokio::time::interval(std::time::Duration::from_secs(5));
        let mut sweep_tick = tokio::time::interval(std::time::Duration::from_secs(60));
        let mut hourly_tick = tokio::time::interval(std::time::Duration::from_secs(3_600));
        let mut daily_tick = tokio::time::interval(std::time::Duration::from_secs(86_400));
        let mut consecutive_emergencies = 0u32;
        let mut shutdown = shutdown;

        loop {
            tokio::select! {
                _ = supervise_tick.tick() => {
                    if supervisor.supervise() {
                        consecutive_emergencies += 1;
                        if consecutive_emergencies >= constants::MAX_STREAM_RESTART_ATTEMPTS {
                            return; // resolves the emergency future -> exit 2
                        }
                    } else {
                        consecutive_emergencies = 0;
                    }
                }
                _ = sweep_tick.tick() => {
                    let abandoned = lifecycle.sweep_abandoned(
                        config.abandonment_window,
                        config.abandonment_min_trades,
                    );
                    if !abandoned.is_empty() {
                        info!("🪦 {} tokens abandoned", abandoned.len());
                    }
                    lifecycle.sweep_pending(std::time::Duration::from_millis(
                        constants::GRADUATION_RESOLUTION_WINDOW_MS,
                    ));
                    lifecycle.prune(constants::MINT_CACHE_CEILING);
                    pools.prune(constants::POOL_CACHE_CEILING);
                    mint_meta.prune(constants::MINT_CACHE_CEILING);
                    fees.prune_before(
                        chrono::Utc::now().date_naive() - chrono::Duration::days(7),
                    );
                }
                _ = hourly_tick.tick() => {
                    let conn = store_conn.lock();
                    if let Err(e) = database_writer::run_hourly_rollup(&conn) {
                        warn!("📈 Hourly rollup failed: {}", e);
                    }
                }
                _ = daily_tick.tick() => {
                    let conn = store_conn.lock();
                    if let Err(e) = database_writer::run_daily_rollup(&conn) {
                        warn!("📈 Daily rollup failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Keep the emergency future pending through
                        // shutdown so the select in run() exits via ctrl-c
                        futures::future::pending::<()>().await;
                    }
                }
            }
        }
    })
}
