//! Stream Session
//!
//! Owns the upstream geyser subscription. Each connection runs the state
//! machine `Connecting → Healthy → Degraded → Backoff → Failed →
//! HalfOpen`, with exponential backoff between reconnects and a circuit
//! breaker over repeated failures. The supervisor reassigns a failed
//! connection's subscription set to a healthy sibling and raises an
//! emergency alert when none exists.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use yellowstone_grpc_client::{ClientTlsConfig, GeyserGrpcClient};
use yellowstone_grpc_proto::geyser::{
    subscribe_update::UpdateOneof, CommitmentLevel, SubscribeRequest,
    SubscribeRequestFilterAccounts, SubscribeRequestFilterBlocksMeta,
    SubscribeRequestFilterTransactions, SubscribeRequestPing, SubscribeUpdate,
};

use crate::constants::{
    CIRCUIT_BREAKER_THRESHOLD, CIRCUIT_RECOVERY_TIMEOUT, HALF_OPEN_PROBE_SUCCESSES,
    PARSE_RATE_FLOOR, PARSE_RATE_WINDOW, RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY,
};
use crate::metrics;
use crate::wire_decoder::FramePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Healthy,
    Degraded,
    Backoff,
    Failed,
    HalfOpen,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Failed => "failed",
            ConnectionState::HalfOpen => "half_open",
        }
    }
}

/// Rolling window of parse outcomes the worker pool reports back into
#[derive(Clone, Default)]
pub struct ParseRateTracker {
    window: Arc<Mutex<VecDeque<bool>>>,
}

impl ParseRateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, parsed: bool) {
        let mut window = self.window.lock();
        window.push_back(parsed);
        while window.len() > PARSE_RATE_WINDOW {
            window.pop_front();
        }
    }

    /// Parse rate over the window; 1.0 until the window fills
    pub fn rate(&self) -> f64 {
        let window = self.window.lock();
        if window.len() < PARSE_RATE_WINDOW {
            return 1.0;
        }
        window.iter().filter(|&&b| b).count() as f64 / window.len() as f64
    }
}

/// A frame tagged with its producing connection
#[derive(Debug)]
pub struct SessionFrame {
    pub connection_id: String,
    pub payload: FramePayload,
}

/// Pluggable source so the state machine is testable without a network
#[async_trait]
pub trait FrameSource: Send {
    async fn connect(&mut self, from_slot: Option<u64>) -> Result<()>;
    /// `Ok(None)` means the stream ended cleanly
    async fn next_frame(&mut self) -> Result<Option<FramePayload>>;
}

pub type SourceFactory =
    Arc<dyn Fn(&ConnectionConfig) -> Box<dyn FrameSource> + Send + Sync>;

#[derive(Debug, Clone)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

#[derive(Clone)]
pub struct ConnectionConfig {
    pub id: String,
    pub endpoint: String,
    pub token: Option<String>,
    /// Program include list; shared so failover can extend it
    pub programs: Arc<RwLock<Vec<String>>>,
    pub commitment: Commitment,
}

type GrpcSink =
    Box<dyn Sink<SubscribeRequest, Error = futures::channel::mpsc::SendError> + Send + Unpin>;
type GrpcStream =
    Pin<Box<dyn Stream<Item = Result<SubscribeUpdate, tonic::Status>> + Send>>;

/// Production source speaking the geyser gRPC protocol
pub struct GrpcFrameSource {
    config: ConnectionConfig,
    sink: Option<GrpcSink>,
    stream: Option<GrpcStream>,
}

impl GrpcFrameSource {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            sink: None,
            stream: None,
        }
    }

    fn subscription_request(&self, from_slot: Option<u64>) -> SubscribeRequest {
        let commitment = match self.config.commitment {
            Commitment::Processed => CommitmentLevel::Processed,
            Commitment::Confirmed => CommitmentLevel::Confirmed,
            Commitment::Finalized => CommitmentLevel::Finalized,
        };

        let mut transactions = HashMap::new();
        transactions.insert(
            "programs".to_string(),
            SubscribeRequestFilterTransactions {
                vote: Some(false),
                failed: Some(false),
                signature: None,
                account_include: self.config.programs.read().clone(),
                account_exclude: Vec::new(),
                account_required: Vec::new(),
            },
        );

        // Curve accounts carry the `complete` flag that marks migration
        let mut accounts = HashMap::new();
        accounts.insert(
            "program_accounts".to_string(),
            SubscribeRequestFilterAccounts {
                owner: self.config.programs.read().clone(),
                ..Default::default()
            },
        );

        let mut blocks_meta = HashMap::new();
        blocks_meta.insert(
            "meta".to_string(),
            SubscribeRequestFilterBlocksMeta::default(),
        );

        SubscribeRequest {
            accounts,
            transactions,
            blocks_meta,
            commitment: Some(commitment as i32),
            from_slot,
            ..Default::default()
        }
    }
}

#[async_trait]
impl FrameSource for GrpcFrameSource {
    async fn connect(&mut self, from_slot: Option<u64>) -> Result<()> {
        let mut builder = GeyserGrpcClient::build_from_shared(self.config.endpoint.clone())?
            .tls_config(ClientTlsConfig::new().with_native_roots())?;
        if let Some(token) = &self.config.token {
            builder = builder.x_token(Some(token.clone()))?;
        }
        let mut client = builder.connect().await?;

        let request = self.subscription_request(from_slot);
        let (sink, stream) = client.subscribe_with_request(Some(request)).await?;
        self.sink = Some(Box::new(sink));
        self.stream = Some(Box::pin(stream));
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<FramePayload>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("stream not connected"))?;

        loop {
            let Some(message) = stream.next().await else {
                return Ok(None);
            };
            let update = message?;
            match update.update_oneof {
                Some(UpdateOneof::Transaction(tx)) => {
                    return Ok(Some(FramePayload::GrpcTransaction(tx)));
                }
                Some(UpdateOneof::Account(account)) => {
                    return Ok(Some(FramePayload::GrpcAccount(account)));
                }
                Some(UpdateOneof::BlockMeta(meta)) => {
                    return Ok(Some(FramePayload::GrpcBlockMeta(meta)));
                }
                Some(UpdateOneof::Ping(_)) => {
                    // Heartbeat: answer on the subscription channel
                    if let Some(sink) = self.sink.as_mut() {
                        let pong = SubscribeRequest {
                            ping: Some(SubscribeRequestPing { id: 1 }),
                            ..Default::default()
                        };
                        if let Err(e) = sink.send(pong).await {
                            warn!("📡 Failed to answer ping: {}", e);
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

/// One connection's state machine
pub struct StreamSession {
    config: ConnectionConfig,
    factory: SourceFactory,
    state: Arc<RwLock<ConnectionState>>,
    parse_rate: ParseRateTracker,
    last_slot: Arc<AtomicU64>,
    consecutive_failures: u32,
    backoff_attempt: u32,
    resume_from: Option<u64>,
}

impl StreamSession {
    pub fn new(config: ConnectionConfig, factory: SourceFactory) -> Self {
        Self {
            config,
            factory,
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            parse_rate: ParseRateTracker::new(),
            last_slot: Arc::new(AtomicU64::new(0)),
            consecutive_failures: 0,
            backoff_attempt: 0,
            resume_from: None,
        }
    }

    pub fn with_resume_slot(mut self, slot: Option<u64>) -> Self {
        self.resume_from = slot;
        self
    }

    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        Arc::clone(&self.state)
    }

    pub fn parse_rate_tracker(&self) -> ParseRateTracker {
        self.parse_rate.clone()
    }

    pub fn last_slot_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.last_slot)
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.write();
        if *current != state {
            info!(
                "📡 Connection {}: {} -> {}",
                self.config.id,
                current.as_str(),
                state.as_str()
            );
            *current = state;
        }
    }

    /// Drive the connection until shutdown. Internal recovery handles
    /// every state; the loop only returns on shutdown.
    pub async fn run(
        mut self,
        frames: mpsc::Sender<SessionFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let current = *self.state.read();
            match current {
                ConnectionState::Connecting | ConnectionState::HalfOpen => {
                    let probing = current == ConnectionState::HalfOpen;
                    let mut source = (self.factory)(&self.config);
                    let from_slot = self.resume_from.take();

                    match source.connect(from_slot).await {
                        Ok(()) => {
                            if let Err(state) = self
                                .pump(source.as_mut(), probing, &frames, &mut shutdown)
                                .await
                            {
                                self.on_stream_failure(state);
                            } else {
                                return; // shutdown
                            }
                        }
                        Err(e) => {
                            warn!("📡 Connection {} failed to open: {}", self.config.id, e);
                            self.on_stream_failure(current);
                        }
                    }
                }
                ConnectionState::Backoff => {
                    let delay = RECONNECT_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(self.backoff_attempt))
                        .min(RECONNECT_MAX_DELAY);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.set_state(ConnectionState::Connecting);
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                ConnectionState::Failed => {
                    tokio::select! {
                        _ = tokio::time::sleep(CIRCUIT_RECOVERY_TIMEOUT) => {
                            self.set_state(ConnectionState::HalfOpen);
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                ConnectionState::Healthy | ConnectionState::Degraded => {
                    // Unreachable outside pump(); normalize
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    /// Read frames until error or shutdown. `Err` carries the state at
    /// the moment of failure; `Ok` means shutdown was requested.
    async fn pump(
        &mut self,
        source: &mut dyn FrameSource,
        probing: bool,
        frames: &mpsc::Sender<SessionFrame>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConnectionState> {
        let mut probe_successes = 0u32;
        let mut first_frame = true;

        loop {
            let frame = tokio::select! {
                frame = source.next_frame() => frame,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
            };

            match frame {
                Ok(Some(payload)) => {
                    if first_frame {
                        first_frame = false;
                        if !probing {
                            self.set_state(ConnectionState::Healthy);
                            self.consecutive_failures = 0;
                            self.backoff_attempt = 0;
                        }
                    }
                    if probing {
                        probe_successes += 1;
                        if probe_successes >= HALF_OPEN_PROBE_SUCCESSES {
                            self.set_state(ConnectionState::Healthy);
                            self.consecutive_failures = 0;
                            self.backoff_attempt = 0;
                        }
                    }

                    if let FramePayload::GrpcTransaction(tx) = &payload {
                        self.observe_slot(tx.slot);
                    }

                    let frame = SessionFrame {
                        connection_id: self.config.id.clone(),
                        payload,
                    };
                    if frames.send(frame).await.is_err() {
                        return Ok(()); // processing side went away
                    }

                    // Parse-rate driven degradation
                    let state = *self.state.read();
                    let rate = self.parse_rate.rate();
                    if state == ConnectionState::Healthy && rate < PARSE_RATE_FLOOR {
                        warn!(
                            "📡 Connection {} degraded: parse rate {:.2}",
                            self.config.id, rate
                        );
                        self.set_state(ConnectionState::Degraded);
                    } else if state == ConnectionState::Degraded && rate >= PARSE_RATE_FLOOR {
                        self.set_state(ConnectionState::Healthy);
                    }
                }
                Ok(None) => {
                    warn!("📡 Connection {} stream ended", self.config.id);
                    return Err(*self.state.read());
                }
                Err(e) => {
                    warn!("📡 Connection {} stream error: {}", self.config.id, e);
                    return Err(*self.state.read());
                }
            }
        }
    }

    fn observe_slot(&self, slot: u64) {
        let previous = self.last_slot.fetch_max(slot, Ordering::SeqCst);
        if slot > previous {
            metrics::CURRENT_SLOT.set(slot as f64);
        }
    }

    fn on_stream_failure(&mut self, state_at_failure: ConnectionState) {
        self.consecutive_failures += 1;
        // Resume from the last processed slot on the next connect
        let slot = self.last_slot.load(Ordering::SeqCst);
        if slot > 0 {
            self.resume_from = Some(slot + 1);
        }

        match state_at_failure {
            ConnectionState::HalfOpen => {
                // One probe failure re-opens the circuit
                self.set_state(ConnectionState::Failed);
            }
            ConnectionState::Degraded => {
                self.set_state(ConnectionState::Failed);
            }
            _ => {
                if self.consecutive_failures >= CIRCUIT_BREAKER_THRESHOLD {
                    error!(
                        "📡 Connection {} circuit open after {} failures",
                        self.config.id, self.consecutive_failures
                    );
                    self.set_state(ConnectionState::Failed);
                } else {
                    self.backoff_attempt = self.backoff_attempt.saturating_add(1);
                    self.set_state(ConnectionState::Backoff);
                }
            }
        }
    }
}

/// Snapshot used for checkpointing
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub last_slot: u64,
    pub state: ConnectionState,
    pub subscriptions: Vec<String>,
}

struct SupervisedConnection {
    config: ConnectionConfig,
    state: Arc<RwLock<ConnectionState>>,
    last_slot: Arc<AtomicU64>,
    failed_over: bool,
}

/// Watches connection state and performs failover
pub struct StreamSupervisor {
    connections: Mutex<Vec<SupervisedConnection>>,
    router: Arc<crate::event_router::EventRouter>,
}

impl StreamSupervisor {
    pub fn new(router: Arc<crate::event_router::EventRouter>) -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
            router,
        }
    }

    pub fn register(&self, session: &StreamSession) {
        self.connections.lock().push(SupervisedConnection {
            config: session.config.clone(),
            state: session.state_handle(),
            last_slot: session.last_slot_handle(),
            failed_over: false,
        });
    }

    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.connections
            .lock()
            .iter()
            .map(|c| ConnectionSnapshot {
                id: c.config.id.clone(),
                last_slot: c.last_slot.load(Ordering::SeqCst),
                state: *c.state.read(),
                subscriptions: c.config.programs.read().clone(),
            })
            .collect()
    }

    /// True when at least one connection is serving frames
    pub fn any_healthy(&self) -> bool {
        self.connections.lock().iter().any(|c| {
            matches!(
                *c.state.read(),
                ConnectionState::Healthy | ConnectionState::Degraded
            )
        })
    }

    /// One supervision pass: move failed connections' subscriptions onto
    /// a healthy sibling; raise an emergency when none exists.
    /// Returns true when a global recovery should be scheduled.
    pub fn supervise(&self) -> bool {
        let mut connections = self.connections.lock();

        let healthy_index = connections.iter().position(|c| {
            matches!(
                *c.state.read(),
                ConnectionState::Healthy | ConnectionState::Degraded
            )
        });

        let mut emergency = false;
        for i in 0..connections.len() {
            let is_failed = *connections[i].state.read() == ConnectionState::Failed;
            if !is_failed {
                connections[i].failed_over = false;
                continue;
            }
            if connections[i].failed_over {
                continue;
            }

            let orphaned: Vec<String> = connections[i].config.programs.read().clone();
            match healthy_index {
                Some(h) if h != i => {
                    {
                        let mut target = connections[h].config.programs.write();
                        for program in orphaned {
                            if !target.contains(&program) {
                                target.push(program);
                            }
                        }
                    }
                    connections[i].failed_over = true;
                    info!(
                        "🔄 Failover: {} subscriptions reassigned to {}",
                        connections[i].config.id, connections[h].config.id
                    );
                }
                _ => {
                    emergency = true;
                }
            }
        }

        if emergency {
            error!("🚨 No healthy connection available for failover");
            self.router.queue(crate::events::IndexerEvent::MonitorAlert {
                kind: "emergency".to_string(),
                detail: "no healthy upstream connection".to_string(),
                emitted_at: chrono::Utc::now(),
            });
        }
        emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yellowstone_grpc_proto::geyser::SubscribeUpdateBlockMeta;

    /// Scripted source: a list of connect results, each with a frame
    /// budget before erroring
    struct MockSource {
        script: Arc<Mutex<VecDeque<MockConnection>>>,
    }

    struct MockConnection {
        connect_ok: bool,
        frames: usize,
    }

    #[async_trait]
    impl FrameSource for MockSource {
        async fn connect(&mut self, _from_slot: Option<u64>) -> Result<()> {
            let mut script = self.script.lock();
            let accepts = script.front().map(|c| c.connect_ok).unwrap_or(false);
            if accepts {
                Ok(())
            } else {
                script.pop_front();
                Err(anyhow!("mock connect refused"))
            }
        }

        async fn next_frame(&mut self) -> Result<Option<FramePayload>> {
            let mut script = self.script.lock();
            let frames_left = match script.front() {
                Some(conn) => conn.frames,
                None => return Err(anyhow!("mock stream error")),
            };
            if frames_left == 0 {
                script.pop_front();
                return Err(anyhow!("mock stream error"));
            }
            if let Some(conn) = script.front_mut() {
                conn.frames -= 1;
            }
            Ok(Some(FramePayload::GrpcBlockMeta(
                SubscribeUpdateBlockMeta::default(),
            )))
        }
    }

    fn session_with_script(script: Vec<MockConnection>) -> StreamSession {
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let factory: SourceFactory = Arc::new(move |_config| {
            Box::new(MockSource {
                script: Arc::clone(&script),
            }) as Box<dyn FrameSource>
        });
        let config = ConnectionConfig {
            id: "conn-1".to_string(),
            endpoint: "http://localhost:10000".to_string(),
            token: None,
            programs: Arc::new(RwLock::new(vec!["prog1".to_string()])),
            commitment: Commitment::Confirmed,
        };
        StreamSession::new(config, factory)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_frame_moves_to_healthy() {
        let session = session_with_script(vec![MockConnection {
            connect_ok: true,
            frames: 5,
        }]);
        let state = session.state_handle();

        let (tx, mut rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session.run(tx, shutdown_rx));

        // First frame arrives
        let frame = rx.recv().await.expect("frame");
        assert_eq!(frame.connection_id, "conn-1");
        assert_eq!(*state.read(), ConnectionState::Healthy);

        shutdown_tx.send(true).unwrap();
        drop(rx);
        let _ = task.await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_open_circuit() {
        // Every connect refused: failures accumulate through Backoff
        // until the circuit opens
        let script: Vec<MockConnection> = (0..CIRCUIT_BREAKER_THRESHOLD + 1)
            .map(|_| MockConnection {
                connect_ok: false,
                frames: 0,
            })
            .collect();
        let session = session_with_script(script);
        let state = session.state_handle();

        let (tx, _rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(session.run(tx, shutdown_rx));

        tokio::time::timeout(std::time::Duration::from_secs(600), async {
            loop {
                if *state.read() == ConnectionState::Failed {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("circuit opened");

        shutdown_tx.send(true).unwrap();
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_parse_rate_tracker_window() {
        let tracker = ParseRateTracker::new();
        // Under-filled window reads as fully parsed
        tracker.record(false);
        assert_eq!(tracker.rate(), 1.0);

        for _ in 0..PARSE_RATE_WINDOW {
            tracker.record(false);
        }
        assert_eq!(tracker.rate(), 0.0);

        for _ in 0..PARSE_RATE_WINDOW {
            tracker.record(true);
        }
        assert_eq!(tracker.rate(), 1.0);
    }

    #[tokio::test]
    async fn test_failover_reassigns_subscriptions() {
        let router = Arc::new(crate::event_router::EventRouter::new());
        let supervisor = StreamSupervisor::new(router);

        let healthy = session_with_script(vec![]);
        *healthy.state_handle().write() = ConnectionState::Healthy;
        let failed = {
            let script = Arc::new(Mutex::new(VecDeque::new()));
            let factory: SourceFactory = Arc::new(move |_config| {
                Box::new(MockSource {
                    script: Arc::clone(&script),
                }) as Box<dyn FrameSource>
            });
            let config = ConnectionConfig {
                id: "conn-2".to_string(),
                endpoint: "http://localhost:10001".to_string(),
                token: None,
                programs: Arc::new(RwLock::new(vec!["prog2".to_string()])),
                commitment: Commitment::Confirmed,
            };
            StreamSession::new(config, factory)
        };
        *failed.state_handle().write() = ConnectionState::Failed;

        supervisor.register(&healthy);
        supervisor.register(&failed);

        let emergency = supervisor.supervise();
        assert!(!emergency);
        assert!(healthy
            .config
            .programs
            .read()
            .contains(&"prog2".to_string()));

        // Second pass does not duplicate the reassignment
        supervisor.supervise();
        let count = healthy
            .config
            .programs
            .read()
            .iter()
            .filter(|p| *p == "prog2")
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_emergency_when_no_healthy_connection() {
        let router = Arc::new(crate::event_router::EventRouter::new());
        let supervisor = StreamSupervisor::new(router);

        let failed = session_with_script(vec![]);
        *failed.state_handle().write() = ConnectionState::Failed;
        supervisor.register(&failed);

        assert!(supervisor.supervise());
    }
}
