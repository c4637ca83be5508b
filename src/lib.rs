//! Real-time token lifecycle indexer
//!
//! This library provides:
//! - Geyser stream ingestion with circuit breaking and failover
//! - Instruction decoding for the bonding curve and AMM programs
//! - Reserve-based pricing and market cap derivation
//! - Per-mint lifecycle tracking (bonding, migrating, graduated)
//! - Batched idempotent persistence with checkpointed recovery
//! - In-process pub/sub with a WebSocket fan-out for subscribers

pub mod amm_pool_registry;
pub mod blocktime;
pub mod checkpoint_store;
pub mod config;
pub mod constants;
pub mod database_writer;
pub mod event_router;
pub mod events;
pub mod fee_service;
pub mod instruction_parser;
pub mod lifecycle_engine;
pub mod lp_calculator;
pub mod metadata_enricher;
pub mod metrics;
pub mod pricing_engine;
pub mod recovery_manager;
pub mod sol_price_feed;
pub mod stream_session;
pub mod token_metadata_cache;
pub mod trade_pipeline;
pub mod volume_tracker;
pub mod websocket_gateway;
pub mod wire_decoder;

// Re-export main types for convenience
pub use amm_pool_registry::{AmmPoolRegistry, LpChange, PoolState};
pub use blocktime::{normalize_block_time, SlotClock};
pub use checkpoint_store::{Checkpoint, CheckpointStore, ConnectionCheckpoint};
pub use config::{IndexerConfig, PostGraduationPriceSource};
pub use database_writer::{DatabaseWriter, DbHandle, PoolStateRow, TokenRow, WriteTask};
pub use event_router::{EventRouter, SubscriberHandle, TOPIC_ALL};
pub use events::{
    DecodedEvent, FeeEvent, FeeKind, GraduationEvent, IndexerEvent, LiquidityEvent,
    LiquidityKind, ParseConfidence, PoolCreatedEvent, PriceTag, Program, TokenCreateEvent,
    TradeEvent, TradeSide,
};
pub use fee_service::{FeeService, FeeTotals};
pub use instruction_parser::{CurveAccountState, InstructionParser, ParseOutcome, SignatureVerdict};
pub use lifecycle_engine::{LifecycleEngine, LifecyclePhase, MintState, PhaseRecord};
pub use lp_calculator::{ImpermanentLoss, LpCalculator, PositionValue};
pub use metadata_enricher::{
    GraphqlMetadataProvider, MetadataEnricher, MetadataProvider, RestMetadataProvider,
    TokenMetadata,
};
pub use pricing_engine::{isqrt, PricingEngine, SolUsdQuote, SupplySource};
pub use recovery_manager::{RecoveryManager, ReplayCommand, RequestStatus};
pub use sol_price_feed::{SolPriceCache, SolPriceFeed};
pub use stream_session::{
    Commitment, ConnectionConfig, ConnectionState, FrameSource, GrpcFrameSource,
    ParseRateTracker, SessionFrame, SourceFactory, StreamSession, StreamSupervisor,
};
pub use token_metadata_cache::{MintMeta, TokenMetadataCache};
pub use trade_pipeline::TradePipeline;
pub use volume_tracker::VolumeTracker;
pub use websocket_gateway::WebSocketGateway;
pub use wire_decoder::{
    AccountKey, DecodedFrame, FramePayload, RawAccountUpdate, RawInstruction, RawTokenBalance,
    RawTx, WireDecoder,
};
