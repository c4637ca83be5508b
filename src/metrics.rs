//! Process-wide prometheus metrics
//!
//! Counters are registered once at startup; the hot path only increments.
//! The gateway exposes the registry as text for scrapers.

use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static INGEST_DECODE_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "ingest_decode_error",
        "Frames dropped because no payload shape matched",
    )
});

pub static PARSE_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "parse_failed",
        "Recognized instructions rejected during parsing",
    )
});

pub static EVENT_QUEUE_OVERFLOW: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "event_queue_overflow",
        "Router queue overflows (oldest event dropped)",
    )
});

pub static DLQ_WRITES: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("dlq_write", "Rows quarantined to the dead-letter table")
});

pub static THRESHOLD_CROSSINGS: Lazy<IntCounter> = Lazy::new(|| {
    register_counter(
        "threshold_crossings",
        "Mints that crossed the save threshold for the first time",
    )
});

pub static TRADES_PROCESSED: Lazy<IntCounterVec> = Lazy::new(|| {
    let vec = IntCounterVec::new(
        Opts::new("trades_processed", "Trades accepted by the pipeline"),
        &["program"],
    )
    .expect("metric definition");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("metric registration");
    vec
});

pub static REPLAYS_OPENED: Lazy<IntCounter> = Lazy::new(|| {
    register_counter("replays_opened", "Replay requests opened by recovery")
});

pub static CURRENT_SLOT: Lazy<Gauge> =
    Lazy::new(|| register_gauge("current_slot", "Highest slot observed on any connection"));

pub static DB_QUEUE_DEPTH: Lazy<Gauge> =
    Lazy::new(|| register_gauge("db_queue_depth", "Durability queue fill level"));

fn register_counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration");
    counter
}

fn register_gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("metric definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registration");
    gauge
}

/// Render the registry in the prometheus text exposition format
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
