//! Storage Metrics
//!
//! Increment-only Prometheus counters for the read path plus a latency
//! histogram for `next`. Everything here is fire-and-forget: metric errors
//! never surface into storage results.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Registry holding all storage metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Cursor seeks issued by skip-scan iterators.
    pub static ref SEEKS_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_seeks_total",
        "Total cursor seeks issued by iterators"
    ).expect("metric can be created");

    /// `next` calls served.
    pub static ref NEXT_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_next_total",
        "Total iterator next calls"
    ).expect("metric can be created");

    /// Messages yielded to callers.
    pub static ref HITS_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_hits_total",
        "Total messages yielded by iterators"
    ).expect("metric can be created");

    /// Alignment misses: rounds where cursors disagreed and skipped forward.
    pub static ref MISSES_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_misses_total",
        "Total skip-scan rounds where cursors disagreed"
    ).expect("metric can be created");

    /// Candidates rejected after a truncated-hash collision.
    pub static ref COLLISIONS_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_hash_collisions_total",
        "Total index hash collisions rejected on final match"
    ).expect("metric can be created");

    /// Streams that reported end-of-stream.
    pub static ref EOS_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_end_of_stream_total",
        "Total end-of-stream results"
    ).expect("metric can be created");

    /// Reads stopped at the safe horizon `t_max`.
    pub static ref FUTURE_TOTAL: IntCounter = IntCounter::new(
        "mqtthouse_storage_future_total",
        "Total reads gated by the shard watermark"
    ).expect("metric can be created");

    /// Latency of `next` in seconds.
    pub static ref NEXT_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mqtthouse_storage_next_latency_seconds",
            "Iterator next latency in seconds"
        )
        .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0])
    ).expect("metric can be created");
}

/// Register all metrics with [`REGISTRY`]. Idempotent.
pub fn init() {
    INIT.call_once(|| {
        let _ = REGISTRY.register(Box::new(SEEKS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(NEXT_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(HITS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(MISSES_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(COLLISIONS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(EOS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(FUTURE_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(NEXT_LATENCY.clone()));
    });
}
