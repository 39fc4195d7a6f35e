use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Ingest Metrics
    // ============================================================================

    /// Total NAL records appended to a live chunk
    pub static ref NALS_APPENDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_nals_appended_total", "Total NAL records appended"),
        &["rate"]
    ).expect("metric can be created");

    /// Total encoded record bytes appended
    pub static ref BYTES_APPENDED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_bytes_appended_total", "Total record bytes appended"),
        &["rate"]
    ).expect("metric can be created");

    /// Records rejected at ingest (time going backwards, writer failures)
    pub static ref RECORDS_REJECTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_records_rejected_total", "Total NAL records rejected"),
        &["rate", "reason"]
    ).expect("metric can be created");

    // ============================================================================
    // Chunk Lifecycle Metrics
    // ============================================================================

    /// Chunks finalized by rotation
    pub static ref CHUNKS_FINALIZED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_chunks_finalized_total", "Total chunks finalized"),
        &["rate"]
    ).expect("metric can be created");

    /// Chunks exported to the next tier
    pub static ref CHUNKS_EXPORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_chunks_exported_total", "Total chunks exported to a colder tier"),
        &["rate", "tier"]
    ).expect("metric can be created");

    /// Chunks permanently deleted from the last tier
    pub static ref CHUNKS_DELETED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_chunks_deleted_total", "Total chunks deleted"),
        &["rate", "tier"]
    ).expect("metric can be created");

    /// Chunk recoveries by outcome (index_ok, rescanned, skipped)
    pub static ref CHUNK_RECOVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_chunk_recoveries_total", "Total chunk recoveries on startup"),
        &["outcome"]
    ).expect("metric can be created");

    /// Bytes held by each tier (excluding chunks already moved out)
    pub static ref TIER_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("framehouse_tier_bytes", "Bytes stored per tier"),
        &["rate", "tier"]
    ).expect("metric can be created");

    // ============================================================================
    // Read Metrics
    // ============================================================================

    /// Latency of chunk reads
    pub static ref READ_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("framehouse_read_latency_seconds", "Chunk read latency in seconds")
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["tier"]
    ).expect("metric can be created");

    /// Reads that ended through cancellation
    pub static ref READS_CANCELLED_TOTAL: IntCounter = IntCounter::new(
        "framehouse_reads_cancelled_total",
        "Total reads cancelled before completion"
    ).expect("metric can be created");

    // ============================================================================
    // Cache Metrics
    // ============================================================================

    /// Cache hits, by cache name (muxed, blob)
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_cache_hits_total", "Total cache hits"),
        &["cache"]
    ).expect("metric can be created");

    /// Cache misses, by cache name
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("framehouse_cache_misses_total", "Total cache misses"),
        &["cache"]
    ).expect("metric can be created");

    /// Bytes currently held by the muxed output cache
    pub static ref MUXED_CACHE_BYTES: IntGauge = IntGauge::new(
        "framehouse_muxed_cache_bytes",
        "Bytes held by the muxed video cache"
    ).expect("metric can be created");

    /// Number of active rate pipelines
    pub static ref RATES_ACTIVE: IntGauge = IntGauge::new(
        "framehouse_rates_active",
        "Number of rates with a storage pipeline"
    ).expect("metric can be created");
}

/// Register every metric with `REGISTRY`. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(NALS_APPENDED_TOTAL.clone()))
            .expect("nals_appended_total can be registered");
        REGISTRY
            .register(Box::new(BYTES_APPENDED_TOTAL.clone()))
            .expect("bytes_appended_total can be registered");
        REGISTRY
            .register(Box::new(RECORDS_REJECTED_TOTAL.clone()))
            .expect("records_rejected_total can be registered");

        REGISTRY
            .register(Box::new(CHUNKS_FINALIZED_TOTAL.clone()))
            .expect("chunks_finalized_total can be registered");
        REGISTRY
            .register(Box::new(CHUNKS_EXPORTED_TOTAL.clone()))
            .expect("chunks_exported_total can be registered");
        REGISTRY
            .register(Box::new(CHUNKS_DELETED_TOTAL.clone()))
            .expect("chunks_deleted_total can be registered");
        REGISTRY
            .register(Box::new(CHUNK_RECOVERIES_TOTAL.clone()))
            .expect("chunk_recoveries_total can be registered");
        REGISTRY
            .register(Box::new(TIER_BYTES.clone()))
            .expect("tier_bytes can be registered");

        REGISTRY
            .register(Box::new(READ_LATENCY.clone()))
            .expect("read_latency can be registered");
        REGISTRY
            .register(Box::new(READS_CANCELLED_TOTAL.clone()))
            .expect("reads_cancelled_total can be registered");

        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("cache_misses_total can be registered");
        REGISTRY
            .register(Box::new(MUXED_CACHE_BYTES.clone()))
            .expect("muxed_cache_bytes can be registered");
        REGISTRY
            .register(Box::new(RATES_ACTIVE.clone()))
            .expect("rates_active can be registered");
    });
}
