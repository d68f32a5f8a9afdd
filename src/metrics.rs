//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Federation Metrics
    pub static ref ACTIVITIES_RECEIVED: IntCounterVec = IntCounterVec::new(
        Opts::new("solofed_activities_received_total", "Total number of verified activities received"),
        &["activity_type"]
    ).expect("metric can be created");
    pub static ref ACTIVITIES_SENT: IntCounterVec = IntCounterVec::new(
        Opts::new("solofed_activities_sent_total", "Total number of activity deliveries attempted"),
        &["activity_type", "outcome"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("solofed_federation_requests_total", "Total number of federation requests"),
        &["direction", "status"]
    ).expect("metric can be created");
    pub static ref FEDERATION_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "solofed_federation_request_duration_seconds",
            "Federation request duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["direction"]
    ).expect("metric can be created");

    // Key Metrics
    pub static ref KEY_PAIRS_GENERATED: IntCounter = IntCounter::new(
        "solofed_key_pairs_generated_total",
        "Total number of actor key pairs generated"
    ).expect("metric can be created");
    pub static ref PUBLIC_KEY_CACHE_HITS: IntCounterVec = IntCounterVec::new(
        Opts::new("solofed_public_key_cache_total", "Peer public key cache lookups"),
        &["result"]
    ).expect("metric can be created");

    // Application Metrics
    pub static ref FOLLOWERS_TOTAL: IntGauge = IntGauge::new(
        "solofed_followers_total",
        "Number of distinct followers at last listing"
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("solofed_errors_total", "Total number of errors returned to clients"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
///
/// Safe to call more than once; repeated registrations are ignored.
pub fn init_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVITIES_RECEIVED.clone()),
        Box::new(ACTIVITIES_SENT.clone()),
        Box::new(FEDERATION_REQUESTS_TOTAL.clone()),
        Box::new(FEDERATION_REQUEST_DURATION_SECONDS.clone()),
        Box::new(KEY_PAIRS_GENERATED.clone()),
        Box::new(PUBLIC_KEY_CACHE_HITS.clone()),
        Box::new(FOLLOWERS_TOTAL.clone()),
        Box::new(ERRORS_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(error) = REGISTRY.register(collector) {
            tracing::debug!(%error, "Metric already registered");
        }
    }

    tracing::info!("Metrics registry initialized");
}
