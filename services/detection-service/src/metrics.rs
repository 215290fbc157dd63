//! OpenTelemetry metrics for the detection pipeline, registered the way
//! `swarm-core::metrics_ext` registers its counters and histograms.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::global;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("detection"));

pub struct DetectionMetrics {
    pub tier_latency_ms: Histogram<f64>,
    pub anomalies_total: Counter<u64>,
    pub findings_total: Counter<u64>,
    pub breaker_trips_total: Counter<u64>,
    pub publish_total: Counter<u64>,
}

pub static METRICS: Lazy<DetectionMetrics> = Lazy::new(|| DetectionMetrics {
    tier_latency_ms: METER
        .f64_histogram("detection_tier_latency_ms")
        .with_description("Wall-clock latency of each pipeline tier")
        .with_unit("ms")
        .init(),
    anomalies_total: METER
        .u64_counter("detection_anomalies_total")
        .with_description("Anomalies produced by a detector or the ML manager")
        .init(),
    findings_total: METER
        .u64_counter("detection_findings_total")
        .with_description("Validated findings emitted per severity")
        .init(),
    breaker_trips_total: METER
        .u64_counter("detection_breaker_trips_total")
        .with_description("Circuit breaker CLOSED/HALF_OPEN -> OPEN transitions")
        .init(),
    publish_total: METER
        .u64_counter("detection_publish_total")
        .with_description("Publish attempts per bus and outcome")
        .init(),
});
