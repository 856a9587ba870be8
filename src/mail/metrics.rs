//! Prometheus metrics for the mail queue

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Encoder, Gauge,
    HistogramVec, TextEncoder,
};

lazy_static! {
    /// Counter: events enqueued, split by whether they merged into a pending one
    pub static ref EVENTS_ENQUEUED: CounterVec = register_counter_vec!(
        "courier_mail_events_enqueued_total",
        "Mail events enqueued by mail type and outcome",
        &["mail_type", "outcome"]
    )
    .expect("Failed to create events_enqueued metric");

    /// Counter: drain results
    pub static ref EVENTS_PROCESSED: CounterVec = register_counter_vec!(
        "courier_mail_events_processed_total",
        "Mail events processed by status",
        &["status"]
    )
    .expect("Failed to create events_processed metric");

    /// Gauge: unsent, non-discarded events
    pub static ref QUEUE_DEPTH: Gauge = register_gauge!(
        "courier_mail_queue_depth",
        "Current depth of the mail queue"
    )
    .expect("Failed to create queue_depth metric");

    /// Histogram: drain duration (seconds)
    pub static ref DRAIN_DURATION: HistogramVec = register_histogram_vec!(
        "courier_mail_drain_duration_seconds",
        "Duration of mail queue drains",
        &["mode"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    )
    .expect("Failed to create drain_duration metric");
}

/// Record an enqueue; `merged` when it appended to a pending event
pub fn record_enqueue(mail_type: &str, merged: bool) {
    let outcome = if merged { "merged" } else { "created" };
    EVENTS_ENQUEUED
        .with_label_values(&[mail_type, outcome])
        .inc();
}

/// Record drained events by status (sent, failed, discarded, skipped)
pub fn record_processed(status: &str, count: usize) {
    EVENTS_PROCESSED
        .with_label_values(&[status])
        .inc_by(count as f64);
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_drain_duration(mode: &str, duration_secs: f64) {
    DRAIN_DURATION
        .with_label_values(&[mode])
        .observe(duration_secs);
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
