//! Prometheus metrics for the consumer engine
//!
//! Every counter is labelled by topic so several consumers in one process
//! stay distinguishable.

use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};

// ============================================================================
// Receive Loop Metrics
// ============================================================================

pub static MESSAGES_RECEIVED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_received_total", "Messages pulled from the broker"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_RECEIVED_TOTAL metric")
});

pub static MESSAGES_SUCCEEDED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_succeeded_total", "Messages the handler processed successfully"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_SUCCEEDED_TOTAL metric")
});

pub static MESSAGES_FAILED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_failed_total", "Handler invocations that returned an error"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_FAILED_TOTAL metric")
});

pub static MESSAGES_TIMED_OUT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_timed_out_total", "Handler invocations that exceeded the consume timeout"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_TIMED_OUT_TOTAL metric")
});

pub static MESSAGES_ACKED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_acked_total", "Messages acknowledged by the receive loop"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_ACKED_TOTAL metric")
});

pub static ACK_FAILURES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_ack_failures_total", "Acknowledgements rejected by the broker"),
        &["topic"]
    )
    .expect("Failed to register ACK_FAILURES_TOTAL metric")
});

/// Poison messages acked after exhausting their retries
pub static MESSAGES_DROPPED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_messages_dropped_total", "Messages dropped after max reconsume times"),
        &["topic"]
    )
    .expect("Failed to register MESSAGES_DROPPED_TOTAL metric")
});

pub static RECEIVE_ERRORS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_receive_errors_total", "Failed receive calls"),
        &["topic"]
    )
    .expect("Failed to register RECEIVE_ERRORS_TOTAL metric")
});

pub static LOCK_CONTENTION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("mq_lock_contention_total", "Handler invocations skipped because the lock was held"),
        &["topic"]
    )
    .expect("Failed to register LOCK_CONTENTION_TOTAL metric")
});

pub static HANDLER_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "mq_handler_duration_seconds",
        "Time spent in the message handler",
        &["topic"]
    )
    .expect("Failed to register HANDLER_DURATION_SECONDS metric")
});

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer)?;

    Ok(String::from_utf8(buffer)?)
}
