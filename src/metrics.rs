//! Prometheus metrics for the relayer
//!
//! Counters live in the default registry; [`gather`] renders them in the text
//! exposition format.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, CounterVec, Encoder, TextEncoder};

lazy_static! {
    // Attestation metrics
    pub static ref ATTESTATION_FETCH_ATTEMPTS: CounterVec = register_counter_vec!(
        "xanchor_attestation_fetch_attempts_total",
        "Total number of attestation fetch attempts",
        &["chain", "result"]
    ).unwrap();

    // Leg outcome metrics
    pub static ref LEGS_APPLIED: CounterVec = register_counter_vec!(
        "xanchor_legs_applied_total",
        "Total number of legs accepted by the destination",
        &["chain"]
    ).unwrap();

    pub static ref LEGS_ALREADY_APPLIED: CounterVec = register_counter_vec!(
        "xanchor_legs_already_applied_total",
        "Total number of legs the destination reported as already executed",
        &["chain"]
    ).unwrap();

    pub static ref LEGS_FAILED: CounterVec = register_counter_vec!(
        "xanchor_legs_failed_total",
        "Total number of legs that ended in failure",
        &["chain"]
    ).unwrap();

    // Correlation metrics
    pub static ref CORRELATOR_POLLS: CounterVec = register_counter_vec!(
        "xanchor_correlator_polls_total",
        "Total number of destination sequence_info queries",
        &["chain", "result"]
    ).unwrap();
}

/// Record one attestation fetch attempt
pub fn record_fetch_attempt(chain: &str, found: bool) {
    let result = if found { "found" } else { "pending" };
    ATTESTATION_FETCH_ATTEMPTS
        .with_label_values(&[chain, result])
        .inc();
}

/// Record a leg accepted by the destination
pub fn record_leg_applied(chain: &str) {
    LEGS_APPLIED.with_label_values(&[chain]).inc();
}

/// Record a leg the destination had already executed
pub fn record_leg_already_applied(chain: &str) {
    LEGS_ALREADY_APPLIED.with_label_values(&[chain]).inc();
}

/// Record a failed leg
pub fn record_leg_failed(chain: &str) {
    LEGS_FAILED.with_label_values(&[chain]).inc();
}

/// Record one correlator poll
pub fn record_correlator_poll(chain: &str, assigned: bool) {
    let result = if assigned { "assigned" } else { "pending" };
    CORRELATOR_POLLS.with_label_values(&[chain, result]).inc();
}

/// Render all registered metrics in the text exposition format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
