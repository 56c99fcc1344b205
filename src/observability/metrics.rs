//! Metrics collection and exposition.
//!
//! # Metrics
//! - `bridge_transfers_total` (counter): finished attempts by outcome
//! - `bridge_phase_transitions_total` (counter): phases entered
//! - `bridge_phase_duration_seconds` (histogram): time spent working a phase
//! - `bridge_poll_attempts_total` (counter): authority polls by kind
//! - `bridge_transfers_in_flight` (gauge): transfers being driven
//!
//! Without an installed recorder every call is a no-op.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

use crate::orchestrator::Phase;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// An attempt ended; `outcome` is "reconciled" or the error class.
pub fn record_transfer_outcome(outcome: &'static str) {
    counter!("bridge_transfers_total", "outcome" => outcome).increment(1);
}

pub fn record_phase_transition(phase: Phase) {
    counter!("bridge_phase_transitions_total", "phase" => phase.as_str()).increment(1);
}

/// Time spent working from `phase` until it was left.
pub fn record_phase_duration(phase: Phase, elapsed: Duration) {
    histogram!("bridge_phase_duration_seconds", "phase" => phase.as_str())
        .record(elapsed.as_secs_f64());
}

pub fn record_poll_attempts(kind: &'static str, attempts: u32) {
    counter!("bridge_poll_attempts_total", "kind" => kind).increment(u64::from(attempts));
}

pub fn transfer_started() {
    gauge!("bridge_transfers_in_flight").increment(1.0);
}

pub fn transfer_finished() {
    gauge!("bridge_transfers_in_flight").decrement(1.0);
}
