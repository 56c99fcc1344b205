//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator, ledgers, authority:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (transfer counters, phase histograms, in-flight gauge)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape)
//! ```

pub mod logging;
pub mod metrics;
