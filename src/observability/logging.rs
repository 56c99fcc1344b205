//! Structured logging.
//!
//! Events carry key/value fields (`transfer_id`, `phase`, `chain`, `tx_id`,
//! `attempt`). `RUST_LOG` overrides the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&config.log_level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}

/// Our own events at `level`, dependencies one step quieter.
fn default_directives(level: &str) -> String {
    let level = level.trim().to_lowercase();
    let deps = match level.as_str() {
        "trace" => "debug",
        "debug" | "info" => "warn",
        other => other,
    };
    format!("{deps},bridge_orchestrator={level}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives("info"), "warn,bridge_orchestrator=info");
        assert_eq!(default_directives("TRACE"), "debug,bridge_orchestrator=trace");
        assert_eq!(default_directives("error"), "error,bridge_orchestrator=error");
    }
}
