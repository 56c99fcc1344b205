//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the orchestrator.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::authority::RegistrationPolicy;
use crate::resilience::RetryPolicy;

/// Root configuration for the bridge orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Ledgers the orchestrator can move assets between.
    pub chains: Vec<ChainConfig>,

    /// Bridge authority client settings.
    pub authority: AuthorityConfig,

    /// Polling budgets for confirmation and signing.
    pub polling: PollingConfig,

    /// Transport retry budget for individual calls and submissions.
    pub retries: RetryPolicy,

    /// Transfer admission, fees and state persistence.
    pub transfers: TransferConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl OrchestratorConfig {
    /// Look up a chain by its authority-registry name.
    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }
}

/// Per-ledger connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Chain name as known to the bridge authority (e.g. "Ethereum").
    pub name: String,

    /// Chain ID (e.g., 1 for Ethereum mainnet, 31337 for local Anvil).
    pub chain_id: u64,

    /// JSON-RPC endpoint URL.
    pub rpc_url: String,

    /// Failover JSON-RPC endpoint URLs.
    pub failover_urls: Vec<String>,

    /// Gateway contract address; unset means no gateway is bound.
    pub gateway_address: Option<String>,

    /// RPC request timeout in seconds.
    pub rpc_timeout_secs: u64,

    /// Number of block confirmations required for inclusion.
    pub confirmation_blocks: u32,

    /// How long to wait for a receipt before the outcome counts as unknown.
    pub receipt_timeout_secs: u64,

    /// Receipt polling interval in milliseconds.
    pub receipt_poll_ms: u64,

    /// Gas price multiplier (1.0 = estimated, 1.2 = 20% buffer).
    pub gas_price_multiplier: f64,

    /// Maximum gas price in gwei (protection against spikes).
    pub max_gas_price_gwei: u64,

    /// Concurrent submissions allowed against this chain.
    pub max_concurrent_submissions: usize,

    /// Environment variable holding the signing key for this chain.
    pub private_key_env: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            chain_id: 1,
            rpc_url: "http://localhost:8545".to_string(),
            failover_urls: Vec::new(),
            gateway_address: None,
            rpc_timeout_secs: 10,
            confirmation_blocks: 1,
            receipt_timeout_secs: 120,
            receipt_poll_ms: 2000,
            gas_price_multiplier: 1.2,
            max_gas_price_gwei: 500,
            max_concurrent_submissions: 4,
            private_key_env: "BRIDGE_PRIVATE_KEY".to_string(),
        }
    }
}

/// Settings for the `axelard` command-line authority client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Path to the `axelard` binary.
    pub binary: String,

    /// Node home directory (`--home`).
    pub home: String,

    /// Tendermint RPC endpoint (`--node`).
    pub node: String,

    /// Authority chain ID (`--chain-id`).
    pub chain_id: String,

    /// Key used to sign relayer transactions.
    pub from: String,

    /// Key used for administrative transactions such as gateway registration.
    pub admin_from: String,

    pub keyring_backend: String,

    pub gas_adjustment: f64,

    /// Timeout for a single command invocation in seconds.
    pub command_timeout_secs: u64,

    /// Log index of the gateway's token-sent event inside the source transaction.
    pub token_sent_log_index: u64,

    /// What to do when a chain already has a different gateway registered.
    pub registration_policy: RegistrationPolicy,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            binary: "axelard".to_string(),
            home: "./chaindata/axelar".to_string(),
            node: "tcp://localhost:26657".to_string(),
            chain_id: "axelar-demo-1".to_string(),
            from: "relayer".to_string(),
            admin_from: "validator".to_string(),
            keyring_backend: "test".to_string(),
            gas_adjustment: 1.5,
            command_timeout_secs: 30,
            token_sent_log_index: 1,
            registration_policy: RegistrationPolicy::Reject,
        }
    }
}

/// Polling budgets for the asynchronous authority phases.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PollingConfig {
    /// Waiting for the source event to be confirmed.
    pub confirm: RetryPolicy,

    /// Waiting for the command batch to be signed.
    pub sign: RetryPolicy,
}

/// Transfer admission and bookkeeping.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers driven concurrently; further transfers queue.
    pub max_concurrent_transfers: usize,

    /// Flat protocol fee per asset symbol, in the smallest unit.
    pub fees: HashMap<String, u128>,

    /// JSON file transfer states are saved to and recovered from.
    pub state_file: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 16,
            fees: HashMap::new(),
            state_file: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert!(config.chains.is_empty());
        assert_eq!(config.polling.sign.factor, 1.5);
        assert_eq!(config.polling.sign.max_delay_ms, 10_000);
        assert_eq!(config.transfers.max_concurrent_transfers, 16);
        assert_eq!(config.authority.registration_policy, RegistrationPolicy::Reject);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let raw = r#"
            [[chains]]
            name = "Ethereum"
            chain_id = 1
            rpc_url = "http://localhost:8545"
            gateway_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"

            [[chains]]
            name = "Polygon"
            chain_id = 137
            rpc_url = "http://localhost:7545"

            [authority]
            registration_policy = "overwrite"

            [polling.sign]
            max_attempts = 20

            [transfers.fees]
            USDC = 250
        "#;
        let config: OrchestratorConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.chains.len(), 2);
        assert_eq!(config.chain("Polygon").unwrap().chain_id, 137);
        assert!(config.chain("Polygon").unwrap().gateway_address.is_none());
        assert_eq!(config.authority.registration_policy, RegistrationPolicy::Overwrite);
        assert_eq!(config.polling.sign.max_attempts, 20);
        assert_eq!(config.polling.sign.initial_delay_ms, 1000);
        assert_eq!(config.transfers.fees.get("USDC"), Some(&250));
    }
}
