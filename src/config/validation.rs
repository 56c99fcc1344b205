//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, limits > 0)
//! - Detect duplicate chain names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: OrchestratorConfig → Result<(), Vec<ValidationError>>

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::OrchestratorConfig;
use crate::resilience::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("chain #{0} has an empty name")]
    EmptyChainName(usize),

    #[error("chain '{0}' is configured more than once")]
    DuplicateChain(String),

    #[error("chain '{0}' has an invalid RPC URL '{1}'")]
    InvalidRpcUrl(String, String),

    #[error("chain '{0}' must allow at least one concurrent submission")]
    NoSubmissionCapacity(String),

    #[error("chain '{0}': {1} must be greater than zero")]
    ZeroTimeout(String, &'static str),

    #[error("policy '{0}': {1}")]
    InvalidPolicy(&'static str, &'static str),

    #[error("max_concurrent_transfers must be greater than zero")]
    NoTransferCapacity,
}

/// Validate a parsed configuration.
pub fn validate_config(config: &OrchestratorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for (idx, chain) in config.chains.iter().enumerate() {
        if chain.name.trim().is_empty() {
            errors.push(ValidationError::EmptyChainName(idx));
            continue;
        }
        if !seen.insert(chain.name.as_str()) {
            errors.push(ValidationError::DuplicateChain(chain.name.clone()));
        }
        for url in std::iter::once(&chain.rpc_url).chain(chain.failover_urls.iter()) {
            if url::Url::parse(url).is_err() {
                errors.push(ValidationError::InvalidRpcUrl(chain.name.clone(), url.clone()));
            }
        }
        if chain.max_concurrent_submissions == 0 {
            errors.push(ValidationError::NoSubmissionCapacity(chain.name.clone()));
        }
        if chain.rpc_timeout_secs == 0 {
            errors.push(ValidationError::ZeroTimeout(chain.name.clone(), "rpc_timeout_secs"));
        }
        if chain.receipt_timeout_secs == 0 {
            errors.push(ValidationError::ZeroTimeout(chain.name.clone(), "receipt_timeout_secs"));
        }
    }

    validate_policy("polling.confirm", &config.polling.confirm, &mut errors);
    validate_policy("polling.sign", &config.polling.sign, &mut errors);
    validate_policy("retries", &config.retries, &mut errors);

    if config.transfers.max_concurrent_transfers == 0 {
        errors.push(ValidationError::NoTransferCapacity);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_policy(name: &'static str, policy: &RetryPolicy, errors: &mut Vec<ValidationError>) {
    if policy.max_attempts == 0 {
        errors.push(ValidationError::InvalidPolicy(name, "max_attempts must be at least 1"));
    }
    if policy.factor < 1.0 || !policy.factor.is_finite() {
        errors.push(ValidationError::InvalidPolicy(name, "factor must be a finite value >= 1.0"));
    }
    if policy.max_delay_ms < policy.initial_delay_ms {
        errors.push(ValidationError::InvalidPolicy(name, "max_delay_ms is below initial_delay_ms"));
    }
    if policy.deadline_secs == 0 {
        errors.push(ValidationError::InvalidPolicy(name, "deadline_secs must be greater than zero"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ChainConfig;

    fn chain(name: &str) -> ChainConfig {
        ChainConfig {
            name: name.to_string(),
            ..ChainConfig::default()
        }
    }

    #[test]
    fn test_valid_config() {
        let mut config = OrchestratorConfig::default();
        config.chains = vec![chain("Ethereum"), chain("Polygon")];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = OrchestratorConfig::default();
        let mut bad = chain("Ethereum");
        bad.rpc_url = "not a url".to_string();
        bad.max_concurrent_submissions = 0;
        config.chains = vec![bad, chain("Ethereum"), chain("")];
        config.polling.sign.max_attempts = 0;
        config.transfers.max_concurrent_transfers = 0;

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.contains(&ValidationError::DuplicateChain("Ethereum".into())));
        assert!(errors.contains(&ValidationError::EmptyChainName(2)));
        assert!(errors.contains(&ValidationError::NoSubmissionCapacity("Ethereum".into())));
        assert!(errors.contains(&ValidationError::NoTransferCapacity));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidRpcUrl(name, _) if name == "Ethereum")));
        assert!(errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidPolicy("polling.sign", _))));
    }
}
