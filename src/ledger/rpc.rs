//! JSON-RPC client with timeout and failover.
//!
//! # Responsibilities
//! - Connect to the primary endpoint and any failovers
//! - Run each read against providers in order until one answers
//! - Keep a signing provider for writes on the primary endpoint

use alloy::network::EthereumWallet;
use alloy::primitives::{Bytes, TxHash};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::{TransactionReceipt, TransactionRequest};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::ChainConfig;
use crate::ledger::types::{LedgerError, LedgerResult};

type DynProvider = Arc<dyn Provider + Send + Sync>;

/// RPC client wrapper with failover support.
#[derive(Clone)]
pub struct RpcClient {
    /// Read providers (primary + failovers).
    providers: Vec<DynProvider>,
    /// Wallet-filling provider used to sign and broadcast.
    signer: DynProvider,
    config: ChainConfig,
    timeout_duration: Duration,
}

impl RpcClient {
    /// Create a client for one chain.
    ///
    /// Only the primary URL is required to parse; invalid failovers are
    /// skipped with a warning.
    pub fn new(config: ChainConfig, wallet: EthereumWallet) -> LedgerResult<Self> {
        let timeout_duration = Duration::from_secs(config.rpc_timeout_secs);

        let primary_url: url::Url = config.rpc_url.parse().map_err(|e| {
            LedgerError::Transport(format!("Invalid RPC URL '{}': {}", config.rpc_url, e))
        })?;

        let mut providers =
            vec![Arc::new(ProviderBuilder::new().connect_http(primary_url.clone())) as DynProvider];
        for url_str in &config.failover_urls {
            match url_str.parse::<url::Url>() {
                Ok(url) => {
                    providers.push(Arc::new(ProviderBuilder::new().connect_http(url)) as DynProvider)
                }
                Err(_) => tracing::warn!(chain = %config.name, url = %url_str, "Ignoring invalid failover RPC URL"),
            }
        }

        let signer =
            Arc::new(ProviderBuilder::new().wallet(wallet).connect_http(primary_url)) as DynProvider;

        Ok(Self {
            providers,
            signer,
            config,
            timeout_duration,
        })
    }

    /// Verify the connected chain ID matches configuration.
    pub async fn verify_chain_id(&self) -> LedgerResult<()> {
        let actual = self
            .first_ok("chain id", |p| {
                async move { p.get_chain_id().await.map_err(|e| e.to_string()) }.boxed()
            })
            .await?;
        if actual != self.config.chain_id {
            return Err(LedgerError::ChainMismatch {
                expected: self.config.chain_id,
                actual,
            });
        }
        Ok(())
    }

    pub async fn get_block_number(&self) -> LedgerResult<u64> {
        self.first_ok("block number", |p| {
            async move { p.get_block_number().await.map_err(|e| e.to_string()) }.boxed()
        })
        .await
    }

    /// Current gas price in wei.
    pub async fn get_gas_price(&self) -> LedgerResult<u128> {
        self.first_ok("gas price", |p| {
            async move { p.get_gas_price().await.map_err(|e| e.to_string()) }.boxed()
        })
        .await
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: TxHash,
    ) -> LedgerResult<Option<TransactionReceipt>> {
        self.first_ok("receipt", move |p| {
            async move {
                p.get_transaction_receipt(tx_hash)
                    .await
                    .map_err(|e| e.to_string())
            }
            .boxed()
        })
        .await
    }

    /// Whether any provider knows the transaction.
    pub async fn transaction_known(&self, tx_hash: TxHash) -> LedgerResult<bool> {
        self.first_ok("transaction", move |p| {
            async move {
                p.get_transaction_by_hash(tx_hash)
                    .await
                    .map(|tx| tx.is_some())
                    .map_err(|e| e.to_string())
            }
            .boxed()
        })
        .await
    }

    /// Execute a read-only contract call.
    pub async fn call(&self, tx: TransactionRequest) -> LedgerResult<Bytes> {
        self.first_ok("eth_call", move |p| {
            let tx = tx.clone();
            async move { p.call(tx).await.map_err(|e| e.to_string()) }.boxed()
        })
        .await
    }

    /// Sign and broadcast through the primary endpoint.
    ///
    /// No failover here: a broadcast that may have reached one node is never
    /// repeated against another.
    pub async fn send_transaction(&self, tx: TransactionRequest) -> LedgerResult<TxHash> {
        match timeout(self.timeout_duration, self.signer.send_transaction(tx)).await {
            Ok(Ok(pending)) => Ok(*pending.tx_hash()),
            Ok(Err(e)) => Err(classify_send_error(&e.to_string())),
            Err(_) => Err(LedgerError::Timeout(self.config.rpc_timeout_secs)),
        }
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn confirmation_blocks(&self) -> u32 {
        self.config.confirmation_blocks
    }

    async fn first_ok<T, F>(&self, what: &'static str, op: F) -> LedgerResult<T>
    where
        F: Fn(DynProvider) -> BoxFuture<'static, Result<T, String>>,
    {
        for (i, provider) in self.providers.iter().enumerate() {
            match timeout(self.timeout_duration, op(provider.clone())).await {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(e)) => {
                    tracing::warn!(chain = %self.config.name, provider_idx = i, error = %e, what, "RPC error, trying next provider");
                }
                Err(_) => {
                    tracing::warn!(chain = %self.config.name, provider_idx = i, what, "RPC timeout, trying next provider");
                }
            }
        }
        Err(LedgerError::Transport(format!(
            "All RPC providers failed to get {} on {}",
            what, self.config.name
        )))
    }
}

/// Map a node's rejection message to a ledger error.
///
/// Reverts are permanent; anything else is treated as a transport problem
/// because nothing was accepted into the mempool.
pub(crate) fn classify_send_error(message: &str) -> LedgerError {
    let lower = message.to_lowercase();
    if lower.contains("revert") || lower.contains("execution reverted") {
        LedgerError::Reverted(message.to_string())
    } else if lower.contains("insufficient funds") {
        LedgerError::Wallet(message.to_string())
    } else {
        LedgerError::Transport(message.to_string())
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("chain", &self.config.name)
            .field("rpc_url", &self.config.rpc_url)
            .field("chain_id", &self.config.chain_id)
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::wallet::Wallet;
    use crate::resilience::Transient;

    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn test_config() -> ChainConfig {
        ChainConfig {
            name: "Ethereum".to_string(),
            chain_id: 31337,
            rpc_url: "http://127.0.0.1:1".to_string(),
            rpc_timeout_secs: 1,
            ..ChainConfig::default()
        }
    }

    fn wallet() -> EthereumWallet {
        Wallet::from_private_key(TEST_PRIVATE_KEY, 31337)
            .unwrap()
            .ethereum_wallet()
    }

    #[test]
    fn test_rejects_invalid_primary_url() {
        let mut config = test_config();
        config.rpc_url = "not a url".to_string();
        let err = RpcClient::new(config, wallet()).unwrap_err();
        assert!(matches!(err, LedgerError::Transport(_)));
    }

    #[test]
    fn test_skips_invalid_failover() {
        let mut config = test_config();
        config.failover_urls = vec!["::bad::".to_string(), "http://127.0.0.1:2".to_string()];
        let client = RpcClient::new(config, wallet()).unwrap();
        assert_eq!(client.providers.len(), 2);
    }

    #[tokio::test]
    async fn test_failover_exhaustion_is_transient() {
        let mut config = test_config();
        config.failover_urls.push("http://127.0.0.1:2".to_string());
        let client = RpcClient::new(config, wallet()).unwrap();

        let err = client.get_block_number().await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.to_string().contains("All RPC providers failed"));
    }

    #[test]
    fn test_classify_send_error() {
        assert!(matches!(
            classify_send_error("execution reverted: insufficient allowance"),
            LedgerError::Reverted(_)
        ));
        assert!(matches!(
            classify_send_error("connection refused"),
            LedgerError::Transport(_)
        ));
    }
}
