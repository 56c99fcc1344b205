//! Transaction building, broadcasting, and inclusion monitoring.
//!
//! # Responsibilities
//! - Build contract calls with a gas price guard
//! - Sign and broadcast through the relayer wallet
//! - Wait for inclusion with the configured confirmation depth
//! - Report a broadcast whose inclusion cannot be determined as unknown

use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, TxHash};
use alloy::rpc::types::TransactionRequest;
use std::time::Duration;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::ledger::rpc::RpcClient;
use crate::ledger::types::{ConfirmationStatus, LedgerError, LedgerResult, TxId};

/// Sends contract calls from the relayer account and waits for them.
#[derive(Debug, Clone)]
pub struct TxSender {
    client: RpcClient,
    from: Address,
}

impl TxSender {
    pub fn new(client: RpcClient, from: Address) -> Self {
        Self { client, from }
    }

    /// Build a contract call, refusing to pay above the configured gas cap.
    ///
    /// Nonce and gas limit are left to the provider's fillers.
    pub async fn build(&self, to: Address, data: Bytes) -> LedgerResult<TransactionRequest> {
        let gas_price = self.client.get_gas_price().await?;
        let gas_price_gwei = gas_price / 1_000_000_000;

        let config = self.client.config();
        if gas_price_gwei > config.max_gas_price_gwei as u128 {
            return Err(LedgerError::GasPriceTooHigh {
                current_gwei: gas_price_gwei as u64,
                max_gwei: config.max_gas_price_gwei,
            });
        }

        let adjusted_gas_price = (gas_price as f64 * config.gas_price_multiplier) as u128;

        Ok(TransactionRequest::default()
            .with_from(self.from)
            .with_to(to)
            .with_input(data)
            .with_gas_price(adjusted_gas_price)
            .with_chain_id(config.chain_id))
    }

    /// Broadcast a call and block until it is included.
    ///
    /// Errors before broadcast keep their own class. After broadcast, a
    /// reverted receipt maps through `on_revert`, and a receipt that never
    /// shows up becomes [`LedgerError::OutcomeUnknown`].
    pub async fn send_and_wait(
        &self,
        to: Address,
        data: Bytes,
        on_revert: fn(String) -> LedgerError,
    ) -> LedgerResult<TxId> {
        let tx = self.build(to, data).await?;
        let tx_hash = self.client.send_transaction(tx).await?;
        let tx_id = format!("{:#x}", tx_hash);
        tracing::debug!(chain = %self.client.config().name, tx_id = %tx_id, "Transaction broadcast");

        match self.wait_for_confirmation(tx_hash).await {
            Ok(ConfirmationStatus::Confirmed { block_number }) => {
                tracing::info!(chain = %self.client.config().name, tx_id = %tx_id, block_number, "Transaction included");
                Ok(tx_id)
            }
            Ok(ConfirmationStatus::Failed(reason)) => {
                Err(on_revert(format!("{} ({})", reason, tx_id)))
            }
            Ok(_) | Err(_) => Err(LedgerError::OutcomeUnknown { tx_id }),
        }
    }

    /// Wait for a transaction to reach the configured confirmation depth.
    pub async fn wait_for_confirmation(&self, tx_hash: TxHash) -> LedgerResult<ConfirmationStatus> {
        let config = self.client.config();
        let timeout_duration = Duration::from_secs(config.receipt_timeout_secs);
        let poll_interval = Duration::from_millis(config.receipt_poll_ms.max(1));

        let result = timeout(timeout_duration, async {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                // Transient read failures just mean another tick.
                match self.status(tx_hash).await {
                    Ok(ConfirmationStatus::Pending)
                    | Ok(ConfirmationStatus::NotFound)
                    | Ok(ConfirmationStatus::Confirming { .. }) => continue,
                    Ok(done) => return done,
                    Err(e) => {
                        tracing::debug!(tx_hash = %tx_hash, error = %e, "Receipt lookup failed");
                        continue;
                    }
                }
            }
        })
        .await;

        result.map_err(|_| LedgerError::Timeout(config.receipt_timeout_secs))
    }

    /// One-shot inclusion status.
    pub async fn status(&self, tx_hash: TxHash) -> LedgerResult<ConfirmationStatus> {
        let receipt = match self.client.get_transaction_receipt(tx_hash).await? {
            Some(r) => r,
            None => {
                return if self.client.transaction_known(tx_hash).await? {
                    Ok(ConfirmationStatus::Pending)
                } else {
                    Ok(ConfirmationStatus::NotFound)
                };
            }
        };

        if !receipt.status() {
            return Ok(ConfirmationStatus::Failed("Transaction reverted".to_string()));
        }

        let required = self.client.confirmation_blocks();
        let current_block = self.client.get_block_number().await?;
        let tx_block = receipt.block_number.unwrap_or(current_block);
        // The inclusion block itself counts as the first confirmation.
        let confirmations = current_block.saturating_sub(tx_block) as u32 + 1;

        if confirmations >= required {
            Ok(ConfirmationStatus::Confirmed {
                block_number: tx_block,
            })
        } else {
            Ok(ConfirmationStatus::Confirming {
                current: confirmations,
                required,
            })
        }
    }

    pub fn address(&self) -> Address {
        self.from
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }
}
