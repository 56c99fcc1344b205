//! The per-chain ledger contract the orchestrator drives.

use async_trait::async_trait;

use crate::ledger::types::{ConfirmationStatus, ExecutePayload, LedgerResult, TxId};

/// Read and write operations against one chain's gateway and token contracts.
///
/// Every write blocks until the submitting transaction is included, not
/// until any cross-chain effect completes. Implementations never hold a
/// lock across a network call.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Chain name as registered with the bridge authority.
    fn chain(&self) -> &str;

    /// Gateway contract bound to this chain, if any.
    fn gateway_address(&self) -> Option<String>;

    /// Look up the asset address the gateway registered for `symbol`.
    async fn resolve_asset(&self, symbol: &str) -> LedgerResult<String>;

    /// Balance of `account` in `symbol`, in the smallest unit.
    async fn get_balance(&self, account: &str, symbol: &str) -> LedgerResult<u128>;

    /// Approve `spender` for at least `amount` if the current allowance is lower.
    ///
    /// Returns the approval transaction, or `None` when the allowance already
    /// covered the amount. Fails with `InsufficientBalance` when the owner
    /// cannot cover `amount` at all.
    async fn ensure_allowance(
        &self,
        owner: &str,
        spender: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<Option<TxId>>;

    /// Call the gateway's outbound transfer entry point.
    async fn submit_transfer(
        &self,
        sender: &str,
        dest_chain: &str,
        recipient: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<TxId>;

    /// Hand an authority-signed payload to the gateway's execute entry point.
    async fn submit_execution(&self, payload: &ExecutePayload) -> LedgerResult<TxId>;

    /// Inclusion status of a previously broadcast transaction.
    async fn transaction_status(&self, tx_id: &str) -> LedgerResult<ConfirmationStatus>;

    /// Whether the gateway already consumed the command with this id.
    async fn is_command_executed(&self, command_id: &str) -> LedgerResult<bool>;
}
