//! In-process ledger with gateway semantics.
//!
//! Outbound transfers debit the sender and are recorded by transaction id
//! so an attached authority can observe them. Execution payloads are
//! JSON command batches, hex encoded; each command credits its recipient
//! once. Faults can be injected per operation and every call is counted.

use alloy::primitives::{keccak256, Address};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::ledger::client::LedgerClient;
use crate::ledger::types::{ConfirmationStatus, ExecutePayload, LedgerError, LedgerResult, TxId};

/// Ledger operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LedgerOp {
    ResolveAsset,
    GetBalance,
    EnsureAllowance,
    SubmitTransfer,
    SubmitExecution,
    TransactionStatus,
    IsCommandExecuted,
}

/// Outbound transfer event emitted by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundTransfer {
    pub source_chain: String,
    pub dest_chain: String,
    pub sender: String,
    pub recipient: String,
    pub symbol: String,
    pub amount: u128,
}

/// One mint instruction inside a signed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayCommand {
    pub command_id: String,
    pub symbol: String,
    pub recipient: String,
    pub amount: u128,
}

/// Wire format of execute payloads understood by [`InMemoryLedger`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBatchPayload {
    pub batch_id: String,
    pub dest_chain: String,
    pub signer: String,
    pub commands: Vec<GatewayCommand>,
}

impl CommandBatchPayload {
    pub fn encode(&self) -> ExecutePayload {
        // Serializing plain strings and integers cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        ExecutePayload::from_bytes(&bytes)
    }

    pub fn decode(payload: &ExecutePayload) -> LedgerResult<Self> {
        let bytes = payload.to_bytes()?;
        serde_json::from_slice(&bytes)
            .map_err(|e| LedgerError::ExecutionReverted(format!("malformed command batch: {}", e)))
    }
}

#[derive(Debug, Default)]
struct State {
    gateway: Option<String>,
    trusted_signer: Option<String>,
    tokens: HashMap<String, String>,
    balances: HashMap<(String, String), u128>,
    allowances: HashMap<(String, String, String), u128>,
    outbound: HashMap<TxId, OutboundTransfer>,
    executed: HashSet<String>,
    statuses: HashMap<TxId, ConfirmationStatus>,
    credit_fees: HashMap<String, u128>,
    transient_failures: HashMap<LedgerOp, u32>,
    lost_outcomes: HashMap<LedgerOp, bool>,
    calls: HashMap<LedgerOp, u32>,
    block: u64,
}

/// Ledger held entirely in memory.
#[derive(Debug)]
pub struct InMemoryLedger {
    name: String,
    state: Mutex<State>,
}

impl InMemoryLedger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Bind a gateway contract address.
    pub fn with_gateway(self, address: impl Into<String>) -> Self {
        self.state().gateway = Some(address.into());
        self
    }

    /// Register `symbol` with the gateway under a derived token address.
    pub fn with_token(self, symbol: &str) -> Self {
        let hash = keccak256(format!("{}:{}", self.name, symbol));
        let address = format!("{:#x}", Address::from_slice(&hash[12..]));
        self.state().tokens.insert(symbol.to_string(), address);
        self
    }

    /// Only accept payloads signed by this authority.
    pub fn with_trusted_signer(self, signer: impl Into<String>) -> Self {
        self.state().trusted_signer = Some(signer.into());
        self
    }

    pub fn mint(&self, account: &str, symbol: &str, amount: u128) {
        *self
            .state()
            .balances
            .entry(balance_key(account, symbol))
            .or_default() += amount;
    }

    pub fn balance(&self, account: &str, symbol: &str) -> u128 {
        self.state()
            .balances
            .get(&balance_key(account, symbol))
            .copied()
            .unwrap_or(0)
    }

    pub fn allowance(&self, owner: &str, spender: &str, symbol: &str) -> u128 {
        self.state()
            .allowances
            .get(&allowance_key(owner, spender, symbol))
            .copied()
            .unwrap_or(0)
    }

    /// Deduct a fee from every credit of `symbol` on this ledger.
    pub fn set_credit_fee(&self, symbol: &str, fee: u128) {
        self.state().credit_fees.insert(symbol.to_string(), fee);
    }

    /// Make the next `times` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: LedgerOp, times: u32) {
        self.state().transient_failures.insert(op, times);
    }

    /// Make the next submission of `op` report an unknown outcome.
    ///
    /// With `applied` the transaction still lands; without it the broadcast
    /// is lost and the node never learns of it.
    pub fn lose_next_outcome(&self, op: LedgerOp, applied: bool) {
        self.state().lost_outcomes.insert(op, applied);
    }

    pub fn calls(&self, op: LedgerOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    /// Outbound transfer recorded under `tx_id`, if it was included.
    pub fn outbound_transfer(&self, tx_id: &str) -> Option<OutboundTransfer> {
        self.state().outbound.get(tx_id).cloned()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and apply any injected transport fault.
    fn enter(&self, op: LedgerOp) -> LedgerResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.transient_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LedgerError::Transport(format!(
                    "injected {:?} failure on {}",
                    op, self.name
                )));
            }
        }
        Ok(state)
    }

    fn next_tx(&self, state: &mut State) -> (TxId, u64) {
        state.block += 1;
        let tx_id = format!("{:#x}", keccak256(format!("{}:{}", self.name, state.block)));
        (tx_id, state.block)
    }

    /// Record a landed transaction, or hide it when an outcome loss is armed.
    fn settle(&self, state: &mut State, op: LedgerOp, tx_id: TxId, block: u64) -> LedgerResult<TxId> {
        match state.lost_outcomes.remove(&op) {
            Some(true) => {
                state
                    .statuses
                    .insert(tx_id.clone(), ConfirmationStatus::Confirmed { block_number: block });
                Err(LedgerError::OutcomeUnknown { tx_id })
            }
            Some(false) => Err(LedgerError::OutcomeUnknown { tx_id }),
            None => {
                state
                    .statuses
                    .insert(tx_id.clone(), ConfirmationStatus::Confirmed { block_number: block });
                Ok(tx_id)
            }
        }
    }

    fn token(&self, state: &State, symbol: &str) -> LedgerResult<String> {
        if state.gateway.is_none() {
            return Err(LedgerError::GatewayUnregistered(self.name.clone()));
        }
        state
            .tokens
            .get(symbol)
            .cloned()
            .ok_or_else(|| LedgerError::AssetNotRegistered(symbol.to_string()))
    }
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    fn chain(&self) -> &str {
        &self.name
    }

    fn gateway_address(&self) -> Option<String> {
        self.state().gateway.clone()
    }

    async fn resolve_asset(&self, symbol: &str) -> LedgerResult<String> {
        let state = self.enter(LedgerOp::ResolveAsset)?;
        self.token(&state, symbol)
    }

    async fn get_balance(&self, account: &str, symbol: &str) -> LedgerResult<u128> {
        let state = self.enter(LedgerOp::GetBalance)?;
        self.token(&state, symbol)?;
        Ok(state
            .balances
            .get(&balance_key(account, symbol))
            .copied()
            .unwrap_or(0))
    }

    async fn ensure_allowance(
        &self,
        owner: &str,
        spender: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<Option<TxId>> {
        let mut state = self.enter(LedgerOp::EnsureAllowance)?;
        self.token(&state, symbol)?;

        let available = state
            .balances
            .get(&balance_key(owner, symbol))
            .copied()
            .unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: owner.to_string(),
                required: amount,
                available,
            });
        }

        let key = allowance_key(owner, spender, symbol);
        if state.allowances.get(&key).copied().unwrap_or(0) >= amount {
            return Ok(None);
        }

        let (tx_id, block) = self.next_tx(&mut state);
        state.allowances.insert(key, amount);
        self.settle(&mut state, LedgerOp::EnsureAllowance, tx_id, block)
            .map(Some)
    }

    async fn submit_transfer(
        &self,
        sender: &str,
        dest_chain: &str,
        recipient: &str,
        symbol: &str,
        amount: u128,
    ) -> LedgerResult<TxId> {
        let mut state = self.enter(LedgerOp::SubmitTransfer)?;
        let gateway = state
            .gateway
            .clone()
            .ok_or_else(|| LedgerError::GatewayUnregistered(self.name.clone()))?;
        self.token(&state, symbol)?;

        let (tx_id, block) = self.next_tx(&mut state);
        if state.lost_outcomes.get(&LedgerOp::SubmitTransfer) == Some(&false) {
            return self.settle(&mut state, LedgerOp::SubmitTransfer, tx_id, block);
        }

        let available = state
            .balances
            .get(&balance_key(sender, symbol))
            .copied()
            .unwrap_or(0);
        if available < amount {
            return Err(LedgerError::InsufficientBalance {
                account: sender.to_string(),
                required: amount,
                available,
            });
        }
        let allowance_key = allowance_key(sender, &gateway, symbol);
        let allowed = state.allowances.get(&allowance_key).copied().unwrap_or(0);
        if allowed < amount {
            return Err(LedgerError::Reverted(format!(
                "insufficient allowance: {} < {}",
                allowed, amount
            )));
        }

        state.allowances.insert(allowance_key, allowed - amount);
        state
            .balances
            .insert(balance_key(sender, symbol), available - amount);
        state.outbound.insert(
            tx_id.clone(),
            OutboundTransfer {
                source_chain: self.name.clone(),
                dest_chain: dest_chain.to_string(),
                sender: sender.to_string(),
                recipient: recipient.to_string(),
                symbol: symbol.to_string(),
                amount,
            },
        );
        self.settle(&mut state, LedgerOp::SubmitTransfer, tx_id, block)
    }

    async fn submit_execution(&self, payload: &ExecutePayload) -> LedgerResult<TxId> {
        let mut state = self.enter(LedgerOp::SubmitExecution)?;
        if state.gateway.is_none() {
            return Err(LedgerError::GatewayUnregistered(self.name.clone()));
        }

        let batch = CommandBatchPayload::decode(payload)?;
        if batch.dest_chain != self.name {
            return Err(LedgerError::ExecutionReverted(format!(
                "batch {} targets {}, not {}",
                batch.batch_id, batch.dest_chain, self.name
            )));
        }
        if let Some(trusted) = &state.trusted_signer {
            if &batch.signer != trusted {
                return Err(LedgerError::ExecutionReverted(format!(
                    "invalid signature on batch {}",
                    batch.batch_id
                )));
            }
        }
        if batch.commands.iter().all(|c| state.executed.contains(&c.command_id)) {
            return Err(LedgerError::ExecutionReverted(format!(
                "batch {} already executed",
                batch.batch_id
            )));
        }
        for command in &batch.commands {
            if !state.tokens.contains_key(&command.symbol) {
                return Err(LedgerError::ExecutionReverted(format!(
                    "token {} not deployed",
                    command.symbol
                )));
            }
        }

        let (tx_id, block) = self.next_tx(&mut state);
        if state.lost_outcomes.get(&LedgerOp::SubmitExecution) == Some(&false) {
            return self.settle(&mut state, LedgerOp::SubmitExecution, tx_id, block);
        }

        // Already-executed commands are skipped, as a gateway does.
        for command in batch.commands {
            if !state.executed.insert(command.command_id.clone()) {
                continue;
            }
            let fee = state.credit_fees.get(&command.symbol).copied().unwrap_or(0);
            let credited = command.amount.saturating_sub(fee);
            *state
                .balances
                .entry(balance_key(&command.recipient, &command.symbol))
                .or_default() += credited;
        }
        self.settle(&mut state, LedgerOp::SubmitExecution, tx_id, block)
    }

    async fn transaction_status(&self, tx_id: &str) -> LedgerResult<ConfirmationStatus> {
        let state = self.enter(LedgerOp::TransactionStatus)?;
        Ok(state
            .statuses
            .get(tx_id)
            .cloned()
            .unwrap_or(ConfirmationStatus::NotFound))
    }

    async fn is_command_executed(&self, command_id: &str) -> LedgerResult<bool> {
        let state = self.enter(LedgerOp::IsCommandExecuted)?;
        Ok(state.executed.contains(command_id))
    }
}

fn balance_key(account: &str, symbol: &str) -> (String, String) {
    (account.to_lowercase(), symbol.to_string())
}

fn allowance_key(owner: &str, spender: &str, symbol: &str) -> (String, String, String) {
    (owner.to_lowercase(), spender.to_lowercase(), symbol.to_string())
}
