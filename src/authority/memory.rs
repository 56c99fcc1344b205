//! In-process bridge authority.
//!
//! Observes outbound transfers on attached [`InMemoryLedger`]s, confirms
//! them after a configurable number of polls, queues a mint command per
//! confirmed transfer and signs pending commands into batches the ledgers
//! accept.

use alloy::primitives::keccak256;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::authority::client::BridgeAuthorityClient;
use crate::authority::types::{
    AuthorityError, AuthorityResult, BatchStatus, ConfirmationHandle, RegistrationPolicy,
    SignedBatch, SourceConfirmation,
};
use crate::ledger::memory::{CommandBatchPayload, GatewayCommand, InMemoryLedger, OutboundTransfer};

/// Signer name stamped on every batch.
pub const IN_MEMORY_SIGNER: &str = "in-memory-authority";

/// Authority operations that can be counted and faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorityOp {
    RegisterGateway,
    ConfirmSourceEvent,
    PollConfirmation,
    RequestCommandSigning,
    PollSignedBatch,
}

#[derive(Debug)]
struct Confirmation {
    polls: u32,
    event: Option<OutboundTransfer>,
    command_id: String,
    queued: bool,
}

#[derive(Debug)]
struct Batch {
    id: String,
    commands: Vec<GatewayCommand>,
    polls: u32,
}

#[derive(Debug, Default)]
struct State {
    gateways: HashMap<String, String>,
    confirmations: HashMap<(String, String), Confirmation>,
    pending: HashMap<String, Vec<GatewayCommand>>,
    batches: HashMap<String, Vec<Batch>>,
    signing_stuck: bool,
    abort_batches: bool,
    transient_failures: HashMap<AuthorityOp, u32>,
    calls: HashMap<AuthorityOp, u32>,
    batch_seq: u64,
}

#[derive(Debug)]
pub struct InMemoryAuthority {
    policy: RegistrationPolicy,
    ledgers: HashMap<String, Arc<InMemoryLedger>>,
    confirm_after: u32,
    sign_after: u32,
    state: Mutex<State>,
}

impl InMemoryAuthority {
    pub fn new(policy: RegistrationPolicy) -> Self {
        Self {
            policy,
            ledgers: HashMap::new(),
            confirm_after: 1,
            sign_after: 1,
            state: Mutex::new(State::default()),
        }
    }

    /// Observe a ledger under its chain name.
    pub fn attach(mut self, ledger: Arc<InMemoryLedger>) -> Self {
        use crate::ledger::LedgerClient;
        self.ledgers.insert(ledger.chain().to_string(), ledger);
        self
    }

    /// Polls before a requested confirmation is reported.
    pub fn with_confirm_after(mut self, polls: u32) -> Self {
        self.confirm_after = polls.max(1);
        self
    }

    /// Polls before a requested batch is reported signed.
    pub fn with_sign_after(mut self, polls: u32) -> Self {
        self.sign_after = polls.max(1);
        self
    }

    /// Keep every batch pending forever.
    pub fn set_signing_stuck(&self, stuck: bool) {
        self.state().signing_stuck = stuck;
    }

    /// Report every batch as aborted.
    pub fn set_abort_batches(&self, abort: bool) {
        self.state().abort_batches = abort;
    }

    /// Make the next `times` calls of `op` fail with a transport error.
    pub fn fail_next(&self, op: AuthorityOp, times: u32) {
        self.state().transient_failures.insert(op, times);
    }

    pub fn calls(&self, op: AuthorityOp) -> u32 {
        self.state().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.state().calls.values().sum()
    }

    pub fn gateway(&self, chain: &str) -> Option<String> {
        self.state().gateways.get(chain).cloned()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: AuthorityOp) -> AuthorityResult<MutexGuard<'_, State>> {
        let mut state = self.state();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.transient_failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AuthorityError::Transport(format!("injected {:?} failure", op)));
            }
        }
        Ok(state)
    }

    fn known(&self, chain: &str) -> AuthorityResult<&Arc<InMemoryLedger>> {
        self.ledgers
            .get(chain)
            .ok_or_else(|| AuthorityError::UnknownChain(chain.to_string()))
    }
}

#[async_trait]
impl BridgeAuthorityClient for InMemoryAuthority {
    async fn register_gateway(&self, chain: &str, address: &str) -> AuthorityResult<()> {
        let mut state = self.enter(AuthorityOp::RegisterGateway)?;
        self.known(chain)?;
        match state.gateways.get(chain) {
            Some(existing) if existing.eq_ignore_ascii_case(address) => return Ok(()),
            Some(existing) if self.policy == RegistrationPolicy::Reject => {
                return Err(AuthorityError::GatewayConflict {
                    chain: chain.to_string(),
                    existing: existing.clone(),
                    requested: address.to_string(),
                });
            }
            _ => {}
        }
        state.gateways.insert(chain.to_string(), address.to_string());
        Ok(())
    }

    async fn confirm_source_event(&self, chain: &str, tx_id: &str) -> AuthorityResult<ConfirmationHandle> {
        let mut state = self.enter(AuthorityOp::ConfirmSourceEvent)?;
        let ledger = self.known(chain)?;
        if !state.gateways.contains_key(chain) {
            return Err(AuthorityError::Rejected(format!("gateway not set for {}", chain)));
        }

        let key = (chain.to_string(), tx_id.to_lowercase());
        if state.confirmations.contains_key(&key) {
            return Err(AuthorityError::AlreadyConfirmed {
                chain: chain.to_string(),
                tx_id: tx_id.to_string(),
            });
        }

        let command_id = format!("{:#x}", keccak256(format!("{}:{}", chain, key.1)));
        state.confirmations.insert(
            key,
            Confirmation {
                polls: 0,
                event: ledger.outbound_transfer(tx_id),
                command_id,
                queued: false,
            },
        );
        Ok(ConfirmationHandle {
            chain: chain.to_string(),
            tx_id: tx_id.to_string(),
        })
    }

    async fn poll_confirmation(&self, handle: &ConfirmationHandle) -> AuthorityResult<SourceConfirmation> {
        let mut guard = self.enter(AuthorityOp::PollConfirmation)?;
        let state = &mut *guard;
        let key = (handle.chain.clone(), handle.tx_id.to_lowercase());
        let Some(record) = state.confirmations.get_mut(&key) else {
            return Err(AuthorityError::Rejected(format!(
                "no confirmation requested for {}",
                handle.tx_id
            )));
        };

        record.polls += 1;
        if record.polls < self.confirm_after {
            return Ok(SourceConfirmation::Pending);
        }
        let Some(event) = record.event.clone() else {
            return Ok(SourceConfirmation::Failed(format!(
                "no token-sent event in {}",
                handle.tx_id
            )));
        };
        if !self.ledgers.contains_key(&event.dest_chain) {
            return Ok(SourceConfirmation::Failed(format!(
                "unknown destination chain {}",
                event.dest_chain
            )));
        }

        if !record.queued {
            record.queued = true;
            state
                .pending
                .entry(event.dest_chain.clone())
                .or_default()
                .push(GatewayCommand {
                    command_id: record.command_id.clone(),
                    symbol: event.symbol,
                    recipient: event.recipient,
                    amount: event.amount,
                });
        }
        Ok(SourceConfirmation::Confirmed {
            command_id: Some(record.command_id.clone()),
        })
    }

    async fn request_command_signing(&self, dest_chain: &str) -> AuthorityResult<()> {
        let mut state = self.enter(AuthorityOp::RequestCommandSigning)?;
        self.known(dest_chain)?;
        let commands = state.pending.remove(dest_chain).unwrap_or_default();
        if commands.is_empty() {
            return Ok(());
        }

        state.batch_seq += 1;
        let id = format!("{:#x}", keccak256(format!("{}:batch:{}", dest_chain, state.batch_seq)));
        tracing::debug!(chain = dest_chain, batch_id = %id, commands = commands.len(), "Batch created");
        state.batches.entry(dest_chain.to_string()).or_default().push(Batch {
            id,
            commands,
            polls: 0,
        });
        Ok(())
    }

    async fn poll_signed_batch(
        &self,
        dest_chain: &str,
        command_id: Option<&str>,
    ) -> AuthorityResult<SignedBatch> {
        let mut guard = self.enter(AuthorityOp::PollSignedBatch)?;
        let state = &mut *guard;
        self.known(dest_chain)?;

        let (stuck, aborted) = (state.signing_stuck, state.abort_batches);
        let Some(batches) = state.batches.get_mut(dest_chain) else {
            return Ok(SignedBatch::pending());
        };
        let index = command_id
            .and_then(|id| {
                batches
                    .iter()
                    .rposition(|b| b.commands.iter().any(|c| c.command_id.eq_ignore_ascii_case(id)))
            })
            .or_else(|| batches.len().checked_sub(1));
        let Some(index) = index else {
            return Ok(SignedBatch::pending());
        };
        let batch = &mut batches[index];

        batch.polls += 1;
        let command_ids = batch.commands.iter().map(|c| c.command_id.clone()).collect();
        let status = if aborted {
            BatchStatus::Failed
        } else if stuck || batch.polls < self.sign_after {
            BatchStatus::Pending
        } else {
            BatchStatus::Signed
        };
        let execute_payload = (status == BatchStatus::Signed).then(|| {
            CommandBatchPayload {
                batch_id: batch.id.clone(),
                dest_chain: dest_chain.to_string(),
                signer: IN_MEMORY_SIGNER.to_string(),
                commands: batch.commands.clone(),
            }
            .encode()
        });

        Ok(SignedBatch {
            batch_id: batch.id.clone(),
            status,
            command_ids,
            execute_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerClient;

    const GATEWAY_A: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
    const GATEWAY_B: &str = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512";
    const ALICE: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
    const BOB: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    async fn setup(policy: RegistrationPolicy) -> (Arc<InMemoryLedger>, Arc<InMemoryLedger>, InMemoryAuthority, String) {
        let source = Arc::new(InMemoryLedger::new("Ethereum").with_gateway(GATEWAY_A).with_token("USDC"));
        let dest = Arc::new(
            InMemoryLedger::new("Polygon")
                .with_gateway(GATEWAY_B)
                .with_token("USDC")
                .with_trusted_signer(IN_MEMORY_SIGNER),
        );
        source.mint(ALICE, "USDC", 100);
        source.ensure_allowance(ALICE, GATEWAY_A, "USDC", 100).await.unwrap();
        let tx = source.submit_transfer(ALICE, "Polygon", BOB, "USDC", 100).await.unwrap();

        let authority = InMemoryAuthority::new(policy)
            .attach(source.clone())
            .attach(dest.clone())
            .with_confirm_after(2)
            .with_sign_after(2);
        authority.register_gateway("Ethereum", GATEWAY_A).await.unwrap();
        authority.register_gateway("Polygon", GATEWAY_B).await.unwrap();
        (source, dest, authority, tx)
    }

    #[tokio::test]
    async fn test_full_relay_flow() {
        let (_source, dest, authority, tx) = setup(RegistrationPolicy::Reject).await;

        let handle = authority.confirm_source_event("Ethereum", &tx).await.unwrap();
        assert_eq!(authority.poll_confirmation(&handle).await.unwrap(), SourceConfirmation::Pending);
        let SourceConfirmation::Confirmed { command_id: Some(command_id) } =
            authority.poll_confirmation(&handle).await.unwrap()
        else {
            panic!("expected confirmation with command id");
        };

        authority.request_command_signing("Polygon").await.unwrap();
        let first = authority.poll_signed_batch("Polygon", Some(&command_id)).await.unwrap();
        assert_eq!(first.status, BatchStatus::Pending);
        let signed = authority.poll_signed_batch("Polygon", Some(&command_id)).await.unwrap();
        assert_eq!(signed.status, BatchStatus::Signed);
        assert!(signed.contains(&command_id));

        dest.submit_execution(signed.execute_payload.as_ref().unwrap()).await.unwrap();
        assert_eq!(dest.balance(BOB, "USDC"), 100);
    }

    #[tokio::test]
    async fn test_repeated_requests_yield_same_payload() {
        let (_source, _dest, authority, tx) = setup(RegistrationPolicy::Reject).await;

        let handle = authority.confirm_source_event("Ethereum", &tx).await.unwrap();
        assert!(matches!(
            authority.confirm_source_event("Ethereum", &tx).await,
            Err(AuthorityError::AlreadyConfirmed { .. })
        ));
        authority.poll_confirmation(&handle).await.unwrap();
        let SourceConfirmation::Confirmed { command_id: Some(id) } =
            authority.poll_confirmation(&handle).await.unwrap()
        else {
            panic!("expected confirmation");
        };

        authority.request_command_signing("Polygon").await.unwrap();
        authority.request_command_signing("Polygon").await.unwrap();
        authority.poll_signed_batch("Polygon", Some(&id)).await.unwrap();
        let a = authority.poll_signed_batch("Polygon", Some(&id)).await.unwrap();
        let b = authority.poll_signed_batch("Polygon", Some(&id)).await.unwrap();
        assert_eq!(a.execute_payload, b.execute_payload);
        assert!(a.execute_payload.is_some());
    }

    #[tokio::test]
    async fn test_signing_without_pending_commands_is_noop() {
        let (_source, _dest, authority, _tx) = setup(RegistrationPolicy::Reject).await;
        authority.request_command_signing("Polygon").await.unwrap();
        let batch = authority.poll_signed_batch("Polygon", None).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(batch.command_ids.is_empty());
    }

    #[tokio::test]
    async fn test_registration_policy() {
        let (_s, _d, reject, _tx) = setup(RegistrationPolicy::Reject).await;
        reject.register_gateway("Ethereum", GATEWAY_A).await.unwrap();
        assert!(matches!(
            reject.register_gateway("Ethereum", GATEWAY_B).await,
            Err(AuthorityError::GatewayConflict { .. })
        ));
        assert_eq!(reject.gateway("Ethereum").as_deref(), Some(GATEWAY_A));

        let (_s, _d, overwrite, _tx) = setup(RegistrationPolicy::Overwrite).await;
        overwrite.register_gateway("Ethereum", GATEWAY_B).await.unwrap();
        assert_eq!(overwrite.gateway("Ethereum").as_deref(), Some(GATEWAY_B));

        assert!(matches!(
            overwrite.register_gateway("Avalanche", GATEWAY_A).await,
            Err(AuthorityError::UnknownChain(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_source_tx_fails_confirmation() {
        let (_source, _dest, authority, _tx) = setup(RegistrationPolicy::Reject).await;
        let handle = authority.confirm_source_event("Ethereum", "0xdead").await.unwrap();
        authority.poll_confirmation(&handle).await.unwrap();
        assert!(matches!(
            authority.poll_confirmation(&handle).await.unwrap(),
            SourceConfirmation::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_injected_transport_failure() {
        let (_source, _dest, authority, _tx) = setup(RegistrationPolicy::Reject).await;
        authority.fail_next(AuthorityOp::RequestCommandSigning, 1);
        assert!(matches!(
            authority.request_command_signing("Polygon").await,
            Err(AuthorityError::Transport(_))
        ));
        assert!(authority.request_command_signing("Polygon").await.is_ok());
        assert_eq!(authority.calls(AuthorityOp::RequestCommandSigning), 2);
    }
}
