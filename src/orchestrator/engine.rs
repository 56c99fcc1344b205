//! The transfer state machine.
//!
//! One worker drives one transfer through
//! CREATED → SOURCE_SENT → SOURCE_CONFIRMED → COMMANDS_SIGNED → EXECUTED → RECONCILED,
//! persisting the state after every step. Any error moves the transfer to
//! FAILED; resuming re-enters at the last phase reached, so the
//! non-idempotent source submission never runs twice.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::authority::{
    AuthorityError, BatchStatus, BridgeAuthorityClient, ConfirmationHandle, SignedBatch,
    SourceConfirmation,
};
use crate::config::OrchestratorConfig;
use crate::ledger::{ConfirmationStatus, LedgerClient, LedgerError, SubmissionPool, TxId};
use crate::observability::metrics;
use crate::orchestrator::error::{TransferError, TransferResult};
use crate::orchestrator::registry::TransferRegistry;
use crate::orchestrator::state::{
    Phase, TransferId, TransferOutcome, TransferRequest, TransferState,
};
use crate::reconcile::{BalanceReconciler, Baseline};
use crate::resilience::{poll_until, retry, PollStatus, RetryError, RetryPolicy, Transient};

/// Pool key for execute submissions; a ledger client sends them all from
/// its own relayer account.
const RELAYER: &str = "relayer";

/// Retry and polling budgets used by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Policies {
    /// Waiting for the authority to confirm the source event.
    pub confirm: RetryPolicy,
    /// Waiting for a signed batch carrying the transfer's command.
    pub sign: RetryPolicy,
    /// Transient transport failures on individual calls.
    pub transport: RetryPolicy,
}

impl Default for Policies {
    fn default() -> Self {
        Self {
            confirm: RetryPolicy::default(),
            sign: RetryPolicy::default(),
            transport: RetryPolicy::transport(),
        }
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    authority: Arc<dyn BridgeAuthorityClient>,
    ledgers: HashMap<String, Arc<dyn LedgerClient>>,
    pools: HashMap<String, Arc<SubmissionPool>>,
    policies: Policies,
    fees: HashMap<String, u128>,
    max_concurrent_transfers: usize,
    registry: Option<TransferRegistry>,
}

impl OrchestratorBuilder {
    pub fn new(authority: Arc<dyn BridgeAuthorityClient>) -> Self {
        Self {
            authority,
            ledgers: HashMap::new(),
            pools: HashMap::new(),
            policies: Policies::default(),
            fees: HashMap::new(),
            max_concurrent_transfers: 16,
            registry: None,
        }
    }

    /// Take policies, fees and admission limits from the config.
    ///
    /// Ledgers are added separately; their submission limit is looked up
    /// in the matching chain section.
    pub fn from_config(config: &OrchestratorConfig, authority: Arc<dyn BridgeAuthorityClient>) -> Self {
        let mut builder = Self::new(authority)
            .policies(Policies {
                confirm: config.polling.confirm.clone(),
                sign: config.polling.sign.clone(),
                transport: config.retries.clone(),
            })
            .max_concurrent_transfers(config.transfers.max_concurrent_transfers);
        for (symbol, fee) in &config.transfers.fees {
            builder = builder.fee(symbol, *fee);
        }
        builder
    }

    /// Add a ledger allowing `max_submissions` concurrent submissions.
    pub fn ledger(mut self, ledger: Arc<dyn LedgerClient>, max_submissions: usize) -> Self {
        let chain = ledger.chain().to_string();
        self.pools.insert(
            chain.clone(),
            Arc::new(SubmissionPool::new(chain.clone(), max_submissions)),
        );
        self.ledgers.insert(chain, ledger);
        self
    }

    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    pub fn confirm_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.confirm = policy;
        self
    }

    pub fn sign_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.sign = policy;
        self
    }

    pub fn transport_policy(mut self, policy: RetryPolicy) -> Self {
        self.policies.transport = policy;
        self
    }

    /// Flat fee withheld from every credit of `symbol`.
    pub fn fee(mut self, symbol: &str, fee: u128) -> Self {
        self.fees.insert(symbol.to_string(), fee);
        self
    }

    pub fn max_concurrent_transfers(mut self, max: usize) -> Self {
        self.max_concurrent_transfers = max.max(1);
        self
    }

    /// Use an existing registry, e.g. one loaded from disk.
    pub fn registry(mut self, registry: TransferRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            ledgers: self.ledgers,
            pools: self.pools,
            authority: self.authority,
            reconciler: BalanceReconciler::new(),
            policies: self.policies,
            fees: self.fees,
            registry: self.registry.unwrap_or_default(),
            admission: Arc::new(Semaphore::new(self.max_concurrent_transfers)),
        }
    }
}

/// Drives transfers from request to reconciliation.
pub struct Orchestrator {
    ledgers: HashMap<String, Arc<dyn LedgerClient>>,
    pools: HashMap<String, Arc<SubmissionPool>>,
    authority: Arc<dyn BridgeAuthorityClient>,
    reconciler: BalanceReconciler,
    policies: Policies,
    fees: HashMap<String, u128>,
    registry: TransferRegistry,
    admission: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn builder(authority: Arc<dyn BridgeAuthorityClient>) -> OrchestratorBuilder {
        OrchestratorBuilder::new(authority)
    }

    pub fn registry(&self) -> &TransferRegistry {
        &self.registry
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    /// Validate a request and record it in CREATED without running it.
    pub fn create(&self, request: TransferRequest) -> TransferResult<TransferId> {
        let state = self.prepare(request)?;
        let id = state.id;
        log_created(&state);
        self.persist(&state);
        Ok(id)
    }

    fn prepare(&self, request: TransferRequest) -> TransferResult<TransferState> {
        request.validate()?;
        self.ledger(&request.source_chain)?;
        self.ledger(&request.dest_chain)?;

        let fee = self.fees.get(&request.symbol).copied().unwrap_or(0);
        if fee >= request.amount {
            return Err(TransferError::InvalidRequest(format!(
                "fee {} for {} leaves nothing of amount {}",
                fee, request.symbol, request.amount
            )));
        }
        Ok(TransferState::new(request, fee))
    }

    /// Create a transfer and drive it to RECONCILED or FAILED.
    ///
    /// Invalid requests are rejected without creating a transfer; every
    /// later failure is reported through the outcome.
    pub async fn initiate_transfer(&self, request: TransferRequest) -> TransferResult<TransferOutcome> {
        let id = self.create(request)?;
        self.drive_transfer(id).await
    }

    /// Adopt a source transaction that was submitted outside the orchestrator.
    ///
    /// Keyed by (source chain, source tx id): adopting the same transaction
    /// again returns the existing transfer instead of a new one. An adopted
    /// transaction the ledger does not know is never replaced by a new
    /// submission.
    pub async fn track_submitted(
        &self,
        request: TransferRequest,
        source_tx_id: TxId,
    ) -> TransferResult<TransferOutcome> {
        let mut state = self.prepare(request)?;
        state.source_tx_id = Some(source_tx_id.clone());
        let id = state.id;
        if let Err(owner) = self.registry.insert_untracked(state.clone()) {
            tracing::info!(transfer_id = %owner, tx_id = %source_tx_id, "Source transaction already tracked");
            return self.get_transfer_state(owner).map(|s| TransferOutcome::from(&s));
        }

        log_created(&state);
        self.persist(&state);
        self.drive_transfer(id).await
    }

    /// Start a new attempt of a failed transfer from its last reached phase.
    pub async fn resume(&self, id: TransferId) -> TransferResult<TransferOutcome> {
        let previous = self.get_transfer_state(id)?;
        let next = TransferState::resume_from(&previous)?;
        self.registry.clear_abort(id);
        tracing::info!(
            transfer_id = %id,
            attempt = next.attempt,
            phase = %next.phase,
            "Resuming transfer"
        );
        self.persist(&next);
        self.drive_transfer(id).await
    }

    /// Request cancellation; honored at the next phase boundary.
    pub fn abort(&self, id: TransferId) -> TransferResult<()> {
        let state = self.get_transfer_state(id)?;
        if state.is_terminal() {
            return Ok(());
        }
        tracing::info!(transfer_id = %id, phase = %state.phase, "Abort requested");
        self.registry.request_abort(id);
        Ok(())
    }

    /// Request cancellation of every non-terminal transfer.
    pub fn abort_all(&self) -> usize {
        let ids: Vec<TransferId> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| !s.is_terminal())
            .map(|s| s.id)
            .collect();
        for id in &ids {
            self.registry.request_abort(*id);
        }
        if !ids.is_empty() {
            tracing::warn!(transfers = ids.len(), "Aborting in-flight transfers");
        }
        ids.len()
    }

    /// Abort everything once the shutdown signal fires.
    pub fn abort_on_shutdown(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if shutdown.recv().await.is_ok() {
                this.abort_all();
            }
        })
    }

    pub fn get_transfer_state(&self, id: TransferId) -> TransferResult<TransferState> {
        self.registry.get(id).ok_or(TransferError::NotFound(id))
    }

    pub fn transfers(&self) -> Vec<TransferState> {
        self.registry.list()
    }

    /// Register every bound gateway with the authority.
    ///
    /// Returns the chains that were registered; chains without a gateway
    /// are skipped.
    pub async fn register_gateways(&self) -> TransferResult<Vec<String>> {
        let mut chains: Vec<&String> = self.ledgers.keys().collect();
        chains.sort();

        let mut registered = Vec::new();
        for chain in chains {
            let Some(address) = self.ledgers[chain].gateway_address() else {
                tracing::warn!(chain = %chain, "No gateway bound; skipping registration");
                continue;
            };
            retry(&self.policies.transport, "register_gateway", |_| {
                self.authority.register_gateway(chain, &address)
            })
            .await
            .map_err(authority_failure)?;
            tracing::info!(chain = %chain, gateway = %address, "Gateway registered");
            registered.push(chain.clone());
        }
        Ok(registered)
    }

    /// Drive many transfers concurrently under the admission limit.
    pub async fn run_all(
        self: &Arc<Self>,
        requests: Vec<TransferRequest>,
    ) -> Vec<TransferResult<TransferOutcome>> {
        let handles: Vec<_> = requests
            .into_iter()
            .map(|request| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.initiate_transfer(request).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(TransferError::Worker(e.to_string()))))
            .collect()
    }

    /// Resume every failed transfer whose failure is resumable.
    pub async fn recover(self: &Arc<Self>) -> Vec<TransferResult<TransferOutcome>> {
        let ids: Vec<TransferId> = self
            .registry
            .list()
            .into_iter()
            .filter(|s| s.phase == Phase::Failed)
            .filter(|s| s.last_error.as_ref().is_some_and(|e| e.class.is_resumable()))
            .map(|s| s.id)
            .collect();
        tracing::info!(transfers = ids.len(), "Recovering transfers");

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.resume(id).await })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .map(|joined| joined.unwrap_or_else(|e| Err(TransferError::Worker(e.to_string()))))
            .collect()
    }

    /// Run a stored transfer until it is terminal.
    ///
    /// Waits for an admission slot first. A terminal transfer is returned
    /// as is.
    pub async fn drive_transfer(&self, id: TransferId) -> TransferResult<TransferOutcome> {
        let _admitted = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TransferError::Worker(e.to_string()))?;

        let state = self.get_transfer_state(id)?;
        if state.is_terminal() {
            return Ok(TransferOutcome::from(&state));
        }
        let Some(_running) = Running::claim(&self.registry, id) else {
            return Err(TransferError::NotResumable {
                id,
                reason: "a worker is already driving it".into(),
            });
        };

        let span = tracing::info_span!("transfer", transfer_id = %id, attempt = state.attempt);
        let state = self.run(state).instrument(span).await;
        Ok(TransferOutcome::from(&state))
    }

    async fn run(&self, mut state: TransferState) -> TransferState {
        while !state.is_terminal() {
            if self.registry.abort_requested(state.id) {
                self.registry.clear_abort(state.id);
                self.fail(&mut state, TransferError::Aborted);
                break;
            }

            let from = state.phase;
            let started = Instant::now();
            let result = self.step(&mut state).await;
            metrics::record_phase_duration(from, started.elapsed());

            let advanced = result.and_then(|()| match from.next() {
                Some(to) => state.advance(to).map(|()| to),
                None => Err(TransferError::InvalidTransition { from, to: from }),
            });
            match advanced {
                Ok(to) => {
                    metrics::record_phase_transition(to);
                    tracing::info!(
                        phase = %to,
                        attempts = state.phase_attempts.get(&from).copied().unwrap_or(0),
                        "Phase reached"
                    );
                    self.persist(&state);
                }
                Err(e) => self.fail(&mut state, e),
            }
        }

        let outcome = match &state.last_error {
            Some(e) if state.phase == Phase::Failed => e.class.as_str(),
            _ => "reconciled",
        };
        metrics::record_transfer_outcome(outcome);
        state
    }

    async fn step(&self, state: &mut TransferState) -> TransferResult<()> {
        match state.phase {
            Phase::Created => self.send_source(state).await,
            Phase::SourceSent => self.confirm_source(state).await,
            Phase::SourceConfirmed => self.sign_commands(state).await,
            Phase::CommandsSigned => self.execute(state).await,
            Phase::Executed => self.reconcile(state).await,
            phase @ (Phase::Reconciled | Phase::Failed) => Err(TransferError::InvalidTransition {
                from: phase,
                to: phase,
            }),
        }
    }

    /// CREATED: approve the gateway and submit the outbound transfer.
    async fn send_source(&self, state: &mut TransferState) -> TransferResult<()> {
        let request = state.request.clone();
        let chain = request.source_chain.as_str();
        let source = self.ledger(chain)?;
        let dest = self.ledger(&request.dest_chain)?;

        if state.submitting && state.source_tx_id.is_none() {
            return Err(TransferError::InterruptedSubmission {
                chain: chain.to_string(),
            });
        }

        if state.dest_balance_before.is_none() {
            let (reconciler, registry) = (&self.reconciler, &self.registry);
            let (ledger, current) = (dest.as_ref(), &*state);
            let (baseline, attempts) = retry(&self.policies.transport, "capture_balance", |_| async move {
                let siblings = registry.sibling_credits(current);
                reconciler
                    .capture(ledger, &current.request.recipient, &current.request.symbol, &siblings)
                    .await
            })
            .await
            .map_err(reconcile_failure)?;
            state.record_attempts(Phase::Created, attempts);
            state.dest_balance_before = Some(baseline.balance);
            state.baseline_credits = baseline.credited;
            self.persist(state);
        }

        // A submission from an earlier attempt must be settled before
        // anything is sent again.
        if let Some(tx_id) = state.source_tx_id.clone() {
            match self.resolve_submission(source.as_ref(), &tx_id).await? {
                Inclusion::Included => {
                    state.source_tx_unresolved = false;
                    self.persist(state);
                    return Ok(());
                }
                Inclusion::Missing if state.source_tx_unresolved => {
                    tracing::warn!(chain, tx_id = %tx_id, "Earlier submission never landed; resubmitting");
                    state.source_tx_id = None;
                    state.source_tx_unresolved = false;
                    self.persist(state);
                }
                Inclusion::Missing => {
                    return Err(TransferError::UnresolvedSubmission {
                        chain: chain.to_string(),
                        tx_id,
                    });
                }
            }
        }

        let gateway = source
            .gateway_address()
            .ok_or_else(|| TransferError::ledger(chain, LedgerError::GatewayUnregistered(chain.to_string())))?;
        let pool = self.pool(chain)?;
        let _permit = pool.acquire(&request.sender).await;

        let ledger = source.as_ref();
        let (req, spender) = (&request, gateway.as_str());
        let (approval, attempts) = retry(&self.policies.transport, "ensure_allowance", |_| async move {
            ledger
                .ensure_allowance(&req.sender, spender, &req.symbol, req.amount)
                .await
                .map_err(Submission)
        })
        .await
        .map_err(|e| submission_failure(chain, e))?;
        state.record_attempts(Phase::Created, attempts);
        if let Some(tx_id) = approval {
            tracing::info!(chain, tx_id = %tx_id, "Gateway allowance approved");
            state.approval_tx_id = Some(tx_id);
        }

        state.submitting = true;
        self.persist(state);
        let submitted = retry(&self.policies.transport, "submit_transfer", |_| async move {
            ledger
                .submit_transfer(&req.sender, &req.dest_chain, &req.recipient, &req.symbol, req.amount)
                .await
                .map_err(Submission)
        })
        .await;

        match submitted {
            Ok((tx_id, attempts)) => {
                state.submitting = false;
                state.record_attempts(Phase::Created, attempts);
                tracing::info!(chain, tx_id = %tx_id, "Source transfer submitted");
                state.source_tx_id = Some(tx_id);
                self.persist(state);
                Ok(())
            }
            Err(RetryError::Permanent(Submission(LedgerError::OutcomeUnknown { tx_id }))) => {
                state.submitting = false;
                state.source_tx_id = Some(tx_id.clone());
                state.source_tx_unresolved = true;
                self.persist(state);
                tracing::warn!(chain, tx_id = %tx_id, "Source submission outcome unknown; resolving");

                match self.resolve_submission(source.as_ref(), &tx_id).await? {
                    Inclusion::Included => {
                        state.source_tx_unresolved = false;
                        self.persist(state);
                        Ok(())
                    }
                    Inclusion::Missing => Err(TransferError::UnresolvedSubmission {
                        chain: chain.to_string(),
                        tx_id,
                    }),
                }
            }
            // The broadcast may have gone out without us learning its hash.
            Err(RetryError::Permanent(Submission(LedgerError::Timeout(_)))) => {
                Err(TransferError::InterruptedSubmission {
                    chain: chain.to_string(),
                })
            }
            Err(e) => {
                state.submitting = false;
                Err(submission_failure(chain, e))
            }
        }
    }

    /// SOURCE_SENT: have the authority confirm the source event.
    async fn confirm_source(&self, state: &mut TransferState) -> TransferResult<()> {
        let chain = state.request.source_chain.clone();
        let Some(tx_id) = state.source_tx_id.clone() else {
            return Err(TransferError::InvalidTransition {
                from: Phase::SourceSent,
                to: Phase::SourceConfirmed,
            });
        };

        let requested = retry(&self.policies.transport, "confirm_source_event", |_| {
            self.authority.confirm_source_event(&chain, &tx_id)
        })
        .await;
        let handle = match requested {
            Ok((handle, _)) => handle,
            Err(RetryError::Permanent(AuthorityError::AlreadyConfirmed { .. })) => {
                tracing::debug!(chain = %chain, tx_id = %tx_id, "Confirmation already requested");
                ConfirmationHandle {
                    chain: chain.clone(),
                    tx_id: tx_id.clone(),
                }
            }
            Err(e) => return Err(authority_failure(e)),
        };

        let authority = self.authority.as_ref();
        let handle = &handle;
        let polled = poll_until(&self.policies.confirm, "confirmation", |_| async move {
            Ok::<_, AuthorityError>(match authority.poll_confirmation(handle).await? {
                SourceConfirmation::Pending => PollStatus::Pending,
                SourceConfirmation::Confirmed { command_id } => PollStatus::Ready(command_id),
                SourceConfirmation::Failed(reason) => PollStatus::Failed(reason),
            })
        })
        .await;

        match polled {
            Ok((command_id, attempts)) => {
                state.record_attempts(Phase::SourceSent, attempts);
                metrics::record_poll_attempts("confirm", attempts);
                tracing::info!(
                    chain = %chain,
                    tx_id = %tx_id,
                    command_id = command_id.as_deref().unwrap_or("unknown"),
                    "Source event confirmed"
                );
                state.command_id = command_id;
                Ok(())
            }
            Err(e) => {
                let attempts = e.attempts().unwrap_or(0);
                state.record_attempts(Phase::SourceSent, attempts);
                metrics::record_poll_attempts("confirm", attempts);
                Err(match e {
                    RetryError::Exhausted { attempts, .. } | RetryError::DeadlineExceeded { attempts, .. } => {
                        TransferError::ConfirmationTimeout { attempts }
                    }
                    RetryError::Failed(reason) => TransferError::ConfirmationFailed(reason),
                    RetryError::Permanent(e) => TransferError::Authority(e),
                })
            }
        }
    }

    /// SOURCE_CONFIRMED: get the command signed into a batch.
    ///
    /// A signed batch that does not carry this transfer's command means the
    /// command is still queued, so signing is requested again.
    async fn sign_commands(&self, state: &mut TransferState) -> TransferResult<()> {
        let dest = state.request.dest_chain.clone();
        retry(&self.policies.transport, "request_command_signing", |_| {
            self.authority.request_command_signing(&dest)
        })
        .await
        .map_err(authority_failure)?;

        let authority = self.authority.as_ref();
        let dest_chain = dest.as_str();
        let command_id = state.command_id.as_deref();
        let polled = poll_until(&self.policies.sign, "signed_batch", |_| async move {
            let batch = authority.poll_signed_batch(dest_chain, command_id).await?;
            let ours = command_id.map_or(true, |id| batch.contains(id));
            Ok::<_, AuthorityError>(match batch.status {
                BatchStatus::Signed if ours && batch.execute_payload.is_some() => PollStatus::Ready(batch),
                BatchStatus::Failed if ours => {
                    PollStatus::Failed(format!("batch {} was aborted", batch.batch_id))
                }
                BatchStatus::Signed | BatchStatus::Failed if !ours => {
                    tracing::debug!(batch_id = %batch.batch_id, "Latest batch lacks our command; re-requesting signing");
                    authority.request_command_signing(dest_chain).await?;
                    PollStatus::Pending
                }
                _ => PollStatus::Pending,
            })
        })
        .await;

        match polled {
            Ok((batch, attempts)) => {
                state.record_attempts(Phase::SourceConfirmed, attempts);
                metrics::record_poll_attempts("sign", attempts);
                let SignedBatch {
                    batch_id,
                    execute_payload,
                    ..
                } = batch;
                tracing::info!(chain = %dest, batch_id = %batch_id, "Command batch signed");
                state.batch_id = Some(batch_id);
                state.execute_payload = execute_payload;
                Ok(())
            }
            Err(e) => {
                let attempts = e.attempts().unwrap_or(0);
                state.record_attempts(Phase::SourceConfirmed, attempts);
                metrics::record_poll_attempts("sign", attempts);
                Err(match e {
                    RetryError::Exhausted { attempts, .. } | RetryError::DeadlineExceeded { attempts, .. } => {
                        TransferError::SigningTimeout { attempts }
                    }
                    RetryError::Failed(reason) => TransferError::SigningFailed(reason),
                    RetryError::Permanent(e) => TransferError::Authority(e),
                })
            }
        }
    }

    /// COMMANDS_SIGNED: hand the signed payload to the destination gateway.
    async fn execute(&self, state: &mut TransferState) -> TransferResult<()> {
        let chain = state.request.dest_chain.clone();
        let chain = chain.as_str();
        let Some(payload) = state.execute_payload.clone().filter(|p| !p.is_empty()) else {
            return Err(TransferError::InvalidTransition {
                from: Phase::CommandsSigned,
                to: Phase::Executed,
            });
        };
        let dest = self.ledger(chain)?;
        let pool = self.pool(chain)?;
        let _permit = pool.acquire(RELAYER).await;

        if let Some(tx_id) = state.dest_tx_id.clone() {
            if self.resolve_submission(dest.as_ref(), &tx_id).await? == Inclusion::Included {
                return Ok(());
            }
            tracing::warn!(chain, tx_id = %tx_id, "Earlier execution never landed");
            state.dest_tx_id = None;
        }

        if let Some(command_id) = state.command_id.clone() {
            let (executed, _) = retry(&self.policies.transport, "is_command_executed", |_| {
                dest.is_command_executed(&command_id)
            })
            .await
            .map_err(|e| ledger_failure(chain, e))?;
            if executed {
                tracing::info!(chain, command_id = %command_id, "Command already executed");
                return Ok(());
            }
        }

        let (ledger, payload) = (dest.as_ref(), &payload);
        let submitted = retry(&self.policies.transport, "submit_execution", |_| async move {
            ledger.submit_execution(payload).await.map_err(Submission)
        })
        .await;
        match submitted {
            Ok((tx_id, attempts)) => {
                state.record_attempts(Phase::CommandsSigned, attempts);
                tracing::info!(chain, tx_id = %tx_id, "Execution submitted");
                state.dest_tx_id = Some(tx_id);
                Ok(())
            }
            Err(RetryError::Permanent(Submission(LedgerError::OutcomeUnknown { tx_id }))) => {
                state.dest_tx_id = Some(tx_id.clone());
                self.persist(state);
                match self.resolve_submission(dest.as_ref(), &tx_id).await? {
                    Inclusion::Included => Ok(()),
                    Inclusion::Missing => Err(TransferError::UnresolvedSubmission {
                        chain: chain.to_string(),
                        tx_id,
                    }),
                }
            }
            Err(e) => Err(submission_failure(chain, e)),
        }
    }

    /// EXECUTED: check the recipient got exactly amount minus fee, on top of
    /// any sibling credits that landed since the baseline.
    async fn reconcile(&self, state: &mut TransferState) -> TransferResult<()> {
        let dest = self.ledger(&state.request.dest_chain)?;
        let Some(before) = state.dest_balance_before else {
            return Err(TransferError::InvalidTransition {
                from: Phase::Executed,
                to: Phase::Reconciled,
            });
        };
        let baseline = Baseline {
            balance: before,
            credited: state.baseline_credits.clone(),
        };
        let expected = state.expected_delta();

        let (reconciler, registry) = (&self.reconciler, &self.registry);
        let (ledger, current, baseline) = (dest.as_ref(), &*state, &baseline);
        let (reconciled, attempts) = retry(&self.policies.transport, "reconcile", |_| async move {
            let siblings = registry.sibling_credits(current);
            reconciler
                .verify(
                    ledger,
                    &current.request.recipient,
                    &current.request.symbol,
                    baseline,
                    expected,
                    &siblings,
                )
                .await
        })
        .await
        .map_err(reconcile_failure)?;
        state.record_attempts(Phase::Executed, attempts);
        tracing::info!(
            chain = %state.request.dest_chain,
            before = reconciled.before,
            after = reconciled.after,
            sibling_credits = reconciled.sibling_credits,
            "Balance reconciled"
        );
        Ok(())
    }

    /// Settle a broadcast whose inclusion is not known.
    async fn resolve_submission(&self, ledger: &dyn LedgerClient, tx_id: &str) -> TransferResult<Inclusion> {
        let polled = poll_until(&self.policies.transport, "transaction_status", |_| async move {
            Ok::<_, LedgerError>(match ledger.transaction_status(tx_id).await? {
                ConfirmationStatus::Confirmed { .. } => PollStatus::Ready(()),
                ConfirmationStatus::Failed(reason) => PollStatus::Failed(reason),
                ConfirmationStatus::NotFound
                | ConfirmationStatus::Pending
                | ConfirmationStatus::Confirming { .. } => PollStatus::Pending,
            })
        })
        .await;

        match polled {
            Ok(((), _)) => Ok(Inclusion::Included),
            Err(RetryError::Failed(reason)) => Err(TransferError::ledger(ledger.chain(), LedgerError::Reverted(reason))),
            Err(RetryError::Permanent(e)) => Err(TransferError::ledger(ledger.chain(), e)),
            Err(_) => match ledger.transaction_status(tx_id).await {
                Ok(ConfirmationStatus::NotFound) => Ok(Inclusion::Missing),
                _ => Err(TransferError::UnresolvedSubmission {
                    chain: ledger.chain().to_string(),
                    tx_id: tx_id.to_string(),
                }),
            },
        }
    }

    fn fail(&self, state: &mut TransferState, error: TransferError) {
        let class = error.class();
        if class.is_resumable() {
            tracing::warn!(phase = %state.phase, class = %class, error = %error, "Transfer failed");
        } else {
            tracing::error!(phase = %state.phase, class = %class, error = %error, "Transfer failed");
        }
        state.fail(&error);
        self.persist(state);
    }

    fn persist(&self, state: &TransferState) {
        self.registry.insert(state.clone());
        if let Err(e) = self.registry.save_to_file() {
            tracing::error!(transfer_id = %state.id, error = %e, "Failed to save transfer states");
        }
    }

    fn ledger(&self, chain: &str) -> TransferResult<&Arc<dyn LedgerClient>> {
        self.ledgers
            .get(chain)
            .ok_or_else(|| TransferError::UnknownChain(chain.to_string()))
    }

    fn pool(&self, chain: &str) -> TransferResult<&Arc<SubmissionPool>> {
        self.pools
            .get(chain)
            .ok_or_else(|| TransferError::UnknownChain(chain.to_string()))
    }
}

fn log_created(state: &TransferState) {
    tracing::info!(
        transfer_id = %state.id,
        source = %state.request.source_chain,
        dest = %state.request.dest_chain,
        symbol = %state.request.symbol,
        amount = state.request.amount,
        "Transfer created"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Inclusion {
    Included,
    /// The node does not know the transaction.
    Missing,
}

/// Marks a transfer as driven for as long as it lives.
struct Running<'a> {
    registry: &'a TransferRegistry,
    id: TransferId,
}

impl<'a> Running<'a> {
    fn claim(registry: &'a TransferRegistry, id: TransferId) -> Option<Self> {
        if !registry.claim(id) {
            return None;
        }
        metrics::transfer_started();
        Some(Self { registry, id })
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.registry.release(self.id);
        metrics::transfer_finished();
    }
}

/// Errors from a write. Only failures raised before anything was broadcast
/// are retried; a timed-out broadcast may still land.
#[derive(Debug)]
struct Submission(LedgerError);

impl Transient for Submission {
    fn is_transient(&self) -> bool {
        matches!(self.0, LedgerError::Transport(_) | LedgerError::GasPriceTooHigh { .. })
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The error that stopped a retry loop, or a description when there was none.
fn into_cause<E: fmt::Display>(e: RetryError<E>) -> Result<E, String> {
    match e {
        RetryError::Permanent(e)
        | RetryError::Exhausted { last: Some(e), .. }
        | RetryError::DeadlineExceeded { last: Some(e), .. } => Ok(e),
        other => Err(other.to_string()),
    }
}

fn ledger_failure(chain: &str, e: RetryError<LedgerError>) -> TransferError {
    match into_cause(e) {
        Ok(e) => TransferError::ledger(chain, e),
        Err(reason) => TransferError::ledger(chain, LedgerError::Transport(reason)),
    }
}

fn submission_failure(chain: &str, e: RetryError<Submission>) -> TransferError {
    match into_cause(e) {
        Ok(Submission(e)) => TransferError::ledger(chain, e),
        Err(reason) => TransferError::ledger(chain, LedgerError::Transport(reason)),
    }
}

fn authority_failure(e: RetryError<AuthorityError>) -> TransferError {
    match into_cause(e) {
        Ok(e) => TransferError::Authority(e),
        Err(reason) => TransferError::Authority(AuthorityError::Transport(reason)),
    }
}

fn reconcile_failure(e: RetryError<crate::reconcile::ReconcileError>) -> TransferError {
    match into_cause(e) {
        Ok(e) => TransferError::Reconciliation(e),
        Err(reason) => TransferError::Reconciliation(LedgerError::Transport(reason).into()),
    }
}
