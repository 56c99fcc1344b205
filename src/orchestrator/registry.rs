//! Transfer bookkeeping and persistence.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Mutex;

use crate::orchestrator::error::TransferError;
use crate::orchestrator::state::{Phase, TransferId, TransferState};
use crate::reconcile::SiblingCredit;

/// Every transfer the orchestrator knows about.
///
/// Besides the states themselves the registry keeps the idempotency index
/// (source chain, source tx id) → transfer, the pending abort requests and
/// the set of transfers a worker is currently driving.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    states: DashMap<TransferId, TransferState>,
    by_source_tx: DashMap<(String, String), TransferId>,
    abort_requests: DashSet<TransferId>,
    running: DashSet<TransferId>,
    persistence_path: Option<String>,
    write_lock: Mutex<()>,
}

impl TransferRegistry {
    pub fn new(persistence_path: Option<String>) -> Self {
        Self {
            persistence_path,
            ..Self::default()
        }
    }

    /// Load saved states if the file exists.
    ///
    /// A transfer that was still in flight when the file was written has no
    /// worker any more. It is marked FAILED so it can be resumed, unless it
    /// stopped in the middle of a source submission whose transaction id was
    /// never recorded: that one needs an operator to check the chain.
    pub fn load_from_file(path: &str) -> std::io::Result<Self> {
        let registry = Self::new(Some(path.to_string()));
        if !Path::new(path).exists() {
            return Ok(registry);
        }

        let reader = BufReader::new(File::open(path)?);
        let states: Vec<TransferState> = serde_json::from_reader(reader)?;
        let mut interrupted = 0usize;
        for mut state in states {
            if !state.is_terminal() {
                interrupted += 1;
                let error = if state.submitting && state.source_tx_id.is_none() {
                    TransferError::InterruptedSubmission {
                        chain: state.request.source_chain.clone(),
                    }
                } else {
                    TransferError::Aborted
                };
                tracing::warn!(
                    transfer_id = %state.id,
                    phase = %state.phase,
                    error = %error,
                    "Transfer was interrupted"
                );
                state.fail(&error);
            }
            registry.insert(state);
        }

        tracing::info!(
            path,
            transfers = registry.states.len(),
            interrupted,
            "Loaded transfer states"
        );
        Ok(registry)
    }

    /// Write every state to the persistence file, if one is configured.
    pub fn save_to_file(&self) -> std::io::Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());

        let mut states: Vec<TransferState> = self.states.iter().map(|r| r.value().clone()).collect();
        states.sort_by_key(|s| (s.created_at, s.id));

        let tmp = format!("{}.tmp", path);
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(writer, &states)?;
        }
        fs::rename(&tmp, path)?;
        tracing::debug!(path = %path, transfers = states.len(), "Saved transfer states");
        Ok(())
    }

    /// Insert or replace a state and index its source transaction.
    pub fn insert(&self, state: TransferState) {
        if let Some(tx_id) = &state.source_tx_id {
            self.by_source_tx
                .insert(source_key(&state.request.source_chain, tx_id), state.id);
        }
        self.states.insert(state.id, state);
    }

    /// Insert a state whose source transaction nobody owns yet.
    ///
    /// The index entry stays locked until the state is stored, so concurrent
    /// callers with the same transaction see exactly one winner. A loser
    /// gets the owning transfer's id back.
    pub fn insert_untracked(&self, state: TransferState) -> Result<(), TransferId> {
        let Some(tx_id) = &state.source_tx_id else {
            self.states.insert(state.id, state);
            return Ok(());
        };
        match self
            .by_source_tx
            .entry(source_key(&state.request.source_chain, tx_id))
        {
            Entry::Occupied(owner) => Err(*owner.get()),
            Entry::Vacant(slot) => {
                self.states.insert(state.id, state.clone());
                slot.insert(state.id);
                Ok(())
            }
        }
    }

    pub fn get(&self, id: TransferId) -> Option<TransferState> {
        self.states.get(&id).map(|r| r.value().clone())
    }

    /// Transfer that owns the given source transaction.
    pub fn find_by_source_tx(&self, chain: &str, tx_id: &str) -> Option<TransferId> {
        self.by_source_tx.get(&source_key(chain, tx_id)).map(|r| *r.value())
    }

    /// Credits other transfers with a command id expect on the same
    /// destination account and asset as `of`.
    pub fn sibling_credits(&self, of: &TransferState) -> Vec<SiblingCredit> {
        let target = &of.request;
        self.states
            .iter()
            .filter_map(|r| {
                let s = r.value();
                let shared = s.id != of.id
                    && s.request.dest_chain == target.dest_chain
                    && s.request.symbol == target.symbol
                    && s.request.recipient.eq_ignore_ascii_case(&target.recipient);
                let command_id = s.command_id.clone().filter(|_| shared)?;
                Some(SiblingCredit {
                    command_id,
                    amount: s.expected_delta(),
                    settled: s.phase == Phase::Reconciled,
                })
            })
            .collect()
    }

    /// All states, oldest first.
    pub fn list(&self) -> Vec<TransferState> {
        let mut states: Vec<TransferState> = self.states.iter().map(|r| r.value().clone()).collect();
        states.sort_by_key(|s| (s.created_at, s.id));
        states
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Count of transfers per phase.
    pub fn summary(&self) -> Vec<(Phase, usize)> {
        let mut counts = std::collections::BTreeMap::new();
        for r in self.states.iter() {
            *counts.entry(r.value().phase).or_insert(0usize) += 1;
        }
        counts.into_iter().collect()
    }

    pub fn request_abort(&self, id: TransferId) {
        self.abort_requests.insert(id);
    }

    pub fn abort_requested(&self, id: TransferId) -> bool {
        self.abort_requests.contains(&id)
    }

    pub fn clear_abort(&self, id: TransferId) {
        self.abort_requests.remove(&id);
    }

    /// Mark a transfer as driven by a worker. False if one already is.
    pub fn claim(&self, id: TransferId) -> bool {
        self.running.insert(id)
    }

    pub fn release(&self, id: TransferId) {
        self.running.remove(&id);
    }

    pub fn is_running(&self, id: TransferId) -> bool {
        self.running.contains(&id)
    }

    /// Transfers a worker is driving right now.
    pub fn running(&self) -> Vec<TransferId> {
        self.running.iter().map(|r| *r.key()).collect()
    }
}

fn source_key(chain: &str, tx_id: &str) -> (String, String) {
    (chain.to_string(), tx_id.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::error::ErrorClass;
    use crate::orchestrator::state::TransferRequest;

    fn state() -> TransferState {
        TransferState::new(
            TransferRequest {
                source_chain: "Ethereum".into(),
                dest_chain: "Polygon".into(),
                symbol: "USDC".into(),
                amount: 1_000,
                sender: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".into(),
                recipient: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into(),
            },
            0,
        )
    }

    #[test]
    fn test_source_tx_index() {
        let registry = TransferRegistry::new(None);
        let mut s = state();
        s.source_tx_id = Some("0xABCD".into());
        registry.insert(s.clone());

        assert_eq!(registry.find_by_source_tx("Ethereum", "0xabcd"), Some(s.id));
        assert_eq!(registry.find_by_source_tx("Polygon", "0xabcd"), None);
    }

    #[test]
    fn test_concurrent_adoption_has_one_owner() {
        let registry = std::sync::Arc::new(TransferRegistry::new(None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut s = state();
                    s.source_tx_id = Some("0xFEED".into());
                    let id = s.id;
                    registry.insert_untracked(s).map(|()| id).unwrap_or_else(|owner| owner)
                })
            })
            .collect();
        let owners: Vec<TransferId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(owners.iter().all(|id| *id == owners[0]));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(owners[0]).is_some());
        assert_eq!(registry.find_by_source_tx("Ethereum", "0xfeed"), Some(owners[0]));
    }

    #[test]
    fn test_sibling_credits_share_recipient_and_asset() {
        let registry = TransferRegistry::new(None);
        let ours = state();
        registry.insert(ours.clone());

        let mut same = state();
        same.request.recipient = same.request.recipient.to_lowercase();
        same.command_id = Some("0x01".into());
        same.fee = 10;
        same.phase = Phase::Reconciled;
        registry.insert(same);

        let mut unsigned = state();
        unsigned.command_id = None;
        registry.insert(unsigned);

        let mut other_asset = state();
        other_asset.request.symbol = "WETH".into();
        other_asset.command_id = Some("0x02".into());
        registry.insert(other_asset);

        let credits = registry.sibling_credits(&ours);
        assert_eq!(
            credits,
            vec![SiblingCredit {
                command_id: "0x01".into(),
                amount: 990,
                settled: true,
            }]
        );
    }

    #[test]
    fn test_claim_is_exclusive() {
        let registry = TransferRegistry::new(None);
        let s = state();
        assert!(registry.claim(s.id));
        assert!(!registry.claim(s.id));
        registry.release(s.id);
        assert!(registry.claim(s.id));
    }

    #[test]
    fn test_persistence_marks_in_flight_transfers() {
        let path = std::env::temp_dir().join(format!("transfers-{}.json", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();

        let registry = TransferRegistry::new(Some(path.clone()));
        let mut waiting = state();
        waiting.advance(Phase::SourceSent).unwrap();
        waiting.source_tx_id = Some("0x01".into());
        let mut broadcasting = state();
        broadcasting.submitting = true;
        let mut done = state();
        for phase in [
            Phase::SourceSent,
            Phase::SourceConfirmed,
            Phase::CommandsSigned,
            Phase::Executed,
            Phase::Reconciled,
        ] {
            done.advance(phase).unwrap();
        }
        for s in [&waiting, &broadcasting, &done] {
            registry.insert(s.clone());
        }
        registry.save_to_file().unwrap();

        let loaded = TransferRegistry::load_from_file(&path).unwrap();
        assert_eq!(loaded.len(), 3);

        let waiting = loaded.get(waiting.id).unwrap();
        assert_eq!(waiting.phase, Phase::Failed);
        assert_eq!(waiting.last_phase, Phase::SourceSent);
        assert_eq!(waiting.last_error.unwrap().class, ErrorClass::Aborted);
        assert!(loaded.find_by_source_tx("Ethereum", "0x01").is_some());

        let broadcasting = loaded.get(broadcasting.id).unwrap();
        assert_eq!(broadcasting.last_error.unwrap().class, ErrorClass::Validation);

        assert_eq!(loaded.get(done.id).unwrap().phase, Phase::Reconciled);

        std::fs::remove_file(&path).unwrap_or_default();
    }

    #[test]
    fn test_missing_file_yields_empty_registry() {
        let loaded = TransferRegistry::load_from_file("/nonexistent/transfers.json").unwrap();
        assert!(loaded.is_empty());
    }
}
