//! Authority client that shells out to the `axelard` command-line tool.
//!
//! Queries run with `--output json`; transactions additionally carry gas,
//! keyring and signer flags. Every invocation is bounded by the configured
//! command timeout and killed when the caller gives up on it.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::authority::client::BridgeAuthorityClient;
use crate::authority::types::{
    AuthorityError, AuthorityResult, BatchStatus, ConfirmationHandle, RegistrationPolicy,
    SignedBatch, SourceConfirmation,
};
use crate::config::AuthorityConfig;
use crate::ledger::ExecutePayload;

/// How far back a batch lookup walks the batch chain.
const MAX_BATCH_LOOKBACK: usize = 8;

#[derive(Debug, Clone)]
pub struct AxelardClient {
    config: AuthorityConfig,
    /// Mint command id → the event it was matched to.
    claimed: Arc<DashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
    #[serde(default)]
    txhash: String,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    event: EventBody,
}

#[derive(Debug, Deserialize)]
struct EventBody {
    #[serde(default)]
    status: String,
    #[serde(default)]
    token_sent: Option<TokenSent>,
}

/// Transfer carried by a gateway `TokenSent` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct TokenSent {
    destination_chain: String,
    destination_address: String,
    symbol: String,
    amount: String,
}

/// What the event query says about a source transfer.
#[derive(Debug, PartialEq, Eq)]
enum EventStatus {
    Confirmed(TokenSent),
    Failed(String),
    Pending,
}

#[derive(Debug, Deserialize)]
struct PendingCommandsResponse {
    #[serde(default)]
    commands: Vec<CommandResponse>,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default)]
    id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    params: HashMap<String, String>,
}

impl CommandResponse {
    /// Whether this is the mint paying out `sent`.
    fn mints(&self, sent: &TokenSent) -> bool {
        let recipient = self.params.get("account").or_else(|| self.params.get("recipient"));
        let amount = self.params.get("amount").and_then(|a| a.parse::<u128>().ok());
        self.kind.eq_ignore_ascii_case("mintToken")
            && self.params.get("symbol") == Some(&sent.symbol)
            && recipient.is_some_and(|r| r.eq_ignore_ascii_case(&sent.destination_address))
            && sent.amount.parse::<u128>().ok().is_some_and(|a| amount == Some(a))
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    command_ids: Vec<String>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    execute_data: String,
    #[serde(default)]
    prev_batched_commands_id: String,
}

impl AxelardClient {
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            config,
            claimed: Arc::new(DashMap::new()),
        }
    }

    fn query_args(&self, args: &[&str]) -> Vec<String> {
        let mut out: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        out.extend([
            "--home".to_string(),
            self.config.home.clone(),
            "--node".to_string(),
            self.config.node.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        out
    }

    fn tx_args(&self, args: &[&str], from: &str) -> Vec<String> {
        let mut out = self.query_args(args);
        out.extend([
            "--gas".to_string(),
            "auto".to_string(),
            "--gas-adjustment".to_string(),
            self.config.gas_adjustment.to_string(),
            "--keyring-backend".to_string(),
            self.config.keyring_backend.clone(),
            "--from".to_string(),
            from.to_string(),
            "--chain-id".to_string(),
            self.config.chain_id.clone(),
            "-y".to_string(),
        ]);
        out
    }

    async fn run(&self, args: Vec<String>) -> AuthorityResult<String> {
        let limit = Duration::from_secs(self.config.command_timeout_secs);
        let mut command = Command::new(&self.config.binary);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(binary = %self.config.binary, args = %args.join(" "), "Running authority command");

        let output = match timeout(limit, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AuthorityError::Transport(format!(
                    "failed to run {}: {}",
                    self.config.binary, e
                )))
            }
            Err(_) => {
                return Err(AuthorityError::Transport(format!(
                    "{} timed out after {}s",
                    args.first().map(String::as_str).unwrap_or("command"),
                    self.config.command_timeout_secs
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            return Ok(stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() { stdout } else { stderr };
        Err(classify_failure(&message))
    }

    /// Run a transaction and fail on a non-zero result code.
    async fn run_tx(&self, args: &[&str], from: &str) -> AuthorityResult<String> {
        let stdout = self.run(self.tx_args(args, from)).await?;
        let response: TxResponse = serde_json::from_str(&stdout)
            .map_err(|e| AuthorityError::Parse(format!("tx response: {}", e)))?;
        if response.code != 0 {
            return Err(classify_failure(&response.raw_log));
        }
        Ok(response.txhash)
    }

    async fn gateway_of(&self, chain: &str) -> AuthorityResult<Option<String>> {
        match self.run(self.query_args(&["q", "evm", "gateway-address", chain])).await {
            Ok(stdout) => {
                let response: GatewayResponse = serde_json::from_str(&stdout)
                    .map_err(|e| AuthorityError::Parse(format!("gateway address: {}", e)))?;
                Ok(Some(response.address).filter(|a| !a.is_empty()))
            }
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("not set") => Ok(None),
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("unknown chain") => {
                Err(AuthorityError::UnknownChain(chain.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Find the mint command the authority created for a confirmed event.
    ///
    /// Pending commands are checked first, then the commands of recent
    /// batches. A command already matched to another event is skipped, so
    /// identical transfers each get their own command.
    async fn find_mint_command(&self, event_id: &str, sent: &TokenSent) -> AuthorityResult<Option<String>> {
        let chain = sent.destination_chain.as_str();
        let stdout = self
            .run(self.query_args(&["q", "evm", "pending-commands", chain]))
            .await?;
        let pending: PendingCommandsResponse = serde_json::from_str(&stdout)
            .map_err(|e| AuthorityError::Parse(format!("pending commands: {}", e)))?;
        for command in &pending.commands {
            if command.mints(sent) && self.claim(&command.id, event_id) {
                return Ok(Some(normalize_command_id(&command.id)));
            }
        }

        let latest_args = self.query_args(&["q", "evm", "latest-batched-commands", chain]);
        let (mut batch, mut prev) = match self.run(latest_args).await {
            Ok(stdout) => parse_batch(&stdout)?,
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("not found") => return Ok(None),
            Err(e) => return Err(e),
        };
        for _ in 0..=MAX_BATCH_LOOKBACK {
            for id in &batch.command_ids {
                if !self.claimable(id, event_id) {
                    continue;
                }
                let stdout = self.run(self.query_args(&["q", "evm", "command", chain, id])).await?;
                let command: CommandResponse = serde_json::from_str(&stdout)
                    .map_err(|e| AuthorityError::Parse(format!("command: {}", e)))?;
                if command.mints(sent) && self.claim(id, event_id) {
                    return Ok(Some(normalize_command_id(id)));
                }
            }
            let Some(id) = prev.take() else { break };
            let stdout = self
                .run(self.query_args(&["q", "evm", "batched-commands", chain, &id]))
                .await?;
            (batch, prev) = parse_batch(&stdout)?;
        }
        Ok(None)
    }

    fn claimable(&self, command_id: &str, event_id: &str) -> bool {
        self.claimed
            .get(&normalize_command_id(command_id))
            .map_or(true, |owner| owner.value() == event_id)
    }

    fn claim(&self, command_id: &str, event_id: &str) -> bool {
        let owner = self
            .claimed
            .entry(normalize_command_id(command_id))
            .or_insert_with(|| event_id.to_string());
        owner.value() == event_id
    }
}

#[async_trait]
impl BridgeAuthorityClient for AxelardClient {
    async fn register_gateway(&self, chain: &str, address: &str) -> AuthorityResult<()> {
        match self.gateway_of(chain).await? {
            Some(existing) if existing.eq_ignore_ascii_case(address) => {
                tracing::debug!(chain, address, "Gateway already registered");
                return Ok(());
            }
            Some(existing) if self.config.registration_policy == RegistrationPolicy::Reject => {
                return Err(AuthorityError::GatewayConflict {
                    chain: chain.to_string(),
                    existing,
                    requested: address.to_string(),
                });
            }
            Some(existing) => {
                tracing::warn!(chain, %existing, requested = address, "Overwriting registered gateway");
            }
            None => {}
        }

        let admin = self.config.admin_from.clone();
        let txhash = self
            .run_tx(&["tx", "evm", "set-gateway", chain, address], &admin)
            .await?;
        tracing::info!(chain, address, txhash = %txhash, "Gateway registered");
        Ok(())
    }

    async fn confirm_source_event(&self, chain: &str, tx_id: &str) -> AuthorityResult<ConfirmationHandle> {
        let from = self.config.from.clone();
        match self
            .run_tx(&["tx", "evm", "confirm-gateway-txs", chain, tx_id], &from)
            .await
        {
            Ok(txhash) => {
                tracing::info!(chain, tx_id, txhash = %txhash, "Source confirmation requested");
            }
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("already confirmed") => {
                return Err(AuthorityError::AlreadyConfirmed {
                    chain: chain.to_string(),
                    tx_id: tx_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
        Ok(ConfirmationHandle {
            chain: chain.to_string(),
            tx_id: tx_id.to_string(),
        })
    }

    async fn poll_confirmation(&self, handle: &ConfirmationHandle) -> AuthorityResult<SourceConfirmation> {
        let event_id = format!("{}-{}", handle.tx_id, self.config.token_sent_log_index);
        match self
            .run(self.query_args(&["q", "evm", "event", &handle.chain, &event_id]))
            .await
        {
            Ok(stdout) => match parse_event(&stdout)? {
                EventStatus::Confirmed(sent) => match self.find_mint_command(&event_id, &sent).await? {
                    Some(command_id) => {
                        tracing::debug!(chain = %handle.chain, event_id = %event_id, command_id = %command_id, "Mint command located");
                        Ok(SourceConfirmation::Confirmed {
                            command_id: Some(command_id),
                        })
                    }
                    None => {
                        tracing::debug!(chain = %handle.chain, event_id = %event_id, "Event confirmed; mint command not visible yet");
                        Ok(SourceConfirmation::Pending)
                    }
                },
                EventStatus::Failed(reason) => Ok(SourceConfirmation::Failed(reason)),
                EventStatus::Pending => Ok(SourceConfirmation::Pending),
            },
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("not found") => {
                Ok(SourceConfirmation::Pending)
            }
            Err(e) => Err(e),
        }
    }

    async fn request_command_signing(&self, dest_chain: &str) -> AuthorityResult<()> {
        let from = self.config.from.clone();
        match self.run_tx(&["tx", "evm", "sign-commands", dest_chain], &from).await {
            Ok(txhash) => {
                tracing::info!(chain = dest_chain, txhash = %txhash, "Command signing requested");
                Ok(())
            }
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("no commands") => {
                tracing::debug!(chain = dest_chain, "No pending commands to sign");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn poll_signed_batch(
        &self,
        dest_chain: &str,
        command_id: Option<&str>,
    ) -> AuthorityResult<SignedBatch> {
        let latest_args = self.query_args(&["q", "evm", "latest-batched-commands", dest_chain]);
        let (latest, mut prev) = match self.run(latest_args).await {
            Ok(stdout) => parse_batch(&stdout)?,
            Err(AuthorityError::Rejected(msg)) if msg.to_lowercase().contains("not found") => {
                return Ok(SignedBatch::pending())
            }
            Err(e) => return Err(e),
        };

        let Some(command_id) = command_id else {
            return Ok(latest);
        };
        if latest.contains(command_id) {
            return Ok(latest);
        }

        // Newer batches may have been cut since ours; walk back a few.
        for _ in 0..MAX_BATCH_LOOKBACK {
            let Some(id) = prev.take() else { break };
            let stdout = self
                .run(self.query_args(&["q", "evm", "batched-commands", dest_chain, &id]))
                .await?;
            let (batch, older) = parse_batch(&stdout)?;
            if batch.contains(command_id) {
                return Ok(batch);
            }
            prev = older;
        }
        Ok(latest)
    }
}

/// Separate transport trouble from a processed refusal.
fn classify_failure(message: &str) -> AuthorityError {
    let lower = message.to_lowercase();
    let transport = [
        "connection refused",
        "post failed",
        "timed out",
        "timeout",
        "eof",
        "no such host",
        "account sequence mismatch",
    ];
    if transport.iter().any(|needle| lower.contains(needle)) {
        AuthorityError::Transport(message.to_string())
    } else {
        AuthorityError::Rejected(message.to_string())
    }
}

fn parse_event(stdout: &str) -> AuthorityResult<EventStatus> {
    let response: EventResponse = serde_json::from_str(stdout)
        .map_err(|e| AuthorityError::Parse(format!("event: {}", e)))?;
    let event = response.event;
    Ok(match event.status.as_str() {
        "STATUS_CONFIRMED" | "STATUS_COMPLETED" => match event.token_sent {
            Some(sent) => EventStatus::Confirmed(sent),
            None => EventStatus::Failed("confirmed event is not a token transfer".to_string()),
        },
        "STATUS_FAILED" => EventStatus::Failed("event failed validation".to_string()),
        _ => EventStatus::Pending,
    })
}

fn normalize_command_id(id: &str) -> String {
    format!("0x{}", id.trim_start_matches("0x").to_lowercase())
}

/// Parse a batched-commands response into the batch and its predecessor id.
fn parse_batch(stdout: &str) -> AuthorityResult<(SignedBatch, Option<String>)> {
    let response: BatchResponse = serde_json::from_str(stdout)
        .map_err(|e| AuthorityError::Parse(format!("batched commands: {}", e)))?;

    let mut status = match response.status.as_str() {
        "BATCHED_COMMANDS_STATUS_SIGNED" => BatchStatus::Signed,
        "BATCHED_COMMANDS_STATUS_ABORTED" => BatchStatus::Failed,
        _ => BatchStatus::Pending,
    };
    let execute_payload = match status {
        BatchStatus::Signed if !response.execute_data.is_empty() => {
            Some(ExecutePayload::from_hex(&response.execute_data))
        }
        _ => None,
    };
    if status == BatchStatus::Signed && execute_payload.is_none() {
        status = BatchStatus::Pending;
    }

    let prev = Some(response.prev_batched_commands_id).filter(|id| !id.is_empty());
    Ok((
        SignedBatch {
            batch_id: response.id,
            status,
            command_ids: response.command_ids,
            execute_payload,
        },
        prev,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AxelardClient {
        AxelardClient::new(AuthorityConfig::default())
    }

    #[test]
    fn test_tx_args_carry_signer_flags() {
        let args = client().tx_args(&["tx", "evm", "sign-commands", "Polygon"], "relayer");
        let joined = args.join(" ");
        assert!(joined.starts_with("tx evm sign-commands Polygon --home ./chaindata/axelar"));
        assert!(joined.contains("--node tcp://localhost:26657 --output json"));
        assert!(joined.contains("--gas auto --gas-adjustment 1.5"));
        assert!(joined.contains("--keyring-backend test --from relayer --chain-id axelar-demo-1 -y"));
    }

    #[test]
    fn test_parse_signed_batch() {
        let raw = r#"{
            "id": "a1b2",
            "command_ids": ["c0ffee"],
            "data": "00",
            "sig_hash": "ff",
            "status": "BATCHED_COMMANDS_STATUS_SIGNED",
            "key_id": "evm-polygon-genesis",
            "execute_data": "09c5eabe",
            "prev_batched_commands_id": "9f9f"
        }"#;
        let (batch, prev) = parse_batch(raw).unwrap();
        assert_eq!(batch.status, BatchStatus::Signed);
        assert_eq!(batch.batch_id, "a1b2");
        assert!(batch.contains("0xc0ffee"));
        assert_eq!(batch.execute_payload.unwrap().prefixed(), "0x09c5eabe");
        assert_eq!(prev.as_deref(), Some("9f9f"));
    }

    #[test]
    fn test_signed_batch_without_data_is_pending() {
        let raw = r#"{"id": "a1", "status": "BATCHED_COMMANDS_STATUS_SIGNED", "execute_data": ""}"#;
        let (batch, prev) = parse_batch(raw).unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert!(prev.is_none());
    }

    #[test]
    fn test_parse_batch_statuses() {
        let signing = r#"{"id": "a1", "status": "BATCHED_COMMANDS_STATUS_SIGNING"}"#;
        assert_eq!(parse_batch(signing).unwrap().0.status, BatchStatus::Pending);
        let aborted = r#"{"id": "a1", "status": "BATCHED_COMMANDS_STATUS_ABORTED"}"#;
        assert_eq!(parse_batch(aborted).unwrap().0.status, BatchStatus::Failed);
        assert!(matches!(parse_batch("not json"), Err(AuthorityError::Parse(_))));
    }

    fn token_sent() -> TokenSent {
        TokenSent {
            destination_chain: "Polygon".into(),
            destination_address: "0x70997970C51812dc3A010C7d01b50e0d17dc79C8".into(),
            symbol: "USDC".into(),
            amount: "1000000".into(),
        }
    }

    #[test]
    fn test_parse_event() {
        let confirmed = r#"{
            "event": {
                "chain": "Ethereum",
                "tx_id": "0x5b3f0c1e4a4d0e2b7f9c2a1d8e6b5a4c3d2e1f0a9b8c7d6e5f4a3b2c1d0e9f8a",
                "index": "3",
                "status": "STATUS_COMPLETED",
                "token_sent": {
                    "sender": "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266",
                    "destination_chain": "Polygon",
                    "destination_address": "0x70997970C51812dc3A010C7d01b50e0d17dc79C8",
                    "symbol": "USDC",
                    "amount": "1000000"
                }
            }
        }"#;
        assert_eq!(parse_event(confirmed).unwrap(), EventStatus::Confirmed(token_sent()));

        let not_a_transfer = r#"{"event": {"status": "STATUS_CONFIRMED", "contract_call": {}}}"#;
        assert!(matches!(parse_event(not_a_transfer).unwrap(), EventStatus::Failed(_)));
        let pending = r#"{"event": {"status": "STATUS_UNSPECIFIED"}}"#;
        assert_eq!(parse_event(pending).unwrap(), EventStatus::Pending);
        let failed = r#"{"event": {"status": "STATUS_FAILED"}}"#;
        assert!(matches!(parse_event(failed).unwrap(), EventStatus::Failed(_)));
    }

    #[test]
    fn test_mint_command_matches_event() {
        let raw = r#"{
            "commands": [
                {
                    "id": "AB12",
                    "type": "mintToken",
                    "params": {
                        "symbol": "USDC",
                        "account": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
                        "amount": "1000000"
                    },
                    "key_id": "evm-polygon-genesis",
                    "max_gas_cost": 100000
                },
                {
                    "id": "cd34",
                    "type": "mintToken",
                    "params": {"symbol": "USDC", "account": "0x70997970c51812dc3a010c7d01b50e0d17dc79c8", "amount": "999999"}
                },
                {
                    "id": "ef56",
                    "type": "deployToken",
                    "params": {"symbol": "USDC", "name": "USD Coin"}
                }
            ]
        }"#;
        let pending: PendingCommandsResponse = serde_json::from_str(raw).unwrap();
        let sent = token_sent();
        let matching: Vec<&str> = pending
            .commands
            .iter()
            .filter(|c| c.mints(&sent))
            .map(|c| c.id.as_str())
            .collect();
        assert_eq!(matching, vec!["AB12"]);
        assert_eq!(normalize_command_id("AB12"), "0xab12");
    }

    #[test]
    fn test_command_is_claimed_by_one_event() {
        let client = client();
        assert!(client.claim("0xAB12", "0xaaa-3"));
        assert!(client.claim("ab12", "0xaaa-3"));
        assert!(!client.claim("ab12", "0xbbb-3"));
        assert!(!client.claimable("0xab12", "0xbbb-3"));
        assert!(client.claimable("0xab12", "0xaaa-3"));
        assert!(client.claimable("0xcd34", "0xbbb-3"));
    }

    #[test]
    fn test_classify_failure() {
        assert!(matches!(
            classify_failure("post failed: Post \"http://localhost:26657\": dial tcp: connection refused"),
            AuthorityError::Transport(_)
        ));
        assert!(matches!(
            classify_failure("event already confirmed"),
            AuthorityError::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let config = AuthorityConfig {
            binary: "/nonexistent/axelard".to_string(),
            ..AuthorityConfig::default()
        };
        let err = AxelardClient::new(config)
            .request_command_signing("Polygon")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthorityError::Transport(_)));
    }
}
