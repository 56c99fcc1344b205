//! Shared setup for integration tests: two in-memory ledgers, an in-memory
//! authority watching both, and an orchestrator with short polling budgets.

#![allow(dead_code)]

use std::sync::Arc;

use bridge_orchestrator::authority::{InMemoryAuthority, RegistrationPolicy, IN_MEMORY_SIGNER};
use bridge_orchestrator::ledger::InMemoryLedger;
use bridge_orchestrator::orchestrator::{Orchestrator, OrchestratorBuilder, TransferRequest};
use bridge_orchestrator::resilience::RetryPolicy;

pub const SOURCE: &str = "Ethereum";
pub const DEST: &str = "Polygon";
pub const SOURCE_GATEWAY: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";
pub const DEST_GATEWAY: &str = "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512";
pub const ALICE: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";
pub const BOB: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

/// One whole token with six decimals.
pub const UNIT: u128 = 1_000_000;

pub struct Harness {
    pub source: Arc<InMemoryLedger>,
    pub dest: Arc<InMemoryLedger>,
    pub authority: Arc<InMemoryAuthority>,
    pub orchestrator: Arc<Orchestrator>,
}

pub fn source_ledger() -> Arc<InMemoryLedger> {
    Arc::new(
        InMemoryLedger::new(SOURCE)
            .with_gateway(SOURCE_GATEWAY)
            .with_token("USDC")
            .with_trusted_signer(IN_MEMORY_SIGNER),
    )
}

pub fn dest_ledger() -> Arc<InMemoryLedger> {
    Arc::new(
        InMemoryLedger::new(DEST)
            .with_gateway(DEST_GATEWAY)
            .with_token("USDC")
            .with_trusted_signer(IN_MEMORY_SIGNER),
    )
}

/// Polling budget used by most tests: attempts spaced one second apart.
pub fn polling(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::fixed(max_attempts, 1000)
}

/// Orchestrator builder over the given clients with short budgets.
pub fn builder(
    authority: Arc<InMemoryAuthority>,
    source: &Arc<InMemoryLedger>,
    dest: &Arc<InMemoryLedger>,
) -> OrchestratorBuilder {
    Orchestrator::builder(authority)
        .ledger(source.clone(), 4)
        .ledger(dest.clone(), 4)
        .confirm_policy(polling(5))
        .sign_policy(polling(5))
        .transport_policy(RetryPolicy::fixed(3, 100))
}

/// Build a harness, letting the test adjust the authority and the builder.
pub async fn harness_with(
    authority: impl FnOnce(InMemoryAuthority) -> InMemoryAuthority,
    configure: impl FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
) -> Harness {
    let source = source_ledger();
    let dest = dest_ledger();
    let authority = Arc::new(authority(
        InMemoryAuthority::new(RegistrationPolicy::Reject)
            .attach(source.clone())
            .attach(dest.clone()),
    ));
    let orchestrator = Arc::new(configure(builder(authority.clone(), &source, &dest)).build());
    orchestrator.register_gateways().await.unwrap();

    Harness {
        source,
        dest,
        authority,
        orchestrator,
    }
}

pub async fn harness() -> Harness {
    harness_with(|a| a, |b| b).await
}

pub fn request(amount: u128) -> TransferRequest {
    TransferRequest {
        source_chain: SOURCE.to_string(),
        dest_chain: DEST.to_string(),
        symbol: "USDC".to_string(),
        amount,
        sender: ALICE.to_string(),
        recipient: BOB.to_string(),
    }
}

/// Distinct address derived from a small number.
pub fn account(n: usize) -> String {
    format!("{:#042x}", 0x1000 + n)
}

pub fn temp_state_file() -> String {
    std::env::temp_dir()
        .join(format!("bridge-transfers-{}.json", uuid::Uuid::new_v4()))
        .to_string_lossy()
        .to_string()
}
