//! Many transfers at once: admission control, per-sender serialization and
//! shared command batches.

use bridge_orchestrator::ledger::LedgerOp;
use bridge_orchestrator::orchestrator::{Phase, TransferRequest};

mod common;
use common::*;

fn request_from(sender: &str, recipient: &str, amount: u128) -> TransferRequest {
    TransferRequest {
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        ..request(amount)
    }
}

#[tokio::test(start_paused = true)]
async fn test_independent_transfers_all_reconcile() {
    let h = harness_with(|a| a.with_sign_after(2), |b| b.max_concurrent_transfers(4)).await;
    let count = 20;
    let requests: Vec<TransferRequest> = (0..count)
        .map(|i| {
            let sender = account(i);
            h.source.mint(&sender, "USDC", UNIT);
            request_from(&sender, &account(100 + i), UNIT)
        })
        .collect();

    let outcomes = h.orchestrator.run_all(requests).await;

    assert_eq!(outcomes.len(), count);
    for outcome in &outcomes {
        let outcome = outcome.as_ref().unwrap();
        assert_eq!(outcome.phase, Phase::Reconciled, "{:?}", outcome.error);
    }
    for i in 0..count {
        assert_eq!(h.source.balance(&account(i), "USDC"), 0);
        assert_eq!(h.dest.balance(&account(100 + i), "USDC"), UNIT);
    }
    assert_eq!(h.source.calls(LedgerOp::SubmitTransfer), count as u32);
    assert!(h.dest.calls(LedgerOp::SubmitExecution) <= count as u32);
    assert!(h.orchestrator.registry().running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_sender_transfers_are_serialized() {
    let h = harness().await;
    let count = 5;
    h.source.mint(ALICE, "USDC", count as u128 * UNIT);
    let requests: Vec<TransferRequest> = (0..count)
        .map(|i| request_from(ALICE, &account(200 + i), UNIT))
        .collect();

    let outcomes = h.orchestrator.run_all(requests).await;

    assert!(outcomes
        .iter()
        .all(|o| matches!(o, Ok(outcome) if outcome.phase == Phase::Reconciled)));
    assert_eq!(h.source.balance(ALICE, "USDC"), 0);
    for i in 0..count {
        assert_eq!(h.dest.balance(&account(200 + i), "USDC"), UNIT);
    }
}

#[tokio::test(start_paused = true)]
async fn test_failures_do_not_affect_other_transfers() {
    let h = harness_with(|a| a, |b| b.max_concurrent_transfers(2)).await;
    let funded = account(1);
    let broke = account(2);
    h.source.mint(&funded, "USDC", UNIT);

    let outcomes = h
        .orchestrator
        .run_all(vec![
            request_from(&funded, &account(301), UNIT),
            request_from(&broke, &account(302), UNIT),
        ])
        .await;

    let phases: Vec<Phase> = outcomes.iter().map(|o| o.as_ref().unwrap().phase).collect();
    assert_eq!(phases, vec![Phase::Reconciled, Phase::Failed]);
    assert_eq!(h.dest.balance(&account(301), "USDC"), UNIT);
    assert_eq!(h.dest.balance(&account(302), "USDC"), 0);

    let summary = h.orchestrator.registry().summary();
    assert!(summary.contains(&(Phase::Reconciled, 1)));
    assert!(summary.contains(&(Phase::Failed, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_transfers_to_one_recipient_all_reconcile() {
    let h = harness_with(|a| a.with_sign_after(2), |b| b.max_concurrent_transfers(4)).await;
    let senders = [account(1), account(2)];
    for sender in &senders {
        h.source.mint(sender, "USDC", UNIT);
    }

    let outcomes = h
        .orchestrator
        .run_all(senders.iter().map(|s| request_from(s, BOB, UNIT)).collect())
        .await;

    for outcome in &outcomes {
        let outcome = outcome.as_ref().unwrap();
        assert_eq!(outcome.phase, Phase::Reconciled, "{:?}", outcome.error);
    }
    assert_eq!(h.dest.balance(BOB, "USDC"), 2 * UNIT);
}

#[tokio::test(start_paused = true)]
async fn test_recipient_with_settled_history_reconciles() {
    let h = harness().await;
    h.source.mint(ALICE, "USDC", 3 * UNIT);

    for _ in 0..3 {
        let outcome = h.orchestrator.initiate_transfer(request_from(ALICE, BOB, UNIT)).await.unwrap();
        assert_eq!(outcome.phase, Phase::Reconciled, "{:?}", outcome.error);
    }
    assert_eq!(h.dest.balance(BOB, "USDC"), 3 * UNIT);
}
