use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tranche_chain::{BackoffPolicy, ContractRegistry, MockGateway, TokenEntry};
use tranche_core::{EngineConfig, EscrowEngine, ReconcileConfig, ReleaseConfig};
use tranche_store::{BidDraft, EscrowStore, MemoryStore, MilestoneDraft};
use tranche_types::{
    ActorContext, BidId, ContractAddress, EscrowError, TokenUnits, UsdAmount, WalletAddress,
};

fn engine_with_gateway() -> (EscrowEngine, Arc<MockGateway>) {
    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(MockGateway::new(6));
    let registry = ContractRegistry::new(vec![TokenEntry {
        symbol: "USDC".to_string(),
        network: "devnet".to_string(),
        address: ContractAddress::from_bytes([9; 20]),
    }]);
    let config = EngineConfig {
        release: ReleaseConfig {
            network: "devnet".to_string(),
            custody: WalletAddress::from_bytes([8; 20]),
            confirmation_depth: 1,
            confirm_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            backoff: BackoffPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
        },
        reconcile: ReconcileConfig::default(),
    };
    (EscrowEngine::new(store, gateway.clone(), registry, config), gateway)
}

fn three_milestone_draft(proposal: u64) -> BidDraft {
    BidDraft {
        proposal_id: tranche_types::ProposalId(proposal),
        vendor_id: "vendor-acme".to_string(),
        payout_wallet: WalletAddress::from_bytes([2; 20]),
        currency: "USDC".to_string(),
        milestones: (0..3)
            .map(|i| MilestoneDraft {
                name: format!("Stage {}", i),
                amount: "250.00".parse::<UsdAmount>().unwrap(),
                due_date: Utc::now(),
            })
            .collect(),
    }
}

async fn approve_milestone(engine: &EscrowEngine, bid_id: BidId, index: u32) {
    let admin = ActorContext::admin("admin-ops");
    let vendor = ActorContext::vendor("vendor-acme");
    engine
        .proofs
        .submit_proof(&vendor, bid_id, index, "evidence".to_string(), vec![])
        .await
        .unwrap();
    engine
        .approvals
        .approve(&admin, bid_id, index, None)
        .await
        .unwrap();
}

/// Two simultaneous release calls for the same (bid 7, milestone 2):
/// exactly one transaction hash is recorded, the loser observes it.
#[tokio::test]
async fn test_simultaneous_release_for_bid_seven_index_two() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;
    let admin = ActorContext::admin("admin-ops");

    // Occupy ids 1..=6 so the bid under test is id 7.
    let mut bid = engine
        .create_bid(&admin, three_milestone_draft(1))
        .await
        .unwrap();
    for proposal in 2..=7 {
        bid = engine
            .create_bid(&admin, three_milestone_draft(proposal))
            .await
            .unwrap();
    }
    assert_eq!(bid.id, BidId(7));

    approve_milestone(&engine, bid.id, 2).await;

    let mut handles = Vec::new();
    for _ in 0..2 {
        let payments = engine.payments.clone();
        let ctx = admin.clone();
        let bid_id = bid.id;
        handles.push(tokio::spawn(async move {
            payments.release_payment(&ctx, bid_id, 2).await
        }));
    }

    let mut hashes = Vec::new();
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(payment) => hashes.push(payment.tx_hash),
            Err(EscrowError::DuplicatePayment(_)) => duplicates += 1,
            Err(other) => panic!("unexpected error: {}", other),
        }
    }
    assert_eq!(hashes.len(), 1);
    assert_eq!(duplicates, 1);

    let stored = engine.store.get_payment(bid.id, 2).await.unwrap().unwrap();
    assert_eq!(stored.tx_hash, hashes[0]);
}

/// Payment existence implies completion, for every milestone, at every
/// point in the flow.
#[tokio::test]
async fn test_payment_implies_completed() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;
    let admin = ActorContext::admin("admin-ops");

    let bid = engine
        .create_bid(&admin, three_milestone_draft(1))
        .await
        .unwrap();
    approve_milestone(&engine, bid.id, 0).await;
    approve_milestone(&engine, bid.id, 2).await;
    engine.payments.release_payment(&admin, bid.id, 2).await.unwrap();

    let stored = engine.get_bid(bid.id).await.unwrap();
    for (index, milestone) in stored.milestones.iter().enumerate() {
        let payment = engine.store.get_payment(bid.id, index as u32).await.unwrap();
        if payment.is_some() {
            assert!(milestone.completed, "paid milestone {} must be completed", index);
        }
    }
    // Completed does not imply paid.
    assert!(stored.milestones[0].completed);
    assert!(engine.store.get_payment(bid.id, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_insufficient_custody_balance_persists_nothing() {
    let (engine, gateway) = engine_with_gateway();
    let admin = ActorContext::admin("admin-ops");

    let bid = engine
        .create_bid(&admin, three_milestone_draft(1))
        .await
        .unwrap();
    approve_milestone(&engine, bid.id, 0).await;

    // 250.00 at six decimals needs 250_000_000 units; fund less.
    gateway
        .set_custody_balance(TokenUnits::from_raw(249_999_999))
        .await;

    let result = engine.payments.release_payment(&admin, bid.id, 0).await;
    match result {
        Err(EscrowError::InsufficientFunds {
            available,
            required,
        }) => {
            assert_eq!(available, 249_999_999);
            assert_eq!(required, 250_000_000);
        }
        other => panic!("expected InsufficientFunds, got {:?}", other.map(|p| p.tx_hash)),
    }

    let stored = engine.get_bid(bid.id).await.unwrap();
    assert!(stored.milestones[0].completed);
    assert!(stored.milestones[0].payment_tx_hash.is_none());

    // Funding the signer makes the same call succeed.
    gateway
        .set_custody_balance(TokenUnits::from_raw(250_000_000))
        .await;
    engine.payments.release_payment(&admin, bid.id, 0).await.unwrap();
}

/// A release racing the reconciliation sweep still settles exactly once.
#[tokio::test]
async fn test_release_and_reconcile_agree_on_one_payment() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;
    let admin = ActorContext::admin("admin-ops");

    let bid = engine
        .create_bid(&admin, three_milestone_draft(1))
        .await
        .unwrap();
    approve_milestone(&engine, bid.id, 0).await;

    let payment = engine.payments.release_payment(&admin, bid.id, 0).await.unwrap();
    // The sweep sees the same confirmed transfer on chain and must not
    // double-book it.
    let report = engine.reconciler.sweep().await.unwrap();
    assert_eq!(report.healed, 0);

    let stored = engine.store.get_payment(bid.id, 0).await.unwrap().unwrap();
    assert_eq!(stored.tx_hash, payment.tx_hash);
}
