use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tranche_chain::{BackoffPolicy, ContractRegistry, MockGateway, TokenEntry};
use tranche_core::{EngineConfig, EscrowEngine, MilestoneState, ReconcileConfig, ReleaseConfig};
use tranche_store::{
    AuditAction, BidDraft, ChangeRequestStatus, EscrowStore, MemoryStore, MilestoneDraft,
};
use tranche_types::{
    ActorContext, ContractAddress, TokenUnits, UsdAmount, WalletAddress,
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

fn two_milestone_draft(vendor_wallet: WalletAddress) -> BidDraft {
    BidDraft {
        proposal_id: tranche_types::ProposalId(42),
        vendor_id: "vendor-acme".to_string(),
        payout_wallet: vendor_wallet,
        currency: "USDC".to_string(),
        milestones: vec![
            MilestoneDraft {
                name: "Prototype".to_string(),
                amount: "250.00".parse::<UsdAmount>().unwrap(),
                due_date: Utc::now(),
            },
            MilestoneDraft {
                name: "Delivery".to_string(),
                amount: "1000.00".parse::<UsdAmount>().unwrap(),
                due_date: Utc::now(),
            },
        ],
    }
}

/// The complete lifecycle: proof, negotiation rounds, explicit approval,
/// release, and the audit trail that ties it together.
#[tokio::test]
async fn test_full_milestone_lifecycle() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;

    let admin = ActorContext::admin("admin-ops");
    let vendor = ActorContext::vendor("vendor-acme");
    let wallet = WalletAddress::from_bytes([2; 20]);

    let bid = engine
        .create_bid(&admin, two_milestone_draft(wallet))
        .await
        .unwrap();
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::Open
    );

    // Vendor submits evidence; status must not move past review.
    engine
        .proofs
        .submit_proof(&vendor, bid.id, 0, "prototype screencast".to_string(), vec![])
        .await
        .unwrap();
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::AwaitingReview
    );

    // One negotiation round.
    let request = engine
        .changes
        .open_request(
            &admin,
            bid.id,
            0,
            "needs a load test".to_string(),
            vec!["attach load test output".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::ChangesRequested
    );

    engine
        .changes
        .post_response(&vendor, request.id, "load test attached".to_string(), vec![])
        .await
        .unwrap();
    engine
        .changes
        .resolve(&admin, request.id, ChangeRequestStatus::Resolved)
        .await
        .unwrap();
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::AwaitingReview
    );

    // Explicit approval, then release.
    engine
        .approvals
        .approve(&admin, bid.id, 0, Some("accepted".to_string()))
        .await
        .unwrap();
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::Completed
    );

    let payment = engine.payments.release_payment(&admin, bid.id, 0).await.unwrap();
    assert_eq!(payment.units, TokenUnits::from_raw(250_000_000));
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::Paid
    );

    // Payment implies completion, never the other way around.
    let stored = engine.get_bid(bid.id).await.unwrap();
    assert!(stored.milestones[0].completed);
    assert!(stored.milestones[1].completed_at.is_none());

    // One audit event per mutation, in commit order.
    let actions: Vec<AuditAction> = engine
        .audit
        .events_for_proposal(bid.proposal_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::BidCreated,
            AuditAction::ProofSubmitted,
            AuditAction::ChangeRequestOpened,
            AuditAction::ChangeResponsePosted,
            AuditAction::ChangeRequestResolved,
            AuditAction::MilestoneApproved,
            AuditAction::PaymentReleased,
        ]
    );

    // The public feed carries the settlement reference but no actor ids.
    let feed = engine.audit.public_feed(bid.proposal_id).await.unwrap();
    let released = feed
        .iter()
        .find(|e| e.action == AuditAction::PaymentReleased)
        .unwrap();
    assert_eq!(released.reference, Some(payment.tx_hash.to_string()));
    let serialized = serde_json::to_string(&feed).unwrap();
    assert!(!serialized.contains("admin-ops"));
    assert!(!serialized.contains("vendor-acme"));
}

#[tokio::test]
async fn test_second_milestone_is_independent() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;

    let admin = ActorContext::admin("admin-ops");
    let vendor = ActorContext::vendor("vendor-acme");
    let bid = engine
        .create_bid(&admin, two_milestone_draft(WalletAddress::from_bytes([2; 20])))
        .await
        .unwrap();

    engine
        .proofs
        .submit_proof(&vendor, bid.id, 1, "final delivery".to_string(), vec![])
        .await
        .unwrap();
    engine.approvals.approve(&admin, bid.id, 1, None).await.unwrap();
    engine.payments.release_payment(&admin, bid.id, 1).await.unwrap();

    // Milestone 0 is untouched by its sibling's settlement.
    assert_eq!(
        engine.milestone_state(bid.id, 0).await.unwrap(),
        MilestoneState::Open
    );
    assert!(engine.store.get_payment(bid.id, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn test_anchoring_covers_the_lifecycle() {
    let (engine, gateway) = engine_with_gateway();
    gateway
        .set_custody_balance(TokenUnits::from_raw(10_000_000_000))
        .await;

    let admin = ActorContext::admin("admin-ops");
    let vendor = ActorContext::vendor("vendor-acme");
    let bid = engine
        .create_bid(&admin, two_milestone_draft(WalletAddress::from_bytes([2; 20])))
        .await
        .unwrap();
    engine
        .proofs
        .submit_proof(&vendor, bid.id, 0, "work".to_string(), vec![])
        .await
        .unwrap();

    let anchor = engine.anchors.anchor_pending().await.unwrap().unwrap();
    assert_eq!(anchor.up_to_seq, 2);
    assert_eq!(anchor.content_hash.len(), 64);

    let stored = engine.store.latest_anchor().await.unwrap().unwrap();
    assert_eq!(stored.content_hash, anchor.content_hash);
}
