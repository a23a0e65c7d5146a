pub mod anchor;
pub mod approval;
pub mod audit;
pub mod changes;
pub mod lifecycle;
pub mod payment;
pub mod proof;
pub mod reconcile;

pub use anchor::AnchorService;
pub use approval::ApprovalService;
pub use audit::{AuditLog, EntityRef, PublicAuditEntry};
pub use changes::ChangeRequestService;
pub use lifecycle::{derive_state, MilestoneState};
pub use payment::{PaymentService, ReleaseConfig};
pub use proof::ProofService;
pub use reconcile::{ReconcileConfig, ReconciliationService, SweepReport};

use audit::EntityRef as Entity;
use std::sync::Arc;
use tranche_chain::{ContractRegistry, NonceAllocator, SettlementGateway};
use tranche_store::{AuditAction, Bid, BidDraft, EscrowStore};
use tranche_types::{ActorContext, BidId, EscrowError, Result};

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub release: ReleaseConfig,
    pub reconcile: ReconcileConfig,
}

/// Wires the escrow services over one store and one settlement gateway.
pub struct EscrowEngine {
    pub store: Arc<dyn EscrowStore>,
    pub audit: Arc<AuditLog>,
    pub proofs: Arc<ProofService>,
    pub changes: Arc<ChangeRequestService>,
    pub approvals: Arc<ApprovalService>,
    pub payments: Arc<PaymentService>,
    pub reconciler: Arc<ReconciliationService>,
    pub anchors: Arc<AnchorService>,
}

impl EscrowEngine {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn SettlementGateway>,
        registry: ContractRegistry,
        config: EngineConfig,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(store.clone()));
        let nonces = Arc::new(NonceAllocator::new(gateway.clone()));

        let proofs = Arc::new(ProofService::new(store.clone(), audit.clone()));
        let changes = Arc::new(ChangeRequestService::new(store.clone(), audit.clone()));
        let approvals = Arc::new(ApprovalService::new(store.clone(), audit.clone()));
        let payments = Arc::new(PaymentService::new(
            store.clone(),
            gateway.clone(),
            registry.clone(),
            nonces,
            audit.clone(),
            config.release,
        ));
        let reconciler = Arc::new(ReconciliationService::new(
            store.clone(),
            gateway,
            registry,
            audit.clone(),
            config.reconcile,
        ));
        let anchors = Arc::new(AnchorService::new(store.clone(), audit.clone()));

        Self {
            store,
            audit,
            proofs,
            changes,
            approvals,
            payments,
            reconciler,
            anchors,
        }
    }

    /// Create a bid with its fixed, ordered milestone list.
    pub async fn create_bid(&self, ctx: &ActorContext, draft: BidDraft) -> Result<Bid> {
        if draft.vendor_id.trim().is_empty() {
            return Err(EscrowError::InvalidArgument("vendor id is empty".to_string()));
        }
        if draft.currency.trim().is_empty() {
            return Err(EscrowError::InvalidArgument("currency is empty".to_string()));
        }
        if draft.milestones.is_empty() {
            return Err(EscrowError::InvalidArgument(
                "bid needs at least one milestone".to_string(),
            ));
        }
        for (index, milestone) in draft.milestones.iter().enumerate() {
            if milestone.name.trim().is_empty() {
                return Err(EscrowError::InvalidArgument(format!(
                    "milestone {} has no name",
                    index
                )));
            }
            if milestone.amount.to_cents() == 0 {
                return Err(EscrowError::InvalidArgument(format!(
                    "milestone {} has a zero amount",
                    index
                )));
            }
        }

        let bid = self.store.create_bid(draft).await?;
        self.audit
            .record(
                ctx,
                AuditAction::BidCreated,
                Entity::bid(bid.id, bid.proposal_id),
                vec!["milestones"],
                None,
            )
            .await?;
        Ok(bid)
    }

    pub async fn get_bid(&self, id: BidId) -> Result<Bid> {
        self.store
            .get_bid(id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("bid {}", id)))
    }

    /// Store the analysis assistant's output verbatim. The core never
    /// reads it back for its own decisions.
    pub async fn attach_analysis(
        &self,
        ctx: &ActorContext,
        id: BidId,
        analysis: serde_json::Value,
    ) -> Result<()> {
        let bid = self.get_bid(id).await?;
        self.store.put_analysis(id, analysis).await?;
        self.audit
            .record(
                ctx,
                AuditAction::AnalysisAttached,
                Entity::bid(bid.id, bid.proposal_id),
                vec!["analysis"],
                None,
            )
            .await?;
        Ok(())
    }

    /// Derived state of one milestone, for read surfaces.
    pub async fn milestone_state(&self, id: BidId, index: u32) -> Result<MilestoneState> {
        let bid = self.get_bid(id).await?;
        let milestone = bid.milestone(index).ok_or_else(|| {
            EscrowError::InvalidMilestone(format!("index {} out of range for bid {}", index, id))
        })?;
        let has_open_request = self
            .store
            .open_request_for_milestone(id, index)
            .await?
            .is_some();
        let has_proof = self
            .store
            .proofs_for_milestone(id, index)
            .await?
            .iter()
            .any(|p| !p.archived);
        Ok(derive_state(milestone, has_open_request, has_proof))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;
    use tranche_chain::{BackoffPolicy, MockGateway};
    use tranche_chain::registry::TokenEntry;
    use tranche_store::{MemoryStore, MilestoneDraft};
    use tranche_types::{ContractAddress, TokenUnits, UsdAmount, WalletAddress};

    pub const TEST_DECIMALS: u8 = 6;

    /// Engine over a memory store and a mock settlement network with a
    /// funded custody signer and aggressive timeouts.
    pub async fn test_engine() -> (EscrowEngine, Arc<MockGateway>) {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(MockGateway::new(TEST_DECIMALS));
        gateway
            .set_custody_balance(TokenUnits::from_raw(1_000_000_000_000))
            .await;

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
                confirm_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(10),
                backoff: BackoffPolicy {
                    max_attempts: 4,
                    base: Duration::from_millis(1),
                    max: Duration::from_millis(8),
                },
            },
            reconcile: ReconcileConfig::default(),
        };
        let engine = EscrowEngine::new(store, gateway.clone(), registry, config);
        (engine, gateway)
    }

    /// A three-milestone bid: 250.00, 750.00 and 500.00 USDC.
    pub async fn funded_bid(engine: &EscrowEngine) -> Bid {
        let draft = BidDraft {
            proposal_id: tranche_types::ProposalId(1),
            vendor_id: "vendor-1".to_string(),
            payout_wallet: WalletAddress::from_bytes([2; 20]),
            currency: "USDC".to_string(),
            milestones: vec![
                MilestoneDraft {
                    name: "Design".to_string(),
                    amount: "250.00".parse::<UsdAmount>().unwrap(),
                    due_date: Utc::now(),
                },
                MilestoneDraft {
                    name: "Build".to_string(),
                    amount: "750.00".parse::<UsdAmount>().unwrap(),
                    due_date: Utc::now(),
                },
                MilestoneDraft {
                    name: "Launch".to_string(),
                    amount: "500.00".parse::<UsdAmount>().unwrap(),
                    due_date: Utc::now(),
                },
            ],
        };
        engine
            .create_bid(&ActorContext::admin("admin-1"), draft)
            .await
            .unwrap()
    }

    /// Funded bid with proofs on the first two milestones.
    pub async fn bid_with_proof(engine: &EscrowEngine) -> Bid {
        let bid = funded_bid(engine).await;
        let vendor = ActorContext::vendor("vendor-1");
        for index in [0u32, 1] {
            engine
                .proofs
                .submit_proof(&vendor, bid.id, index, format!("evidence {}", index), vec![])
                .await
                .unwrap();
        }
        bid
    }

    /// Bid whose first milestone is approved and ready for release.
    pub async fn approved_bid(engine: &EscrowEngine) -> Bid {
        let bid = bid_with_proof(engine).await;
        engine
            .approvals
            .approve(&ActorContext::admin("admin-1"), bid.id, 0, None)
            .await
            .unwrap();
        engine.get_bid(bid.id).await.unwrap()
    }
}
