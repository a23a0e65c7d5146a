use crate::audit::{AuditLog, EntityRef};
use crate::lifecycle::{load_bid, milestone_or_invalid};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use tranche_store::{AuditAction, EscrowStore, Proof};
use tranche_types::{ActorContext, BidId, EscrowError, FileRef, Result};

/// Accepts vendor evidence. Proofs are append-only revision history and
/// submitting one never moves the milestone's completion flag.
pub struct ProofService {
    store: Arc<dyn EscrowStore>,
    audit: Arc<AuditLog>,
}

impl ProofService {
    pub fn new(store: Arc<dyn EscrowStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    pub async fn submit_proof(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
        description: String,
        files: Vec<FileRef>,
    ) -> Result<Proof> {
        let bid = load_bid(self.store.as_ref(), bid_id).await?;
        let milestone = milestone_or_invalid(&bid, milestone_index)?;

        if milestone.archived {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is archived",
                milestone_index, bid_id
            )));
        }
        if milestone.completed {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is already completed",
                milestone_index, bid_id
            )));
        }
        if description.trim().is_empty() && files.is_empty() {
            return Err(EscrowError::InvalidArgument(
                "proof needs a description or at least one file".to_string(),
            ));
        }
        for file in &files {
            file.validate()?;
        }

        let proof = Proof {
            bid_id,
            milestone_index,
            description,
            files,
            created_at: Utc::now(),
            archived: false,
        };
        self.store.append_proof(proof.clone()).await?;

        self.audit
            .record(
                ctx,
                AuditAction::ProofSubmitted,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["proofs"],
                None,
            )
            .await?;

        info!(
            bid_id = %bid_id,
            milestone_index = milestone_index,
            files = proof.files.len(),
            actor = %ctx,
            "📎 Proof submitted"
        );
        Ok(proof)
    }

    /// Latest non-archived proof, if any.
    pub async fn current_proof(&self, bid_id: BidId, milestone_index: u32) -> Result<Option<Proof>> {
        let proofs = self
            .store
            .proofs_for_milestone(bid_id, milestone_index)
            .await?;
        Ok(proofs.into_iter().rev().find(|p| !p.archived))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{funded_bid, test_engine};

    #[tokio::test]
    async fn test_submit_proof_never_completes_milestone() {
        let (engine, _gateway) = test_engine().await;
        let bid = funded_bid(&engine).await;
        let ctx = ActorContext::vendor("vendor-1");

        engine
            .proofs
            .submit_proof(&ctx, bid.id, 0, "work done".to_string(), vec![])
            .await
            .unwrap();

        let stored = engine.store.get_bid(bid.id).await.unwrap().unwrap();
        assert!(!stored.milestones[0].completed);
        assert!(stored.milestones[0].completed_at.is_none());
    }

    #[tokio::test]
    async fn test_empty_proof_rejected_without_a_row() {
        let (engine, _gateway) = test_engine().await;
        let bid = funded_bid(&engine).await;
        let ctx = ActorContext::vendor("vendor-1");

        let result = engine
            .proofs
            .submit_proof(&ctx, bid.id, 0, "  ".to_string(), vec![])
            .await;
        assert!(matches!(result, Err(EscrowError::InvalidArgument(_))));

        let proofs = engine.store.proofs_for_milestone(bid.id, 0).await.unwrap();
        assert!(proofs.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_index_rejected() {
        let (engine, _gateway) = test_engine().await;
        let bid = funded_bid(&engine).await;
        let ctx = ActorContext::vendor("vendor-1");

        let result = engine
            .proofs
            .submit_proof(&ctx, bid.id, 99, "work".to_string(), vec![])
            .await;
        assert!(matches!(result, Err(EscrowError::InvalidMilestone(_))));
    }

    #[tokio::test]
    async fn test_current_proof_is_latest_revision() {
        let (engine, _gateway) = test_engine().await;
        let bid = funded_bid(&engine).await;
        let ctx = ActorContext::vendor("vendor-1");

        engine
            .proofs
            .submit_proof(&ctx, bid.id, 0, "first draft".to_string(), vec![])
            .await
            .unwrap();
        engine
            .proofs
            .submit_proof(&ctx, bid.id, 0, "revised".to_string(), vec![])
            .await
            .unwrap();

        let current = engine.proofs.current_proof(bid.id, 0).await.unwrap().unwrap();
        assert_eq!(current.description, "revised");
    }
}
