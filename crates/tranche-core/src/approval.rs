use crate::audit::{AuditLog, EntityRef};
use crate::lifecycle::{load_bid, milestone_or_invalid};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use tranche_store::{AuditAction, EscrowStore};
use tranche_types::{ActorContext, BidId, EscrowError, Result};

/// Explicit admin actions on a milestone: approval and the reversible
/// archive branch. Completion is never automatic, even when a proof
/// exists.
pub struct ApprovalService {
    store: Arc<dyn EscrowStore>,
    audit: Arc<AuditLog>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn EscrowStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    pub async fn approve(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
        summary: Option<String>,
    ) -> Result<()> {
        if !ctx.is_admin() {
            return Err(EscrowError::InvalidArgument(
                "only admins can approve milestones".to_string(),
            ));
        }

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
        let proofs = self
            .store
            .proofs_for_milestone(bid_id, milestone_index)
            .await?;
        if !proofs.iter().any(|p| !p.archived) {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} has no proof to approve",
                milestone_index, bid_id
            )));
        }
        if let Some(open) = self
            .store
            .open_request_for_milestone(bid_id, milestone_index)
            .await?
        {
            return Err(EscrowError::InvalidMilestone(format!(
                "change request {} must be resolved before approval",
                open.id
            )));
        }

        self.store
            .set_milestone_completed(bid_id, milestone_index, summary, Utc::now())
            .await?;

        self.audit
            .record(
                ctx,
                AuditAction::MilestoneApproved,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["completed", "completed_at", "proof_summary"],
                None,
            )
            .await?;

        info!(
            bid_id = %bid_id,
            milestone_index = milestone_index,
            actor = %ctx,
            "✅ Milestone approved"
        );
        Ok(())
    }

    pub async fn archive(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
    ) -> Result<()> {
        let bid = load_bid(self.store.as_ref(), bid_id).await?;
        let milestone = milestone_or_invalid(&bid, milestone_index)?;
        if milestone.payment_tx_hash.is_some() {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is paid and cannot be archived",
                milestone_index, bid_id
            )));
        }
        if milestone.archived {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is already archived",
                milestone_index, bid_id
            )));
        }

        self.store
            .set_milestone_archived(bid_id, milestone_index, true)
            .await?;
        self.audit
            .record(
                ctx,
                AuditAction::MilestoneArchived,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["archived"],
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn unarchive(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
    ) -> Result<()> {
        let bid = load_bid(self.store.as_ref(), bid_id).await?;
        let milestone = milestone_or_invalid(&bid, milestone_index)?;
        if !milestone.archived {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is not archived",
                milestone_index, bid_id
            )));
        }

        self.store
            .set_milestone_archived(bid_id, milestone_index, false)
            .await?;
        self.audit
            .record(
                ctx,
                AuditAction::MilestoneUnarchived,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["archived"],
                None,
            )
            .await?;
        Ok(())
    }
}
