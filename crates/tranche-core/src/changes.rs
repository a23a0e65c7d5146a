use crate::audit::{AuditLog, EntityRef};
use crate::lifecycle::{load_bid, milestone_or_invalid};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use tranche_store::{
    AuditAction, ChangeRequest, ChangeRequestStatus, ChangeResponse, EscrowStore,
};
use tranche_types::{ActorContext, BidId, EscrowError, FileRef, ProposalId, RequestId, Result};

/// Admin-initiated correction requests and vendor replies, one
/// independent thread per milestone.
///
/// A request stays open across any number of replies: "vendor replied"
/// and "admin satisfied" are different facts, and only an explicit
/// resolve call closes the gap between them.
pub struct ChangeRequestService {
    store: Arc<dyn EscrowStore>,
    audit: Arc<AuditLog>,
}

impl ChangeRequestService {
    pub fn new(store: Arc<dyn EscrowStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    pub async fn open_request(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
        comment: String,
        checklist: Vec<String>,
    ) -> Result<ChangeRequest> {
        if !ctx.is_admin() {
            return Err(EscrowError::InvalidArgument(
                "only admins can open change requests".to_string(),
            ));
        }
        if comment.trim().is_empty() {
            return Err(EscrowError::InvalidArgument(
                "change request needs a comment".to_string(),
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
                "milestone {} of bid {} has no proof under review",
                milestone_index, bid_id
            )));
        }
        if let Some(existing) = self
            .store
            .open_request_for_milestone(bid_id, milestone_index)
            .await?
        {
            return Err(EscrowError::InvalidArgument(format!(
                "change request {} is already open for this milestone",
                existing.id
            )));
        }

        let request = ChangeRequest::new(
            bid_id,
            bid.proposal_id,
            milestone_index,
            comment,
            checklist,
            Utc::now(),
        );
        self.store.put_change_request(request.clone()).await?;

        self.audit
            .record(
                ctx,
                AuditAction::ChangeRequestOpened,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["change_requests"],
                None,
            )
            .await?;

        info!(
            request_id = %request.id,
            bid_id = %bid_id,
            milestone_index = milestone_index,
            checklist_items = request.checklist.len(),
            "📝 Change request opened"
        );
        Ok(request)
    }

    pub async fn post_response(
        &self,
        ctx: &ActorContext,
        request_id: RequestId,
        comment: String,
        files: Vec<FileRef>,
    ) -> Result<ChangeRequest> {
        if comment.trim().is_empty() && files.is_empty() {
            return Err(EscrowError::InvalidArgument(
                "response needs a comment or at least one file".to_string(),
            ));
        }
        for file in &files {
            file.validate()?;
        }

        let request = self
            .store
            .get_change_request(request_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("change request {}", request_id)))?;
        if !request.is_open() {
            return Err(EscrowError::InvalidArgument(format!(
                "change request {} is {}",
                request_id, request.status
            )));
        }

        let response = ChangeResponse {
            comment,
            files,
            created_at: Utc::now(),
        };
        self.store
            .append_change_response(request_id, response)
            .await?;

        self.audit
            .record(
                ctx,
                AuditAction::ChangeResponsePosted,
                EntityRef::milestone(request.bid_id, request.proposal_id, request.milestone_index),
                vec!["responses"],
                None,
            )
            .await?;

        // The thread accumulates; the request itself stays open until an
        // explicit admin resolve.
        let updated = self
            .store
            .get_change_request(request_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("change request {}", request_id)))?;
        Ok(updated)
    }

    pub async fn resolve(
        &self,
        ctx: &ActorContext,
        request_id: RequestId,
        status: ChangeRequestStatus,
    ) -> Result<()> {
        if !ctx.is_admin() {
            return Err(EscrowError::InvalidArgument(
                "only admins can resolve change requests".to_string(),
            ));
        }
        if status == ChangeRequestStatus::Open {
            return Err(EscrowError::InvalidArgument(
                "resolve target must be resolved or closed".to_string(),
            ));
        }

        let request = self
            .store
            .get_change_request(request_id)
            .await?
            .ok_or_else(|| EscrowError::NotFound(format!("change request {}", request_id)))?;
        if !request.is_open() {
            return Err(EscrowError::InvalidArgument(format!(
                "change request {} is already {}",
                request_id, request.status
            )));
        }

        self.store
            .set_change_request_status(request_id, status)
            .await?;

        self.audit
            .record(
                ctx,
                AuditAction::ChangeRequestResolved,
                EntityRef::milestone(request.bid_id, request.proposal_id, request.milestone_index),
                vec!["status"],
                None,
            )
            .await?;

        info!(
            request_id = %request_id,
            status = %status,
            responses = request.responses.len(),
            "✅ Change request resolved"
        );
        Ok(())
    }

    /// Open requests for a proposal, oldest first, each with its replies
    /// in creation order.
    pub async fn open_for_proposal(&self, proposal: ProposalId) -> Result<Vec<ChangeRequest>> {
        Ok(self.store.open_requests_for_proposal(proposal).await?)
    }
}
