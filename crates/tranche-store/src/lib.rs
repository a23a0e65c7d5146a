pub mod memory;
pub mod model;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryStore;
pub use model::{
    Anchor, AuditAction, AuditEvent, Bid, BidDraft, ChangeRequest, ChangeRequestStatus,
    ChangeResponse, Milestone, MilestoneDraft, Payment, PendingSettlement, Proof,
};
#[cfg(feature = "rocksdb")]
pub use rocks::RocksStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tranche_types::{BidId, ProposalId, RequestId};

/// Durable record of bids, proofs, change requests, payments and the
/// audit log. Correctness under concurrency rests on this trait's
/// conditional operations; there is no other shared mutable state.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    // Bids and milestones
    async fn create_bid(&self, draft: BidDraft) -> Result<Bid>;
    async fn get_bid(&self, id: BidId) -> Result<Option<Bid>>;
    async fn list_bids(&self) -> Result<Vec<Bid>>;
    async fn bids_for_proposal(&self, proposal: ProposalId) -> Result<Vec<Bid>>;
    async fn set_milestone_completed(
        &self,
        id: BidId,
        index: u32,
        summary: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()>;
    async fn set_milestone_archived(&self, id: BidId, index: u32, archived: bool) -> Result<()>;
    async fn put_analysis(&self, id: BidId, analysis: serde_json::Value) -> Result<()>;

    // Proofs (append-only)
    async fn append_proof(&self, proof: Proof) -> Result<()>;
    async fn proofs_for_milestone(&self, id: BidId, index: u32) -> Result<Vec<Proof>>;

    // Change requests
    async fn put_change_request(&self, request: ChangeRequest) -> Result<()>;
    async fn get_change_request(&self, id: RequestId) -> Result<Option<ChangeRequest>>;
    async fn append_change_response(&self, id: RequestId, response: ChangeResponse) -> Result<()>;
    async fn set_change_request_status(
        &self,
        id: RequestId,
        status: ChangeRequestStatus,
    ) -> Result<()>;
    async fn open_requests_for_proposal(&self, proposal: ProposalId) -> Result<Vec<ChangeRequest>>;
    async fn open_request_for_milestone(
        &self,
        id: BidId,
        index: u32,
    ) -> Result<Option<ChangeRequest>>;

    // Payments
    /// Record the payment and stamp the milestone's transaction hash in
    /// one step, only if no hash is currently set. Returns `false` when a
    /// payment already exists; the caller must treat that as a duplicate,
    /// not submit another transfer.
    async fn record_payment_if_absent(&self, id: BidId, index: u32, payment: Payment)
        -> Result<bool>;
    async fn get_payment(&self, id: BidId, index: u32) -> Result<Option<Payment>>;

    // Pending settlements (confirmation outcome unknown)
    async fn record_pending_settlement(&self, pending: PendingSettlement) -> Result<()>;
    async fn list_pending_settlements(&self) -> Result<Vec<PendingSettlement>>;
    async fn clear_pending_settlement(&self, id: BidId, index: u32) -> Result<()>;

    // Audit log (append-only, never mutated or deleted)
    /// Assigns the next sequence number and persists the event. The `seq`
    /// on the passed event is ignored.
    async fn append_audit_event(&self, event: AuditEvent) -> Result<AuditEvent>;
    async fn audit_events_for_proposal(&self, proposal: ProposalId) -> Result<Vec<AuditEvent>>;
    async fn audit_events_after(&self, seq: u64) -> Result<Vec<AuditEvent>>;

    // Anchors
    async fn record_anchor(&self, anchor: Anchor) -> Result<()>;
    async fn latest_anchor(&self) -> Result<Option<Anchor>>;
}
