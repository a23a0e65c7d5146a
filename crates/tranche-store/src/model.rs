use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tranche_types::{
    ActorRole, BidId, FileRef, ProposalId, RequestId, TokenUnits, TxHash, UsdAmount, WalletAddress,
};

/// Milestone list entry supplied at bid creation. Positions are fixed
/// from this point on; `milestone_index` is the permanent address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneDraft {
    pub name: String,
    pub amount: UsdAmount,
    pub due_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidDraft {
    pub proposal_id: ProposalId,
    pub vendor_id: String,
    pub payout_wallet: WalletAddress,
    pub currency: String,
    pub milestones: Vec<MilestoneDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub name: String,
    pub amount: UsdAmount,
    pub due_date: DateTime<Utc>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub proof_summary: Option<String>,
    /// Once set this is immutable and is the single source of truth for
    /// "paid".
    pub payment_tx_hash: Option<TxHash>,
    pub paid_at: Option<DateTime<Utc>>,
    pub archived: bool,
}

impl From<MilestoneDraft> for Milestone {
    fn from(draft: MilestoneDraft) -> Self {
        Self {
            name: draft.name,
            amount: draft.amount,
            due_date: draft.due_date,
            completed: false,
            completed_at: None,
            proof_summary: None,
            payment_tx_hash: None,
            paid_at: None,
            archived: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: BidId,
    pub proposal_id: ProposalId,
    pub vendor_id: String,
    pub payout_wallet: WalletAddress,
    /// Fixed stablecoin symbol for the whole bid, e.g. `USDC`.
    pub currency: String,
    /// Ordered, append-only-by-position. Never reordered, even when
    /// individual milestones are archived.
    pub milestones: Vec<Milestone>,
    pub created_at: DateTime<Utc>,
    /// Opaque bid-analysis output; stored verbatim, never interpreted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
}

impl Bid {
    pub fn milestone(&self, index: u32) -> Option<&Milestone> {
        self.milestones.get(index as usize)
    }
}

/// Vendor-submitted evidence. Append-only; the latest non-archived proof
/// for a milestone is the "current" one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proof {
    pub bid_id: BidId,
    pub milestone_index: u32,
    pub description: String,
    pub files: Vec<FileRef>,
    pub created_at: DateTime<Utc>,
    pub archived: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestStatus {
    Open,
    Resolved,
    Closed,
}

impl fmt::Display for ChangeRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Resolved => write!(f, "resolved"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeResponse {
    pub comment: String,
    pub files: Vec<FileRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: RequestId,
    pub bid_id: BidId,
    pub proposal_id: ProposalId,
    pub milestone_index: u32,
    pub status: ChangeRequestStatus,
    pub comment: String,
    pub checklist: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Vendor replies in creation order.
    pub responses: Vec<ChangeResponse>,
}

impl ChangeRequest {
    pub fn new(
        bid_id: BidId,
        proposal_id: ProposalId,
        milestone_index: u32,
        comment: String,
        checklist: Vec<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&bid_id.0.to_le_bytes());
        hasher.update(&milestone_index.to_le_bytes());
        hasher.update(comment.as_bytes());
        hasher.update(&created_at.timestamp_micros().to_le_bytes());
        let id = RequestId::from_bytes(*hasher.finalize().as_bytes());

        Self {
            id,
            bid_id,
            proposal_id,
            milestone_index,
            status: ChangeRequestStatus::Open,
            comment,
            checklist,
            created_at,
            responses: Vec::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ChangeRequestStatus::Open
    }
}

/// At most one per (bid, milestone index). Written once after on-chain
/// confirmation, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub tx_hash: TxHash,
    pub amount: UsdAmount,
    pub units: TokenUnits,
    pub currency: String,
    pub released_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    BidCreated,
    AnalysisAttached,
    ProofSubmitted,
    ChangeRequestOpened,
    ChangeResponsePosted,
    ChangeRequestResolved,
    MilestoneApproved,
    MilestoneArchived,
    MilestoneUnarchived,
    PaymentReleased,
    PaymentReconciled,
    SettlementAbandoned,
    AnchorCommitted,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BidCreated => "bid_created",
            Self::AnalysisAttached => "analysis_attached",
            Self::ProofSubmitted => "proof_submitted",
            Self::ChangeRequestOpened => "change_request_opened",
            Self::ChangeResponsePosted => "change_response_posted",
            Self::ChangeRequestResolved => "change_request_resolved",
            Self::MilestoneApproved => "milestone_approved",
            Self::MilestoneArchived => "milestone_archived",
            Self::MilestoneUnarchived => "milestone_unarchived",
            Self::PaymentReleased => "payment_released",
            Self::PaymentReconciled => "payment_reconciled",
            Self::SettlementAbandoned => "settlement_abandoned",
            Self::AnchorCommitted => "anchor_committed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Store-assigned, strictly increasing in commit order.
    pub seq: u64,
    pub actor_id: String,
    pub actor_role: ActorRole,
    pub action: AuditAction,
    pub bid_id: Option<BidId>,
    pub proposal_id: Option<ProposalId>,
    pub milestone_index: Option<u32>,
    pub changed_fields: Vec<String>,
    /// Transaction hash or content hash tied to this event, if any.
    pub reference: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

/// Tamper-evidence checkpoint over a batch of audit events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anchor {
    pub up_to_seq: u64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A transfer that was submitted but whose confirmation outcome is
/// unknown (confirmation wait timed out). Reconciliation resolves these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSettlement {
    pub bid_id: BidId,
    pub milestone_index: u32,
    pub tx_hash: TxHash,
    pub units: TokenUnits,
    pub submitted_at: DateTime<Utc>,
}
