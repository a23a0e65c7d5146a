use std::fmt;
use tranche_store::{Bid, EscrowStore, Milestone};
use tranche_types::{BidId, EscrowError, Result};

/// Derived milestone state.
///
/// Nothing stores this directly; it is a pure function of the record so
/// the persisted flags stay the single source of truth. `Paid` is
/// terminal from the payment perspective, `Archived` is soft-terminal
/// and reversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneState {
    Open,
    AwaitingReview,
    ChangesRequested,
    Completed,
    Paid,
    Archived,
}

impl fmt::Display for MilestoneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::AwaitingReview => "awaiting_review",
            Self::ChangesRequested => "changes_requested",
            Self::Completed => "completed",
            Self::Paid => "paid",
            Self::Archived => "archived",
        };
        write!(f, "{}", name)
    }
}

pub fn derive_state(milestone: &Milestone, has_open_request: bool, has_proof: bool) -> MilestoneState {
    if milestone.payment_tx_hash.is_some() {
        return MilestoneState::Paid;
    }
    if milestone.archived {
        return MilestoneState::Archived;
    }
    if milestone.completed {
        return MilestoneState::Completed;
    }
    if has_open_request {
        return MilestoneState::ChangesRequested;
    }
    if has_proof {
        return MilestoneState::AwaitingReview;
    }
    MilestoneState::Open
}

pub(crate) async fn load_bid(store: &dyn EscrowStore, id: BidId) -> Result<Bid> {
    store
        .get_bid(id)
        .await?
        .ok_or_else(|| EscrowError::NotFound(format!("bid {}", id)))
}

pub(crate) fn milestone_or_invalid(bid: &Bid, index: u32) -> Result<&Milestone> {
    bid.milestone(index).ok_or_else(|| {
        EscrowError::InvalidMilestone(format!(
            "index {} out of range for bid {} ({} milestones)",
            index,
            bid.id,
            bid.milestones.len()
        ))
    })
}
