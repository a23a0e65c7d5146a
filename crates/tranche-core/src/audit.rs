use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tranche_store::{AuditAction, AuditEvent, EscrowStore};
use tranche_types::{ActorContext, ActorRole, BidId, ProposalId, Result};

const AUDIT_BUS_CAPACITY: usize = 256;

/// What an audit event is about.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityRef {
    pub bid_id: Option<BidId>,
    pub proposal_id: Option<ProposalId>,
    pub milestone_index: Option<u32>,
}

impl EntityRef {
    pub fn bid(bid_id: BidId, proposal_id: ProposalId) -> Self {
        Self {
            bid_id: Some(bid_id),
            proposal_id: Some(proposal_id),
            milestone_index: None,
        }
    }

    pub fn milestone(bid_id: BidId, proposal_id: ProposalId, index: u32) -> Self {
        Self {
            bid_id: Some(bid_id),
            proposal_id: Some(proposal_id),
            milestone_index: Some(index),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }
}

/// Append-only ledger every mutating operation writes to, exactly once.
///
/// Events are observable in commit order through the store-assigned
/// sequence number; the broadcast bus exists for live consumers and
/// carries no ordering guarantee beyond the sequence numbers themselves.
pub struct AuditLog {
    store: Arc<dyn EscrowStore>,
    bus: broadcast::Sender<AuditEvent>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn EscrowStore>) -> Self {
        let (bus, _) = broadcast::channel(AUDIT_BUS_CAPACITY);
        Self { store, bus }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.bus.subscribe()
    }

    pub async fn record(
        &self,
        ctx: &ActorContext,
        action: AuditAction,
        entity: EntityRef,
        changed_fields: Vec<&str>,
        reference: Option<String>,
    ) -> Result<AuditEvent> {
        let event = AuditEvent {
            seq: 0,
            actor_id: ctx.actor_id.clone(),
            actor_role: ctx.role,
            action,
            bid_id: entity.bid_id,
            proposal_id: entity.proposal_id,
            milestone_index: entity.milestone_index,
            changed_fields: changed_fields.into_iter().map(String::from).collect(),
            reference,
            timestamp: Utc::now(),
        };
        let event = self.store.append_audit_event(event).await?;

        info!(
            seq = event.seq,
            actor = %ctx,
            action = %event.action,
            bid_id = ?event.bid_id,
            milestone_index = ?event.milestone_index,
            "🧾 Audit event recorded"
        );
        // Live subscribers may be absent; that is not an error.
        let _ = self.bus.send(event.clone());
        Ok(event)
    }

    /// Oversight projection: full events for one proposal, commit order.
    pub async fn events_for_proposal(&self, proposal: ProposalId) -> Result<Vec<AuditEvent>> {
        Ok(self.store.audit_events_for_proposal(proposal).await?)
    }

    /// Public projection: redacted entries keyed by proposal. Actor
    /// identities and field-level detail stay internal.
    pub async fn public_feed(&self, proposal: ProposalId) -> Result<Vec<PublicAuditEntry>> {
        let events = self.store.audit_events_for_proposal(proposal).await?;
        Ok(events.into_iter().map(PublicAuditEntry::from).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicAuditEntry {
    pub seq: u64,
    pub action: AuditAction,
    pub actor_role: ActorRole,
    pub milestone_index: Option<u32>,
    pub reference: Option<String>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
}

impl From<AuditEvent> for PublicAuditEntry {
    fn from(event: AuditEvent) -> Self {
        Self {
            seq: event.seq,
            action: event.action,
            actor_role: event.actor_role,
            milestone_index: event.milestone_index,
            reference: event.reference,
            timestamp: event.timestamp,
        }
    }
}
