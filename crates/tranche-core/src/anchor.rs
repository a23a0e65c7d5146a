use crate::audit::{AuditLog, EntityRef};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use tranche_store::{Anchor, AuditAction, EscrowStore};
use tranche_types::{ActorContext, Result};

/// Periodic, batched tamper-evidence over the audit log.
///
/// Each run hashes every event since the last anchor into one blake3
/// digest and records it. Anything rewriting history behind an anchor
/// no longer matches the published hash. Anchoring is batched by design;
/// per-event anchoring is a non-goal.
pub struct AnchorService {
    store: Arc<dyn EscrowStore>,
    audit: Arc<AuditLog>,
}

impl AnchorService {
    pub fn new(store: Arc<dyn EscrowStore>, audit: Arc<AuditLog>) -> Self {
        Self { store, audit }
    }

    /// Anchor all audit events newer than the previous anchor. Returns
    /// `None` when there is nothing new.
    pub async fn anchor_pending(&self) -> Result<Option<Anchor>> {
        let last_seq = self
            .store
            .latest_anchor()
            .await?
            .map(|a| a.up_to_seq)
            .unwrap_or(0);
        let events = self.store.audit_events_after(last_seq).await?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut hasher = blake3::Hasher::new();
        for event in &events {
            hasher.update(&serde_json::to_vec(event)?);
        }
        let anchor = Anchor {
            up_to_seq: events.last().map(|e| e.seq).unwrap_or(last_seq),
            content_hash: hex::encode(hasher.finalize().as_bytes()),
            created_at: Utc::now(),
        };
        self.store.record_anchor(anchor.clone()).await?;

        self.audit
            .record(
                &ActorContext::system(),
                AuditAction::AnchorCommitted,
                EntityRef::none(),
                vec![],
                Some(anchor.content_hash.clone()),
            )
            .await?;

        info!(
            up_to_seq = anchor.up_to_seq,
            events = events.len(),
            content_hash = %anchor.content_hash,
            "⚓ Audit log anchored"
        );
        Ok(Some(anchor))
    }
}
