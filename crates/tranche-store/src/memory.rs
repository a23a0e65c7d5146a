use crate::model::{
    Anchor, AuditEvent, Bid, BidDraft, ChangeRequest, ChangeRequestStatus, ChangeResponse,
    Milestone, Payment, PendingSettlement, Proof,
};
use crate::EscrowStore;
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// In-memory backend. Used by tests and single-process deployments; the
/// interleaving guarantees match the durable backends because every
/// conditional update runs under a write lock.
pub struct MemoryStore {
    bids: Arc<RwLock<BTreeMap<u64, Bid>>>,
    proofs: Arc<RwLock<Vec<Proof>>>,
    requests: Arc<RwLock<HashMap<tranche_types::RequestId, ChangeRequest>>>,
    request_order: Arc<RwLock<Vec<tranche_types::RequestId>>>,
    payments: Arc<RwLock<HashMap<(u64, u32), Payment>>>,
    pending: Arc<RwLock<Vec<PendingSettlement>>>,
    audit: Arc<RwLock<Vec<AuditEvent>>>,
    anchors: Arc<RwLock<Vec<Anchor>>>,
    next_bid_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            bids: Arc::new(RwLock::new(BTreeMap::new())),
            proofs: Arc::new(RwLock::new(Vec::new())),
            requests: Arc::new(RwLock::new(HashMap::new())),
            request_order: Arc::new(RwLock::new(Vec::new())),
            payments: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(Vec::new())),
            audit: Arc::new(RwLock::new(Vec::new())),
            anchors: Arc::new(RwLock::new(Vec::new())),
            next_bid_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn create_bid(&self, draft: BidDraft) -> Result<Bid> {
        if draft.milestones.is_empty() {
            bail!("bid must have at least one milestone");
        }
        let id = tranche_types::BidId(self.next_bid_id.fetch_add(1, Ordering::SeqCst));
        let bid = Bid {
            id,
            proposal_id: draft.proposal_id,
            vendor_id: draft.vendor_id,
            payout_wallet: draft.payout_wallet,
            currency: draft.currency,
            milestones: draft.milestones.into_iter().map(Milestone::from).collect(),
            created_at: Utc::now(),
            analysis: None,
        };
        let mut bids = self.bids.write().await;
        bids.insert(id.0, bid.clone());

        info!(
            bid_id = %id,
            proposal_id = %bid.proposal_id,
            milestones = bid.milestones.len(),
            storage_type = "memory",
            "💾 Bid stored"
        );
        Ok(bid)
    }

    async fn get_bid(&self, id: tranche_types::BidId) -> Result<Option<Bid>> {
        let bids = self.bids.read().await;
        Ok(bids.get(&id.0).cloned())
    }

    async fn list_bids(&self) -> Result<Vec<Bid>> {
        let bids = self.bids.read().await;
        Ok(bids.values().cloned().collect())
    }

    async fn bids_for_proposal(&self, proposal: tranche_types::ProposalId) -> Result<Vec<Bid>> {
        let bids = self.bids.read().await;
        Ok(bids
            .values()
            .filter(|b| b.proposal_id == proposal)
            .cloned()
            .collect())
    }

    async fn set_milestone_completed(
        &self,
        id: tranche_types::BidId,
        index: u32,
        summary: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut bids = self.bids.write().await;
        let bid = bids
            .get_mut(&id.0)
            .ok_or_else(|| anyhow::anyhow!("bid {} not found", id))?;
        let milestone = bid
            .milestones
            .get_mut(index as usize)
            .ok_or_else(|| anyhow::anyhow!("milestone {} out of range for bid {}", index, id))?;
        milestone.completed = true;
        milestone.completed_at = Some(at);
        if summary.is_some() {
            milestone.proof_summary = summary;
        }
        Ok(())
    }

    async fn set_milestone_archived(
        &self,
        id: tranche_types::BidId,
        index: u32,
        archived: bool,
    ) -> Result<()> {
        let mut bids = self.bids.write().await;
        let bid = bids
            .get_mut(&id.0)
            .ok_or_else(|| anyhow::anyhow!("bid {} not found", id))?;
        let milestone = bid
            .milestones
            .get_mut(index as usize)
            .ok_or_else(|| anyhow::anyhow!("milestone {} out of range for bid {}", index, id))?;
        milestone.archived = archived;
        Ok(())
    }

    async fn put_analysis(
        &self,
        id: tranche_types::BidId,
        analysis: serde_json::Value,
    ) -> Result<()> {
        let mut bids = self.bids.write().await;
        let bid = bids
            .get_mut(&id.0)
            .ok_or_else(|| anyhow::anyhow!("bid {} not found", id))?;
        bid.analysis = Some(analysis);
        Ok(())
    }

    async fn append_proof(&self, proof: Proof) -> Result<()> {
        let mut proofs = self.proofs.write().await;
        proofs.push(proof);
        Ok(())
    }

    async fn proofs_for_milestone(
        &self,
        id: tranche_types::BidId,
        index: u32,
    ) -> Result<Vec<Proof>> {
        let proofs = self.proofs.read().await;
        Ok(proofs
            .iter()
            .filter(|p| p.bid_id == id && p.milestone_index == index)
            .cloned()
            .collect())
    }

    async fn put_change_request(&self, request: ChangeRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        let mut order = self.request_order.write().await;
        if !requests.contains_key(&request.id) {
            order.push(request.id);
        }
        requests.insert(request.id, request);
        Ok(())
    }

    async fn get_change_request(
        &self,
        id: tranche_types::RequestId,
    ) -> Result<Option<ChangeRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id).cloned())
    }

    async fn append_change_response(
        &self,
        id: tranche_types::RequestId,
        response: ChangeResponse,
    ) -> Result<()> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("change request {} not found", id))?;
        request.responses.push(response);
        Ok(())
    }

    async fn set_change_request_status(
        &self,
        id: tranche_types::RequestId,
        status: ChangeRequestStatus,
    ) -> Result<()> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("change request {} not found", id))?;
        request.status = status;
        Ok(())
    }

    async fn open_requests_for_proposal(
        &self,
        proposal: tranche_types::ProposalId,
    ) -> Result<Vec<ChangeRequest>> {
        let requests = self.requests.read().await;
        let order = self.request_order.read().await;
        Ok(order
            .iter()
            .filter_map(|id| requests.get(id))
            .filter(|r| r.proposal_id == proposal && r.is_open())
            .cloned()
            .collect())
    }

    async fn open_request_for_milestone(
        &self,
        id: tranche_types::BidId,
        index: u32,
    ) -> Result<Option<ChangeRequest>> {
        let requests = self.requests.read().await;
        let order = self.request_order.read().await;
        Ok(order
            .iter()
            .filter_map(|rid| requests.get(rid))
            .find(|r| r.bid_id == id && r.milestone_index == index && r.is_open())
            .cloned())
    }

    async fn record_payment_if_absent(
        &self,
        id: tranche_types::BidId,
        index: u32,
        payment: Payment,
    ) -> Result<bool> {
        // Both the payment row and the milestone hash are written under
        // the same write locks; a losing concurrent caller observes the
        // already-set hash and backs off.
        let mut bids = self.bids.write().await;
        let mut payments = self.payments.write().await;

        let bid = bids
            .get_mut(&id.0)
            .ok_or_else(|| anyhow::anyhow!("bid {} not found", id))?;
        let milestone = bid
            .milestones
            .get_mut(index as usize)
            .ok_or_else(|| anyhow::anyhow!("milestone {} out of range for bid {}", index, id))?;

        if milestone.payment_tx_hash.is_some() || payments.contains_key(&(id.0, index)) {
            return Ok(false);
        }

        milestone.payment_tx_hash = Some(payment.tx_hash);
        milestone.paid_at = Some(payment.released_at);
        payments.insert((id.0, index), payment.clone());

        info!(
            bid_id = %id,
            milestone_index = index,
            tx_hash = %payment.tx_hash,
            amount = %payment.amount,
            storage_type = "memory",
            "📦 Payment recorded"
        );
        Ok(true)
    }

    async fn get_payment(&self, id: tranche_types::BidId, index: u32) -> Result<Option<Payment>> {
        let payments = self.payments.read().await;
        Ok(payments.get(&(id.0, index)).cloned())
    }

    async fn record_pending_settlement(&self, pending: PendingSettlement) -> Result<()> {
        let mut list = self.pending.write().await;
        list.push(pending);
        Ok(())
    }

    async fn list_pending_settlements(&self) -> Result<Vec<PendingSettlement>> {
        let list = self.pending.read().await;
        Ok(list.clone())
    }

    async fn clear_pending_settlement(&self, id: tranche_types::BidId, index: u32) -> Result<()> {
        let mut list = self.pending.write().await;
        list.retain(|p| !(p.bid_id == id && p.milestone_index == index));
        Ok(())
    }

    async fn append_audit_event(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let mut audit = self.audit.write().await;
        event.seq = audit.len() as u64 + 1;
        audit.push(event.clone());
        Ok(event)
    }

    async fn audit_events_for_proposal(
        &self,
        proposal: tranche_types::ProposalId,
    ) -> Result<Vec<AuditEvent>> {
        let audit = self.audit.read().await;
        Ok(audit
            .iter()
            .filter(|e| e.proposal_id == Some(proposal))
            .cloned()
            .collect())
    }

    async fn audit_events_after(&self, seq: u64) -> Result<Vec<AuditEvent>> {
        let audit = self.audit.read().await;
        Ok(audit.iter().filter(|e| e.seq > seq).cloned().collect())
    }

    async fn record_anchor(&self, anchor: Anchor) -> Result<()> {
        let mut anchors = self.anchors.write().await;
        anchors.push(anchor);
        Ok(())
    }

    async fn latest_anchor(&self) -> Result<Option<Anchor>> {
        let anchors = self.anchors.read().await;
        Ok(anchors.last().cloned())
    }
}
