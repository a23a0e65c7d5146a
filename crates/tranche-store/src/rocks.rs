use crate::model::{
    Anchor, AuditEvent, Bid, BidDraft, ChangeRequest, ChangeRequestStatus, ChangeResponse,
    Milestone, Payment, PendingSettlement, Proof,
};
use crate::EscrowStore;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{IteratorMode, WriteBatch, DB};
use std::sync::Arc;
use tokio::sync::Mutex;
use tranche_types::{BidId, ProposalId, RequestId};

const CF_BIDS: &str = "bids";
const CF_PROOFS: &str = "proofs";
const CF_REQUESTS: &str = "change_requests";
const CF_PAYMENTS: &str = "payments";
const CF_PENDING: &str = "pending_settlements";
const CF_AUDIT: &str = "audit_events";
const CF_ANCHORS: &str = "anchors";
const CF_META: &str = "meta";

/// RocksDB backend. All mutating operations run under a single writer
/// mutex; the conditional payment insert relies on that serialization in
/// place of a storage-level transaction.
pub struct RocksStore {
    db: Arc<DB>,
    write_lock: Mutex<()>,
}

impl RocksStore {
    pub fn new(path: &str) -> Result<Self> {
        use rocksdb::{BlockBasedOptions, Cache, Options};

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cache = Cache::new_lru_cache(64 * 1024 * 1024);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);

        let cf_names = vec![
            CF_BIDS, CF_PROOFS, CF_REQUESTS, CF_PAYMENTS, CF_PENDING, CF_AUDIT, CF_ANCHORS,
            CF_META,
        ];
        let db = DB::open_cf(&opts, path, &cf_names)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("column family {} not found", name))
    }

    fn next_counter(&self, key: &str) -> Result<u64> {
        // Caller holds the write lock.
        let cf = self.cf(CF_META)?;
        let current = match self.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => u64::from_le_bytes(bytes.as_slice().try_into()?),
            None => 0,
        };
        let next = current + 1;
        self.db.put_cf(cf, key.as_bytes(), next.to_le_bytes())?;
        Ok(next)
    }

    fn load_bid(&self, id: BidId) -> Result<Option<Bid>> {
        let cf = self.cf(CF_BIDS)?;
        match self.db.get_cf(cf, id.0.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_bid(&self, bid: &Bid) -> Result<()> {
        let cf = self.cf(CF_BIDS)?;
        self.db
            .put_cf(cf, bid.id.0.to_be_bytes(), serde_json::to_vec(bid)?)?;
        Ok(())
    }

    fn with_milestone<F>(&self, id: BidId, index: u32, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Milestone),
    {
        let mut bid = self
            .load_bid(id)?
            .ok_or_else(|| anyhow!("bid {} not found", id))?;
        let milestone = bid
            .milestones
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("milestone {} out of range for bid {}", index, id))?;
        mutate(milestone);
        self.store_bid(&bid)
    }

    fn payment_key(id: BidId, index: u32) -> Vec<u8> {
        format!("{:020}:{:010}", id.0, index).into_bytes()
    }

    fn load_request(&self, id: RequestId) -> Result<Option<ChangeRequest>> {
        let cf = self.cf(CF_REQUESTS)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn store_request(&self, request: &ChangeRequest) -> Result<()> {
        let cf = self.cf(CF_REQUESTS)?;
        self.db
            .put_cf(cf, request.id.as_bytes(), serde_json::to_vec(request)?)?;
        Ok(())
    }

    fn all_requests(&self) -> Result<Vec<ChangeRequest>> {
        let cf = self.cf(CF_REQUESTS)?;
        let mut requests = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            requests.push(serde_json::from_slice::<ChangeRequest>(&value)?);
        }
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }
}

#[async_trait]
impl EscrowStore for RocksStore {
    async fn create_bid(&self, draft: BidDraft) -> Result<Bid> {
        if draft.milestones.is_empty() {
            bail!("bid must have at least one milestone");
        }
        let _guard = self.write_lock.lock().await;
        let id = BidId(self.next_counter("next_bid_id")?);
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
        self.store_bid(&bid)?;
        Ok(bid)
    }

    async fn get_bid(&self, id: BidId) -> Result<Option<Bid>> {
        self.load_bid(id)
    }

    async fn list_bids(&self) -> Result<Vec<Bid>> {
        let cf = self.cf(CF_BIDS)?;
        let mut bids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            bids.push(serde_json::from_slice::<Bid>(&value)?);
        }
        Ok(bids)
    }

    async fn bids_for_proposal(&self, proposal: ProposalId) -> Result<Vec<Bid>> {
        Ok(self
            .list_bids()
            .await?
            .into_iter()
            .filter(|b| b.proposal_id == proposal)
            .collect())
    }

    async fn set_milestone_completed(
        &self,
        id: BidId,
        index: u32,
        summary: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.with_milestone(id, index, |m| {
            m.completed = true;
            m.completed_at = Some(at);
            if summary.is_some() {
                m.proof_summary = summary;
            }
        })
    }

    async fn set_milestone_archived(&self, id: BidId, index: u32, archived: bool) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.with_milestone(id, index, |m| m.archived = archived)
    }

    async fn put_analysis(&self, id: BidId, analysis: serde_json::Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut bid = self
            .load_bid(id)?
            .ok_or_else(|| anyhow!("bid {} not found", id))?;
        bid.analysis = Some(analysis);
        self.store_bid(&bid)
    }

    async fn append_proof(&self, proof: Proof) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let seq = self.next_counter("proof_seq")?;
        let cf = self.cf(CF_PROOFS)?;
        let key = format!(
            "{:020}:{:010}:{:020}",
            proof.bid_id.0, proof.milestone_index, seq
        );
        self.db
            .put_cf(cf, key.as_bytes(), serde_json::to_vec(&proof)?)?;
        Ok(())
    }

    async fn proofs_for_milestone(&self, id: BidId, index: u32) -> Result<Vec<Proof>> {
        let cf = self.cf(CF_PROOFS)?;
        let prefix = format!("{:020}:{:010}:", id.0, index);
        let mut proofs = Vec::new();
        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            proofs.push(serde_json::from_slice::<Proof>(&value)?);
        }
        Ok(proofs)
    }

    async fn put_change_request(&self, request: ChangeRequest) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store_request(&request)
    }

    async fn get_change_request(&self, id: RequestId) -> Result<Option<ChangeRequest>> {
        self.load_request(id)
    }

    async fn append_change_response(&self, id: RequestId, response: ChangeResponse) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut request = self
            .load_request(id)?
            .ok_or_else(|| anyhow!("change request {} not found", id))?;
        request.responses.push(response);
        self.store_request(&request)
    }

    async fn set_change_request_status(
        &self,
        id: RequestId,
        status: ChangeRequestStatus,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut request = self
            .load_request(id)?
            .ok_or_else(|| anyhow!("change request {} not found", id))?;
        request.status = status;
        self.store_request(&request)
    }

    async fn open_requests_for_proposal(&self, proposal: ProposalId) -> Result<Vec<ChangeRequest>> {
        Ok(self
            .all_requests()?
            .into_iter()
            .filter(|r| r.proposal_id == proposal && r.is_open())
            .collect())
    }

    async fn open_request_for_milestone(
        &self,
        id: BidId,
        index: u32,
    ) -> Result<Option<ChangeRequest>> {
        Ok(self
            .all_requests()?
            .into_iter()
            .find(|r| r.bid_id == id && r.milestone_index == index && r.is_open()))
    }

    async fn record_payment_if_absent(
        &self,
        id: BidId,
        index: u32,
        payment: Payment,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let mut bid = self
            .load_bid(id)?
            .ok_or_else(|| anyhow!("bid {} not found", id))?;
        let milestone = bid
            .milestones
            .get_mut(index as usize)
            .ok_or_else(|| anyhow!("milestone {} out of range for bid {}", index, id))?;

        let cf_payments = self.cf(CF_PAYMENTS)?;
        let key = Self::payment_key(id, index);
        if milestone.payment_tx_hash.is_some() || self.db.get_cf(cf_payments, &key)?.is_some() {
            return Ok(false);
        }

        milestone.payment_tx_hash = Some(payment.tx_hash);
        milestone.paid_at = Some(payment.released_at);

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_payments, &key, serde_json::to_vec(&payment)?);
        batch.put_cf(
            self.cf(CF_BIDS)?,
            id.0.to_be_bytes(),
            serde_json::to_vec(&bid)?,
        );
        self.db.write(batch)?;
        Ok(true)
    }

    async fn get_payment(&self, id: BidId, index: u32) -> Result<Option<Payment>> {
        let cf = self.cf(CF_PAYMENTS)?;
        match self.db.get_cf(cf, Self::payment_key(id, index))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn record_pending_settlement(&self, pending: PendingSettlement) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(CF_PENDING)?;
        let key = Self::payment_key(pending.bid_id, pending.milestone_index);
        self.db.put_cf(cf, key, serde_json::to_vec(&pending)?)?;
        Ok(())
    }

    async fn list_pending_settlements(&self) -> Result<Vec<PendingSettlement>> {
        let cf = self.cf(CF_PENDING)?;
        let mut pending = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            pending.push(serde_json::from_slice::<PendingSettlement>(&value)?);
        }
        Ok(pending)
    }

    async fn clear_pending_settlement(&self, id: BidId, index: u32) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(CF_PENDING)?;
        self.db.delete_cf(cf, Self::payment_key(id, index))?;
        Ok(())
    }

    async fn append_audit_event(&self, mut event: AuditEvent) -> Result<AuditEvent> {
        let _guard = self.write_lock.lock().await;
        event.seq = self.next_counter("audit_seq")?;
        let cf = self.cf(CF_AUDIT)?;
        self.db
            .put_cf(cf, event.seq.to_be_bytes(), serde_json::to_vec(&event)?)?;
        Ok(event)
    }

    async fn audit_events_for_proposal(&self, proposal: ProposalId) -> Result<Vec<AuditEvent>> {
        let cf = self.cf(CF_AUDIT)?;
        let mut events = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let event: AuditEvent = serde_json::from_slice(&value)?;
            if event.proposal_id == Some(proposal) {
                events.push(event);
            }
        }
        Ok(events)
    }

    async fn audit_events_after(&self, seq: u64) -> Result<Vec<AuditEvent>> {
        let cf = self.cf(CF_AUDIT)?;
        let start = (seq + 1).to_be_bytes();
        let mut events = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, rocksdb::Direction::Forward));
        for item in iter {
            let (_, value) = item?;
            events.push(serde_json::from_slice::<AuditEvent>(&value)?);
        }
        Ok(events)
    }

    async fn record_anchor(&self, anchor: Anchor) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(CF_ANCHORS)?;
        self.db.put_cf(
            cf,
            anchor.up_to_seq.to_be_bytes(),
            serde_json::to_vec(&anchor)?,
        )?;
        Ok(())
    }

    async fn latest_anchor(&self) -> Result<Option<Anchor>> {
        let cf = self.cf(CF_ANCHORS)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(serde_json::from_slice(&value)?))
            }
            None => Ok(None),
        }
    }
}
