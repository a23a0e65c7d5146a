use crate::audit::{AuditLog, EntityRef};
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use tranche_chain::{ContractRegistry, SettlementGateway, TransferStatus};
use tranche_store::{AuditAction, Bid, EscrowStore, Payment};
use tranche_types::{ActorContext, ContractAddress, Result, TxHash};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub network: String,
    /// How long after completion an on-chain transfer may still be
    /// matched to a milestone.
    pub match_window: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            network: "devnet".to_string(),
            match_window: Duration::hours(24),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    pub pending_resolved: usize,
    pub abandoned: usize,
    pub healed: usize,
}

/// Heals the crash window between on-chain confirmation and local
/// persistence.
///
/// Settlement and bookkeeping are separate steps across a process
/// boundary we do not control, so the sweep re-derives "paid" from the
/// chain: first by resolving transfers whose confirmation outcome was
/// lost, then by matching confirmed transfers to completed, unpaid
/// milestones by wallet, amount and time window. Healing goes through
/// the same conditional insert as release: at-least-once settlement,
/// exactly-once bookkeeping.
pub struct ReconciliationService {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn SettlementGateway>,
    registry: ContractRegistry,
    audit: Arc<AuditLog>,
    config: ReconcileConfig,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn SettlementGateway>,
        registry: ContractRegistry,
        audit: Arc<AuditLog>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            audit,
            config,
        }
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.resolve_pending(&mut report).await?;
        self.heal_unrecorded(&mut report).await?;

        if report.pending_resolved + report.abandoned + report.healed > 0 {
            info!(
                pending_resolved = report.pending_resolved,
                abandoned = report.abandoned,
                healed = report.healed,
                "🔍 Reconciliation sweep applied changes"
            );
        }
        Ok(report)
    }

    /// Pass 1: settle transfers whose confirmation wait timed out.
    async fn resolve_pending(&self, report: &mut SweepReport) -> Result<()> {
        let ctx = ActorContext::system();
        for pending in self.store.list_pending_settlements().await? {
            let status = match self.gateway.transfer_status(&pending.tx_hash).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(tx_hash = %pending.tx_hash, error = %e, "Pending settlement status read failed");
                    continue;
                }
            };
            match status {
                TransferStatus::Confirmed { .. } => {
                    let Some(bid) = self.store.get_bid(pending.bid_id).await? else {
                        continue;
                    };
                    let Some(milestone) = bid.milestone(pending.milestone_index) else {
                        continue;
                    };
                    let payment = Payment {
                        tx_hash: pending.tx_hash,
                        amount: milestone.amount,
                        units: pending.units,
                        currency: bid.currency.clone(),
                        released_at: Utc::now(),
                    };
                    if self
                        .store
                        .record_payment_if_absent(pending.bid_id, pending.milestone_index, payment)
                        .await?
                    {
                        self.audit
                            .record(
                                &ctx,
                                AuditAction::PaymentReconciled,
                                EntityRef::milestone(
                                    bid.id,
                                    bid.proposal_id,
                                    pending.milestone_index,
                                ),
                                vec!["payment_tx_hash", "paid_at"],
                                Some(pending.tx_hash.to_string()),
                            )
                            .await?;
                    }
                    self.store
                        .clear_pending_settlement(pending.bid_id, pending.milestone_index)
                        .await?;
                    report.pending_resolved += 1;
                }
                TransferStatus::Reverted => {
                    // The attempt failed on chain; the milestone goes
                    // back to plain completed/unpaid and release may be
                    // retried.
                    self.store
                        .clear_pending_settlement(pending.bid_id, pending.milestone_index)
                        .await?;
                    self.audit
                        .record(
                            &ctx,
                            AuditAction::SettlementAbandoned,
                            EntityRef {
                                bid_id: Some(pending.bid_id),
                                proposal_id: None,
                                milestone_index: Some(pending.milestone_index),
                            },
                            vec![],
                            Some(pending.tx_hash.to_string()),
                        )
                        .await?;
                    report.abandoned += 1;
                }
                TransferStatus::Pending => {}
            }
        }
        Ok(())
    }

    /// Pass 2: find completed, unpaid milestones whose expected transfer
    /// already confirmed on chain but never reached the store.
    async fn heal_unrecorded(&self, report: &mut SweepReport) -> Result<()> {
        let ctx = ActorContext::system();
        let mut decimals_cache: HashMap<ContractAddress, u8> = HashMap::new();

        for bid in self.store.list_bids().await? {
            let Ok(contract) = self.registry.lookup(&bid.currency, &self.config.network) else {
                continue;
            };
            let decimals = match decimals_cache.get(&contract) {
                Some(d) => *d,
                None => match self.gateway.token_decimals(&contract).await {
                    Ok(d) => {
                        decimals_cache.insert(contract, d);
                        d
                    }
                    Err(e) => {
                        warn!(currency = %bid.currency, error = %e, "Decimals read failed during sweep");
                        continue;
                    }
                },
            };

            let mut used_hashes: HashSet<TxHash> = bid
                .milestones
                .iter()
                .filter_map(|m| m.payment_tx_hash)
                .collect();

            for (index, milestone) in bid.milestones.iter().enumerate() {
                if !milestone.completed
                    || milestone.archived
                    || milestone.payment_tx_hash.is_some()
                {
                    continue;
                }
                let Some(completed_at) = milestone.completed_at else {
                    continue;
                };
                let Ok(expected) = milestone.amount.to_token_units(decimals) else {
                    continue;
                };

                let transfers = match self
                    .gateway
                    .transfers_to(&contract, &bid.payout_wallet, completed_at)
                    .await
                {
                    Ok(transfers) => transfers,
                    Err(e) => {
                        warn!(bid_id = %bid.id, error = %e, "Transfer scan failed during sweep");
                        continue;
                    }
                };

                let window_end = completed_at + self.config.match_window;
                let matched = transfers.into_iter().find(|t| {
                    t.units == expected
                        && t.timestamp >= completed_at
                        && t.timestamp <= window_end
                        && !used_hashes.contains(&t.tx_hash)
                });
                if let Some(transfer) = matched {
                    if self.heal_milestone(&bid, index as u32, &transfer, &ctx).await? {
                        used_hashes.insert(transfer.tx_hash);
                        report.healed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    async fn heal_milestone(
        &self,
        bid: &Bid,
        index: u32,
        transfer: &tranche_chain::ConfirmedTransfer,
        ctx: &ActorContext,
    ) -> Result<bool> {
        let Some(milestone) = bid.milestone(index) else {
            return Ok(false);
        };
        let payment = Payment {
            tx_hash: transfer.tx_hash,
            amount: milestone.amount,
            units: transfer.units,
            currency: bid.currency.clone(),
            released_at: transfer.timestamp,
        };
        let inserted = self
            .store
            .record_payment_if_absent(bid.id, index, payment)
            .await?;
        if inserted {
            self.audit
                .record(
                    ctx,
                    AuditAction::PaymentReconciled,
                    EntityRef::milestone(bid.id, bid.proposal_id, index),
                    vec!["payment_tx_hash", "paid_at"],
                    Some(transfer.tx_hash.to_string()),
                )
                .await?;
            info!(
                bid_id = %bid.id,
                milestone_index = index,
                tx_hash = %transfer.tx_hash,
                "🩹 Healed unrecorded settlement"
            );
        }
        Ok(inserted)
    }
}
