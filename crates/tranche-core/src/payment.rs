use crate::audit::{AuditLog, EntityRef};
use crate::lifecycle::{load_bid, milestone_or_invalid};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};
use tranche_chain::{
    retry_with_backoff, BackoffPolicy, ContractRegistry, NonceAllocator, SettlementGateway,
    TransferStatus,
};
use tranche_store::{AuditAction, EscrowStore, Payment, PendingSettlement};
use tranche_types::{ActorContext, BidId, EscrowError, Result, TxHash, WalletAddress};

#[derive(Debug, Clone)]
pub struct ReleaseConfig {
    /// Settlement network name used for contract lookups.
    pub network: String,
    /// Custody signer address all transfers originate from.
    pub custody: WalletAddress,
    /// Blocks on top of the inclusion block before a transfer counts as
    /// confirmed.
    pub confirmation_depth: u64,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            network: "devnet".to_string(),
            custody: WalletAddress::from_bytes([0; 20]),
            confirmation_depth: 1,
            confirm_timeout: Duration::from_secs(90),
            poll_interval: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

enum ConfirmOutcome {
    Confirmed,
    Reverted,
    TimedOut,
}

/// Converts an approved milestone into exactly one on-chain transfer.
///
/// The sequence balance-check → submit → confirm → persist runs under a
/// per-(bid, milestone) advisory lock and is never reordered. The
/// Payment row and its audit event are written only after on-chain
/// confirmation; the store's conditional insert is the commit-time
/// idempotency guard that backs the entry check.
pub struct PaymentService {
    store: Arc<dyn EscrowStore>,
    gateway: Arc<dyn SettlementGateway>,
    registry: ContractRegistry,
    nonces: Arc<NonceAllocator>,
    audit: Arc<AuditLog>,
    locks: Mutex<HashMap<(u64, u32), Arc<Mutex<()>>>>,
    config: ReleaseConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn EscrowStore>,
        gateway: Arc<dyn SettlementGateway>,
        registry: ContractRegistry,
        nonces: Arc<NonceAllocator>,
        audit: Arc<AuditLog>,
        config: ReleaseConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            registry,
            nonces,
            audit,
            locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    async fn milestone_lock(&self, bid_id: BidId, index: u32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((bid_id.0, index))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn release_payment(
        &self,
        ctx: &ActorContext,
        bid_id: BidId,
        milestone_index: u32,
    ) -> Result<Payment> {
        if !ctx.is_admin() {
            return Err(EscrowError::InvalidArgument(
                "only admins can release payments".to_string(),
            ));
        }

        // Serialize concurrent callers for the same milestone; the loser
        // re-reads state below and observes the winner's hash.
        let lock = self.milestone_lock(bid_id, milestone_index).await;
        let _guard = lock.lock().await;

        let bid = load_bid(self.store.as_ref(), bid_id).await?;
        let milestone = milestone_or_invalid(&bid, milestone_index)?;

        if milestone.archived {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is archived",
                milestone_index, bid_id
            )));
        }
        if !milestone.completed {
            return Err(EscrowError::InvalidMilestone(format!(
                "milestone {} of bid {} is not approved",
                milestone_index, bid_id
            )));
        }
        if let Some(hash) = milestone.payment_tx_hash {
            return Err(EscrowError::DuplicatePayment(hash.to_string()));
        }
        if let Some(existing) = self.store.get_payment(bid_id, milestone_index).await? {
            return Err(EscrowError::DuplicatePayment(existing.tx_hash.to_string()));
        }
        // A previous attempt with an unknown outcome blocks new transfers
        // until reconciliation settles it; submitting again could pay the
        // milestone twice.
        if let Some(pending) = self
            .store
            .list_pending_settlements()
            .await?
            .into_iter()
            .find(|p| p.bid_id == bid_id && p.milestone_index == milestone_index)
        {
            return Err(EscrowError::TransactionTimeout(pending.tx_hash.to_string()));
        }

        let contract = self.registry.lookup(&bid.currency, &self.config.network)?;

        let decimals = retry_with_backoff(&self.config.backoff, "token_decimals", || {
            self.gateway.token_decimals(&contract)
        })
        .await
        .map_err(EscrowError::from)?;

        let units = milestone.amount.to_token_units(decimals)?;

        let balance = retry_with_backoff(&self.config.backoff, "token_balance", || {
            self.gateway.token_balance(&contract, &self.config.custody)
        })
        .await
        .map_err(EscrowError::from)?;

        if balance.raw() < units.raw() {
            warn!(
                bid_id = %bid_id,
                milestone_index = milestone_index,
                available = balance.raw(),
                required = units.raw(),
                "❌ Custody balance below milestone amount"
            );
            return Err(EscrowError::InsufficientFunds {
                available: balance.raw(),
                required: units.raw(),
            });
        }

        let nonce = self
            .nonces
            .next()
            .await
            .map_err(EscrowError::from)?;

        let submitted = retry_with_backoff(&self.config.backoff, "submit_transfer", || {
            self.gateway
                .submit_transfer(&contract, &bid.payout_wallet, units, nonce)
        })
        .await;
        let tx_hash = match submitted {
            Ok(hash) => hash,
            Err(e) => {
                self.nonces.mark_failed().await;
                return Err(e.into());
            }
        };

        info!(
            bid_id = %bid_id,
            milestone_index = milestone_index,
            tx_hash = %tx_hash,
            amount = %milestone.amount,
            units = units.raw(),
            nonce = nonce,
            "💸 Transfer submitted"
        );

        match self.await_confirmation(&tx_hash).await {
            ConfirmOutcome::Confirmed => {}
            ConfirmOutcome::Reverted => {
                // No Payment row: the milestone stays completed and
                // unpaid, safe to retry later.
                warn!(
                    bid_id = %bid_id,
                    milestone_index = milestone_index,
                    tx_hash = %tx_hash,
                    "❌ Transfer reverted"
                );
                return Err(EscrowError::TransactionReverted(tx_hash.to_string()));
            }
            ConfirmOutcome::TimedOut => {
                // The transfer cannot be retracted; its outcome is
                // unknown, not failed. Reconciliation picks it up.
                self.store
                    .record_pending_settlement(PendingSettlement {
                        bid_id,
                        milestone_index,
                        tx_hash,
                        units,
                        submitted_at: Utc::now(),
                    })
                    .await?;
                warn!(
                    bid_id = %bid_id,
                    milestone_index = milestone_index,
                    tx_hash = %tx_hash,
                    "⏳ Confirmation wait timed out, settlement deferred to reconciliation"
                );
                return Err(EscrowError::TransactionTimeout(tx_hash.to_string()));
            }
        }

        let payment = Payment {
            tx_hash,
            amount: milestone.amount,
            units,
            currency: bid.currency.clone(),
            released_at: Utc::now(),
        };
        let inserted = self
            .store
            .record_payment_if_absent(bid_id, milestone_index, payment.clone())
            .await?;
        if !inserted {
            let existing = self
                .store
                .get_payment(bid_id, milestone_index)
                .await?
                .map(|p| p.tx_hash.to_string())
                .unwrap_or_else(|| tx_hash.to_string());
            return Err(EscrowError::DuplicatePayment(existing));
        }

        // The payment is durable at this point; a failed audit append
        // must not be reported as a failed release.
        if let Err(e) = self
            .audit
            .record(
                ctx,
                AuditAction::PaymentReleased,
                EntityRef::milestone(bid_id, bid.proposal_id, milestone_index),
                vec!["payment_tx_hash", "paid_at"],
                Some(tx_hash.to_string()),
            )
            .await
        {
            warn!(tx_hash = %tx_hash, error = %e, "Audit append failed after release");
        }

        info!(
            bid_id = %bid_id,
            milestone_index = milestone_index,
            tx_hash = %tx_hash,
            amount = %payment.amount,
            "✅ Payment released"
        );
        Ok(payment)
    }

    async fn await_confirmation(&self, tx_hash: &TxHash) -> ConfirmOutcome {
        let deadline = Instant::now() + self.config.confirm_timeout;
        loop {
            match self.gateway.transfer_status(tx_hash).await {
                Ok(TransferStatus::Confirmed { block }) => {
                    match self.gateway.head_block().await {
                        Ok(head) if head + 1 >= block + self.config.confirmation_depth => {
                            return ConfirmOutcome::Confirmed;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(tx_hash = %tx_hash, error = %e, "Head block read failed while confirming");
                        }
                    }
                }
                Ok(TransferStatus::Reverted) => return ConfirmOutcome::Reverted,
                Ok(TransferStatus::Pending) => {}
                Err(e) => {
                    // Polling tolerates transient provider errors until
                    // the deadline; the transfer itself is already out.
                    warn!(tx_hash = %tx_hash, error = %e, "Status poll failed");
                }
            }
            if Instant::now() >= deadline {
                return ConfirmOutcome::TimedOut;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{approved_bid, test_engine};
    use tranche_types::TokenUnits;

    #[tokio::test]
    async fn test_release_requires_approval() {
        let (engine, _gateway) = test_engine().await;
        let bid = crate::test_support::funded_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        let result = engine.payments.release_payment(&admin, bid.id, 0).await;
        assert!(matches!(result, Err(EscrowError::InvalidMilestone(_))));
    }

    #[tokio::test]
    async fn test_release_happy_path_persists_once() {
        let (engine, _gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        let payment = engine
            .payments
            .release_payment(&admin, bid.id, 0)
            .await
            .unwrap();
        // 250.00 at six decimals.
        assert_eq!(payment.units, TokenUnits::from_raw(250_000_000));

        let stored = engine.store.get_bid(bid.id).await.unwrap().unwrap();
        assert_eq!(stored.milestones[0].payment_tx_hash, Some(payment.tx_hash));

        let again = engine.payments.release_payment(&admin, bid.id, 0).await;
        assert!(matches!(again, Err(EscrowError::DuplicatePayment(_))));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_milestone_retryable() {
        let (engine, gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        gateway.set_custody_balance(TokenUnits::from_raw(1)).await;
        let result = engine.payments.release_payment(&admin, bid.id, 0).await;
        assert!(matches!(result, Err(EscrowError::InsufficientFunds { .. })));

        let stored = engine.store.get_bid(bid.id).await.unwrap().unwrap();
        assert!(stored.milestones[0].completed);
        assert!(stored.milestones[0].payment_tx_hash.is_none());
        assert!(engine.store.get_payment(bid.id, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revert_writes_no_payment_row() {
        let (engine, gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        gateway.revert_next_transfer();
        let result = engine.payments.release_payment(&admin, bid.id, 0).await;
        assert!(matches!(result, Err(EscrowError::TransactionReverted(_))));
        assert!(engine.store.get_payment(bid.id, 0).await.unwrap().is_none());

        // Retry succeeds once the network behaves.
        engine
            .payments
            .release_payment(&admin, bid.id, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limits_are_retried_transparently() {
        let (engine, gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        gateway.rate_limit_next(2);
        engine
            .payments
            .release_payment(&admin, bid.id, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_records_pending_settlement_and_blocks_retry() {
        let (engine, gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        gateway.hold_confirmations(true);
        let result = engine.payments.release_payment(&admin, bid.id, 0).await;
        let tx_hash = match result {
            Err(EscrowError::TransactionTimeout(hash)) => hash,
            other => panic!("expected timeout, got {:?}", other.map(|p| p.tx_hash)),
        };

        let pending = engine.store.list_pending_settlements().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tx_hash.to_string(), tx_hash);

        // No second transfer while the first outcome is unknown.
        gateway.hold_confirmations(false);
        let blocked = engine.payments.release_payment(&admin, bid.id, 0).await;
        assert!(matches!(blocked, Err(EscrowError::TransactionTimeout(_))));
    }

    #[tokio::test]
    async fn test_concurrent_release_pays_exactly_once() {
        let (engine, _gateway) = test_engine().await;
        let bid = approved_bid(&engine).await;
        let admin = ActorContext::admin("admin-1");

        let payments = engine.payments.clone();
        let a = {
            let payments = payments.clone();
            let ctx = admin.clone();
            tokio::spawn(async move { payments.release_payment(&ctx, bid.id, 0).await })
        };
        let b = {
            let payments = payments.clone();
            let ctx = admin.clone();
            tokio::spawn(async move { payments.release_payment(&ctx, bid.id, 0).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(EscrowError::DuplicatePayment(_))))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(duplicates, 1);
        assert!(engine.store.get_payment(bid.id, 0).await.unwrap().is_some());
    }
}
