use crate::gateway::{ConfirmedTransfer, SettlementGateway, TransferStatus};
use crate::ChainError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tranche_types::{ContractAddress, TokenUnits, TxHash, WalletAddress};

/// In-process settlement network used by tests and devnet runs.
///
/// Transfers confirm immediately unless `hold_confirmations` is set;
/// failure injection covers the rate-limit and revert paths the release
/// service has to handle.
pub struct MockGateway {
    decimals: u8,
    custody_balance: Mutex<TokenUnits>,
    statuses: Mutex<HashMap<TxHash, TransferStatus>>,
    transfers: Mutex<Vec<ConfirmedTransfer>>,
    nonce: AtomicU64,
    head: AtomicU64,
    hold_confirmations: AtomicBool,
    revert_next: AtomicBool,
    rate_limit_remaining: AtomicU32,
}

impl MockGateway {
    pub fn new(decimals: u8) -> Self {
        Self {
            decimals,
            custody_balance: Mutex::new(TokenUnits::ZERO),
            statuses: Mutex::new(HashMap::new()),
            transfers: Mutex::new(Vec::new()),
            nonce: AtomicU64::new(0),
            head: AtomicU64::new(1_000),
            hold_confirmations: AtomicBool::new(false),
            revert_next: AtomicBool::new(false),
            rate_limit_remaining: AtomicU32::new(0),
        }
    }

    pub async fn set_custody_balance(&self, units: TokenUnits) {
        *self.custody_balance.lock().await = units;
    }

    /// Leave submitted transfers in `Pending` until `confirm` is called.
    pub fn hold_confirmations(&self, hold: bool) {
        self.hold_confirmations.store(hold, Ordering::SeqCst);
    }

    /// The next submitted transfer reverts at confirmation time.
    pub fn revert_next_transfer(&self) {
        self.revert_next.store(true, Ordering::SeqCst);
    }

    /// Fail the next `n` gateway calls with a rate-limit response.
    pub fn rate_limit_next(&self, n: u32) {
        self.rate_limit_remaining.store(n, Ordering::SeqCst);
    }

    /// Confirm a held transfer, recording it in the on-chain log.
    pub async fn confirm(&self, tx_hash: TxHash, to: WalletAddress, units: TokenUnits) {
        let block = self.head.load(Ordering::SeqCst);
        self.statuses
            .lock()
            .await
            .insert(tx_hash, TransferStatus::Confirmed { block });
        self.transfers.lock().await.push(ConfirmedTransfer {
            tx_hash,
            to,
            units,
            block,
            timestamp: Utc::now(),
        });
        let mut balance = self.custody_balance.lock().await;
        *balance = TokenUnits::from_raw(balance.raw().saturating_sub(units.raw()));
    }

    /// Mark a held transfer as reverted on chain.
    pub async fn set_status_reverted(&self, tx_hash: TxHash) {
        self.statuses
            .lock()
            .await
            .insert(tx_hash, TransferStatus::Reverted);
    }

    /// Record a confirmed transfer that this process never submitted,
    /// e.g. one whose submission outcome was lost in a crash.
    pub async fn seed_confirmed_transfer(&self, to: WalletAddress, units: TokenUnits) -> TxHash {
        let tx_hash = Self::derive_hash(&to, units, self.nonce.fetch_add(1, Ordering::SeqCst));
        self.confirm(tx_hash, to, units).await;
        tx_hash
    }

    fn derive_hash(to: &WalletAddress, units: TokenUnits, nonce: u64) -> TxHash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(to.as_bytes());
        hasher.update(&units.raw().to_le_bytes());
        hasher.update(&nonce.to_le_bytes());
        TxHash::from_bytes(*hasher.finalize().as_bytes())
    }

    fn check_rate_limit(&self) -> Result<(), ChainError> {
        let remaining = self.rate_limit_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.rate_limit_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ChainError::RateLimited("mock rate limit".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SettlementGateway for MockGateway {
    async fn token_decimals(&self, _token: &ContractAddress) -> Result<u8, ChainError> {
        self.check_rate_limit()?;
        Ok(self.decimals)
    }

    async fn token_balance(
        &self,
        _token: &ContractAddress,
        _holder: &WalletAddress,
    ) -> Result<TokenUnits, ChainError> {
        self.check_rate_limit()?;
        Ok(*self.custody_balance.lock().await)
    }

    async fn signer_nonce(&self) -> Result<u64, ChainError> {
        Ok(self.nonce.load(Ordering::SeqCst))
    }

    async fn submit_transfer(
        &self,
        _token: &ContractAddress,
        to: &WalletAddress,
        units: TokenUnits,
        nonce: u64,
    ) -> Result<TxHash, ChainError> {
        self.check_rate_limit()?;
        let tx_hash = Self::derive_hash(to, units, nonce);
        self.nonce.store(nonce + 1, Ordering::SeqCst);

        if self.revert_next.swap(false, Ordering::SeqCst) {
            self.statuses
                .lock()
                .await
                .insert(tx_hash, TransferStatus::Reverted);
        } else if self.hold_confirmations.load(Ordering::SeqCst) {
            self.statuses
                .lock()
                .await
                .insert(tx_hash, TransferStatus::Pending);
        } else {
            self.confirm(tx_hash, *to, units).await;
        }
        Ok(tx_hash)
    }

    async fn transfer_status(&self, tx_hash: &TxHash) -> Result<TransferStatus, ChainError> {
        let statuses = self.statuses.lock().await;
        Ok(statuses
            .get(tx_hash)
            .copied()
            .unwrap_or(TransferStatus::Pending))
    }

    async fn head_block(&self) -> Result<u64, ChainError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn transfers_to(
        &self,
        _token: &ContractAddress,
        to: &WalletAddress,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConfirmedTransfer>, ChainError> {
        self.check_rate_limit()?;
        let transfers = self.transfers.lock().await;
        Ok(transfers
            .iter()
            .filter(|t| t.to == *to && t.timestamp >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_immediate_confirmation_and_balance_deduction() {
        let gateway = MockGateway::new(6);
        gateway.set_custody_balance(TokenUnits::from_raw(1_000)).await;

        let token = ContractAddress::from_bytes([1; 20]);
        let to = WalletAddress::from_bytes([2; 20]);
        let tx = gateway
            .submit_transfer(&token, &to, TokenUnits::from_raw(400), 0)
            .await
            .unwrap();

        assert!(matches!(
            gateway.transfer_status(&tx).await.unwrap(),
            TransferStatus::Confirmed { .. }
        ));
        assert_eq!(
            gateway.token_balance(&token, &to).await.unwrap(),
            TokenUnits::from_raw(600)
        );
    }

    #[tokio::test]
    async fn test_held_transfer_stays_pending() {
        let gateway = MockGateway::new(6);
        gateway.hold_confirmations(true);

        let token = ContractAddress::from_bytes([1; 20]);
        let to = WalletAddress::from_bytes([2; 20]);
        let tx = gateway
            .submit_transfer(&token, &to, TokenUnits::from_raw(400), 0)
            .await
            .unwrap();

        assert_eq!(
            gateway.transfer_status(&tx).await.unwrap(),
            TransferStatus::Pending
        );

        gateway.confirm(tx, to, TokenUnits::from_raw(400)).await;
        assert!(matches!(
            gateway.transfer_status(&tx).await.unwrap(),
            TransferStatus::Confirmed { .. }
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_injection_drains() {
        let gateway = MockGateway::new(6);
        gateway.rate_limit_next(1);
        let token = ContractAddress::from_bytes([1; 20]);
        assert!(gateway.token_decimals(&token).await.is_err());
        assert_eq!(gateway.token_decimals(&token).await.unwrap(), 6);
    }
}
