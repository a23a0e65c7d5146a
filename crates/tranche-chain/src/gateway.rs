use crate::ChainError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_types::{ContractAddress, TokenUnits, TxHash, WalletAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum TransferStatus {
    Pending,
    Confirmed { block: u64 },
    Reverted,
}

/// A token transfer already confirmed on chain, as seen by the
/// reconciliation scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedTransfer {
    pub tx_hash: TxHash,
    pub to: WalletAddress,
    pub units: TokenUnits,
    pub block: u64,
    pub timestamp: DateTime<Utc>,
}

/// Read and write operations against the settlement network for one
/// custody signer. Every call is a suspension point with its own
/// timeout; none of them retry internally.
#[async_trait]
pub trait SettlementGateway: Send + Sync {
    /// Token decimal precision, read from the contract.
    async fn token_decimals(&self, token: &ContractAddress) -> Result<u8, ChainError>;

    /// Current token balance of `holder`.
    async fn token_balance(
        &self,
        token: &ContractAddress,
        holder: &WalletAddress,
    ) -> Result<TokenUnits, ChainError>;

    /// Next unused nonce of the custody signer, as the chain sees it.
    async fn signer_nonce(&self) -> Result<u64, ChainError>;

    /// Submit a transfer from the custody signer. Returns the transaction
    /// hash immediately; confirmation is observed separately. The
    /// submitted transaction cannot be retracted.
    async fn submit_transfer(
        &self,
        token: &ContractAddress,
        to: &WalletAddress,
        units: TokenUnits,
        nonce: u64,
    ) -> Result<TxHash, ChainError>;

    async fn transfer_status(&self, tx_hash: &TxHash) -> Result<TransferStatus, ChainError>;

    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Confirmed transfers of `token` into `to` at or after `since`.
    async fn transfers_to(
        &self,
        token: &ContractAddress,
        to: &WalletAddress,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConfirmedTransfer>, ChainError>;
}
