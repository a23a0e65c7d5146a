pub mod gateway;
pub mod mock;
pub mod nonce;
pub mod registry;
pub mod retry;
pub mod rpc;

pub use gateway::{ConfirmedTransfer, SettlementGateway, TransferStatus};
pub use mock::MockGateway;
pub use nonce::NonceAllocator;
pub use registry::{ContractRegistry, TokenEntry};
pub use retry::{retry_with_backoff, BackoffPolicy};
pub use rpc::JsonRpcGateway;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("settlement provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed provider response: {0}")]
    Protocol(String),
}

impl ChainError {
    /// Transient failures are retried with backoff; everything else
    /// surfaces immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unavailable(_))
    }
}

impl From<ChainError> for tranche_types::EscrowError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::RateLimited(msg) => Self::RateLimited(msg),
            ChainError::Reverted(msg) => Self::TransactionReverted(msg),
            ChainError::Unavailable(msg) => Self::UpstreamUnavailable(msg),
            ChainError::Protocol(msg) => Self::UpstreamUnavailable(msg),
        }
    }
}
