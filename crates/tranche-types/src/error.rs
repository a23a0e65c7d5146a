use thiserror::Error;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("invalid milestone: {0}")]
    InvalidMilestone(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient custody funds: has {available} units, needs {required} units")]
    InsufficientFunds { available: u128, required: u128 },

    #[error("settlement provider rate limited: {0}")]
    RateLimited(String),

    #[error("transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("confirmation wait timed out for transaction {0}")]
    TransactionTimeout(String),

    #[error("payment already released with transaction {0}")]
    DuplicatePayment(String),

    #[error("settlement provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EscrowError {
    /// Whether a later retry of the same call could succeed.
    /// Validation failures are final; settlement failures leave the
    /// milestone completed and unpaid.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_)
                | Self::TransactionReverted(_)
                | Self::TransactionTimeout(_)
                | Self::UpstreamUnavailable(_)
                | Self::Storage(_)
        )
    }
}

impl From<anyhow::Error> for EscrowError {
    fn from(e: anyhow::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for EscrowError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EscrowError>;
