use crate::gateway::SettlementGateway;
use crate::ChainError;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serializes the custody signer's transaction sequence number.
///
/// The nonce is a single shared resource across every outgoing transfer
/// from the signer; handing the same value to two transactions gets one
/// of them replaced. The allocator syncs from the chain once, then hands
/// out consecutive values under a lock, resyncing after any submission
/// failure since the chain-side counter may or may not have advanced.
pub struct NonceAllocator {
    gateway: Arc<dyn SettlementGateway>,
    next: Mutex<Option<u64>>,
}

impl NonceAllocator {
    pub fn new(gateway: Arc<dyn SettlementGateway>) -> Self {
        Self {
            gateway,
            next: Mutex::new(None),
        }
    }

    pub async fn next(&self) -> Result<u64, ChainError> {
        let mut next = self.next.lock().await;
        let nonce = match *next {
            Some(n) => n,
            None => {
                let synced = self.gateway.signer_nonce().await?;
                debug!(nonce = synced, "Nonce allocator synced from chain");
                synced
            }
        };
        *next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Call after a failed submission: the allocator re-reads the signer
    /// nonce before handing out another value.
    pub async fn mark_failed(&self) {
        let mut next = self.next.lock().await;
        warn!("⚠️ Submission failed, nonce allocator will resync");
        *next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockGateway;

    #[tokio::test]
    async fn test_nonces_are_consecutive() {
        let gateway = Arc::new(MockGateway::new(6));
        let allocator = NonceAllocator::new(gateway);

        let first = allocator.next().await.unwrap();
        let second = allocator.next().await.unwrap();
        let third = allocator.next().await.unwrap();
        assert_eq!(second, first + 1);
        assert_eq!(third, second + 1);
    }

    #[tokio::test]
    async fn test_resync_after_failure() {
        let gateway = Arc::new(MockGateway::new(6));
        let allocator = NonceAllocator::new(gateway.clone());

        let first = allocator.next().await.unwrap();
        allocator.mark_failed().await;
        // The mock's signer nonce has not advanced, so the allocator must
        // hand the same value out again.
        let retried = allocator.next().await.unwrap();
        assert_eq!(first, retried);
    }
}
