use ethers::types::Address;
use std::sync::Arc;
use tracing::{info, warn};

use crate::chain::{ChainClient, ChainError};

/// Hands out the operator account's nonces strictly in submission order.
///
/// The first reservation syncs from the chain's pending nonce. A nonce is
/// only given back when it was the most recent reservation and its
/// transaction never reached the node.
pub struct NonceManager {
    chain: Arc<dyn ChainClient>,
    account: Address,
    next: Option<u64>,
    /// Lowest nonce still free locally, above transactions restored from the store.
    floor: u64,
}

impl NonceManager {
    pub fn new(chain: Arc<dyn ChainClient>, account: Address) -> Self {
        Self {
            chain,
            account,
            next: None,
            floor: 0,
        }
    }

    /// Keeps every later reservation at or above `floor`, even if the node
    /// has dropped the transactions below it.
    pub fn raise_floor(&mut self, floor: u64) {
        self.floor = self.floor.max(floor);
        if let Some(next) = self.next.as_mut() {
            *next = (*next).max(floor);
        }
    }

    pub fn peek(&self) -> Option<u64> {
        self.next
    }

    /// Re-reads the pending nonce, never moving backwards past local reservations.
    pub async fn sync(&mut self) -> Result<u64, ChainError> {
        let chain_nonce = self.chain.get_pending_nonce(self.account).await?.as_u64();
        let next = match self.next {
            Some(local) if local > chain_nonce => {
                warn!(local, chain_nonce, "Local nonce ahead of chain pending nonce");
                local
            }
            _ => chain_nonce,
        };
        if next < self.floor {
            warn!(floor = self.floor, chain_nonce, "Chain pending nonce below restored transactions");
        }
        let next = next.max(self.floor);
        info!(account = ?self.account, nonce = next, "Operator nonce synced");
        self.next = Some(next);
        Ok(next)
    }

    pub async fn reserve(&mut self) -> Result<u64, ChainError> {
        let nonce = match self.next {
            Some(n) => n,
            None => self.sync().await?,
        };
        self.next = Some(nonce + 1);
        Ok(nonce)
    }

    /// Returns `nonce` to the pool if nothing was reserved after it.
    pub fn release(&mut self, nonce: u64) -> bool {
        if self.next == Some(nonce + 1) {
            self.next = Some(nonce);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::SimulatedChain;

    #[tokio::test]
    async fn test_reserve_is_sequential_and_release_only_undoes_latest() {
        let chain = Arc::new(SimulatedChain::new());
        let mut nonces = NonceManager::new(chain, Address::repeat_byte(1));

        assert_eq!(nonces.reserve().await.unwrap(), 0);
        assert_eq!(nonces.reserve().await.unwrap(), 1);
        assert!(!nonces.release(0));
        assert!(nonces.release(1));
        assert_eq!(nonces.reserve().await.unwrap(), 1);
        assert_eq!(nonces.peek(), Some(2));
    }

    #[tokio::test]
    async fn test_sync_keeps_local_reservations() {
        let chain = Arc::new(SimulatedChain::new());
        let mut nonces = NonceManager::new(chain, Address::repeat_byte(1));
        nonces.reserve().await.unwrap();
        nonces.reserve().await.unwrap();
        // Chain has seen nothing yet
        assert_eq!(nonces.sync().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_floor_outranks_chain_pending_nonce() {
        let chain = Arc::new(SimulatedChain::new());
        let mut nonces = NonceManager::new(chain, Address::repeat_byte(1));
        // Nonces 0..=2 were restored but the node no longer knows them
        nonces.raise_floor(3);
        assert_eq!(nonces.reserve().await.unwrap(), 3);
        assert_eq!(nonces.sync().await.unwrap(), 4);
        nonces.raise_floor(1);
        assert_eq!(nonces.reserve().await.unwrap(), 4);
    }
}
