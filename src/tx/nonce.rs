//! Nonce allocation for the account ledger
//!
//! Handles:
//! - Lazy seeding from the node's transaction count
//! - Optimistic, never-decreasing local reservations
//! - Explicit reset after a dropped or replaced transaction

use crate::chain::RpcService;
use crate::error::{PipelineError, PipelineResult};
use crate::ledger::Ledger;

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Per-address reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceReservation {
    /// Next nonce to hand out
    pub next: u64,
}

type Slot = Arc<RwLock<Option<NonceReservation>>>;

/// Issues monotonically increasing nonces per (ledger, address)
pub struct NonceAllocator {
    reservations: DashMap<(Ledger, String), Slot>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
        }
    }

    fn key(ledger: Ledger, address: &str) -> (Ledger, String) {
        (ledger, address.to_ascii_lowercase())
    }

    /// The shard guard is dropped before returning so waiting on the slot
    /// never blocks other addresses.
    fn slot(&self, ledger: Ledger, address: &str) -> Slot {
        self.reservations
            .entry(Self::key(ledger, address))
            .or_insert_with(Default::default)
            .clone()
    }

    /// Hand out the next nonce for an address
    pub async fn allocate(
        &self,
        address: &str,
        ledger: Ledger,
        rpc: &dyn RpcService,
    ) -> PipelineResult<u64> {
        let slot = self.slot(ledger, address);
        let mut reservation = slot.write().await;

        let nonce = match reservation.as_mut() {
            Some(r) => {
                let nonce = r.next;
                r.next += 1;
                nonce
            }
            None => {
                let count = rpc.transaction_count(address).await.map_err(|e| {
                    PipelineError::NonceQuery {
                        ledger,
                        address: address.to_string(),
                        message: e.to_string(),
                    }
                })?;
                *reservation = Some(NonceReservation { next: count + 1 });
                debug!(
                    "Seeded nonce for {} on {} from network count {}",
                    address, ledger, count
                );
                count
            }
        };

        crate::metrics::record_nonce_allocated(ledger);
        debug!("Allocated nonce {} for {} on {}", nonce, address, ledger);
        Ok(nonce)
    }

    /// Current reservation, if any
    pub async fn reservation(&self, address: &str, ledger: Ledger) -> Option<NonceReservation> {
        let slot = self.reservations.get(&Self::key(ledger, address))?.clone();
        let reservation = *slot.read().await;
        reservation
    }

    /// Give back a nonce whose transaction never reached the network.
    ///
    /// The latest allocation is rolled back in place. Anything older leaves a
    /// gap, so the reservation is cleared and re-seeded on next use.
    pub async fn release(&self, address: &str, ledger: Ledger, nonce: u64) -> bool {
        let Some(slot) = self
            .reservations
            .get(&Self::key(ledger, address))
            .map(|s| s.clone())
        else {
            return false;
        };

        let mut reservation = slot.write().await;
        match reservation.as_mut() {
            Some(r) if r.next == nonce + 1 => {
                r.next = nonce;
                debug!("Released nonce {} for {} on {}", nonce, address, ledger);
                true
            }
            Some(r) => {
                info!(
                    "Nonce {} for {} on {} released behind {}, re-seeding",
                    nonce, address, ledger, r.next
                );
                *reservation = None;
                true
            }
            None => false,
        }
    }

    /// Drop the reservation so the next allocation re-seeds from the network
    pub fn reset(&self, address: &str, ledger: Ledger) -> bool {
        let removed = self
            .reservations
            .remove(&Self::key(ledger, address))
            .is_some();
        if removed {
            info!("Nonce reservation reset for {} on {}", address, ledger);
        }
        removed
    }
}

impl Default for NonceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockRpcService, RpcError};

    const ADDRESS: &str = "0x52908400098527886E0F7030069857D2E4169EE7";

    #[tokio::test]
    async fn test_first_allocation_uses_network_count() {
        let mut rpc = MockRpcService::new();
        rpc.expect_transaction_count().times(1).returning(|_| Ok(7));

        let allocator = NonceAllocator::new();
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 7);
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 8);
        assert_eq!(
            allocator.reservation(ADDRESS, Ledger::Account).await,
            Some(NonceReservation { next: 9 })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_are_contiguous() {
        let mut rpc = MockRpcService::new();
        rpc.expect_transaction_count().times(1).returning(|_| Ok(40));
        let rpc = Arc::new(rpc);
        let allocator = Arc::new(NonceAllocator::new());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let allocator = allocator.clone();
                let rpc = rpc.clone();
                tokio::spawn(async move {
                    allocator
                        .allocate(ADDRESS, Ledger::Account, rpc.as_ref())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut nonces: Vec<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        nonces.sort_unstable();

        assert_eq!(nonces, (40..72).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_query_failure_allocates_nothing() {
        let mut rpc = MockRpcService::new();
        let mut seq = mockall::Sequence::new();
        rpc.expect_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RpcError::Transport("connection refused".to_string())));
        rpc.expect_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(3));

        let allocator = NonceAllocator::new();
        let err = allocator
            .allocate(ADDRESS, Ledger::Account, &rpc)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NonceQuery { .. }));
        assert!(err.is_retryable());
        assert_eq!(allocator.reservation(ADDRESS, Ledger::Account).await, None);

        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reset_reseeds_from_network() {
        let mut rpc = MockRpcService::new();
        let mut seq = mockall::Sequence::new();
        rpc.expect_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(10));
        rpc.expect_transaction_count()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(11));

        let allocator = NonceAllocator::new();
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 10);
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 11);

        assert!(allocator.reset(ADDRESS, Ledger::Account));
        assert!(!allocator.reset(ADDRESS, Ledger::Account));
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_release_rolls_back_latest_allocation() {
        let mut rpc = MockRpcService::new();
        rpc.expect_transaction_count().times(1).returning(|_| Ok(20));

        let allocator = NonceAllocator::new();
        assert!(!allocator.release(ADDRESS, Ledger::Account, 20).await);

        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 20);
        assert!(allocator.release(ADDRESS, Ledger::Account, 20).await);
        assert_eq!(
            allocator.reservation(ADDRESS, Ledger::Account).await,
            Some(NonceReservation { next: 20 })
        );
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_release_with_later_allocations_clears_reservation() {
        let mut rpc = MockRpcService::new();
        rpc.expect_transaction_count().times(2).returning(|_| Ok(20));

        let allocator = NonceAllocator::new();
        allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap();
        allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap();

        assert!(allocator.release(ADDRESS, Ledger::Account, 20).await);
        assert_eq!(allocator.reservation(ADDRESS, Ledger::Account).await, None);
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_addresses_are_independent() {
        let mut rpc = MockRpcService::new();
        rpc.expect_transaction_count()
            .times(2)
            .returning(|address| Ok(if address.ends_with("EE7") { 5 } else { 100 }));

        let allocator = NonceAllocator::new();
        let other = "0x0000000000000000000000000000000000000001";
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 5);
        assert_eq!(allocator.allocate(other, Ledger::Account, &rpc).await.unwrap(), 100);
        assert_eq!(allocator.allocate(ADDRESS, Ledger::Account, &rpc).await.unwrap(), 6);
    }
}
