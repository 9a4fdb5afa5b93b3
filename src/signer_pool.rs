//! `SignerPool` (C2, spec §4.1): at-most-one in-flight transaction per
//! signing key, FIFO-fair acquisition, serialized nonce issuance.
//!
//! Grounded on the teacher's single-signer `SignerMiddleware` stack in
//! `main.rs`, generalized to a fixed pool of HD-derived keys. The
//! acquire/release guard shape borrows from the `other_examples` NEAR
//! relayer `key_pool.rs`'s `KeyGuard` (RAII release, atomic in-flight
//! accounting), adapted from NEAR's lock-free round-robin to a
//! `tokio::sync::Semaphore`-backed FIFO waiter queue, since spec §4.1
//! requires cancellable, arrival-ordered acquisition rather than best-effort
//! round robin.

use crate::error::KeeperError;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::LocalWallet;
use ethers::middleware::SignerMiddleware;
use ethers::types::{Address, U256};
use eyre::Result;
use std::future::Future;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

pub type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

struct SignerSlot {
    client: std::sync::Arc<SignerClient>,
    /// Next nonce to hand out. Treated as authoritative until a failure
    /// flags `needs_resync`; only then is it re-read from chain.
    next_nonce: AtomicU64,
    needs_resync: AtomicBool,
}

/// A leased signer + nonce, valid for the duration of one `with_signer`
/// task (spec §3 `SignerLease`).
pub struct SignerLease {
    pub client: std::sync::Arc<SignerClient>,
    pub address: Address,
    pub nonce: U256,
}

pub struct SignerPool {
    slots: Vec<SignerSlot>,
    idle: Mutex<VecDeque<usize>>,
    permits: Semaphore,
}

impl SignerPool {
    pub fn new(provider: Provider<Http>, wallets: Vec<LocalWallet>, start_nonce: u64) -> Self {
        let n = wallets.len();
        let slots = wallets
            .into_iter()
            .map(|wallet| SignerSlot {
                client: std::sync::Arc::new(SignerMiddleware::new(provider.clone(), wallet)),
                next_nonce: AtomicU64::new(start_nonce),
                needs_resync: AtomicBool::new(true),
            })
            .collect();

        Self {
            slots,
            idle: Mutex::new((0..n).collect()),
            permits: Semaphore::new(n),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Every signer's address, for periodic balance reporting
    /// (`KeeperSignerEthBalance`, spec §6). Order is stable but otherwise
    /// unspecified.
    pub fn addresses(&self) -> Vec<Address> {
        self.slots.iter().map(|slot| slot.client.address()).collect()
    }

    /// Acquire an idle signer, run `task(lease)`, release unconditionally.
    /// `asset` is a free-form metrics/logging tag only (spec §4.1: "does
    /// not influence selection"). `deadline` bounds the FIFO wait;
    /// elapsing it yields `KeeperError::PoolExhaustedTimeout` without
    /// touching the pool.
    pub async fn with_signer<F, Fut, T>(
        &self,
        asset: Option<&str>,
        deadline: Duration,
        task: F,
    ) -> Result<T, KeeperError>
    where
        F: FnOnce(SignerLease) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = match tokio::time::timeout(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(KeeperError::PoolExhaustedTimeout),
            Err(_elapsed) => {
                metrics::counter!("perpsv2_keeper_pool_exhausted_timeout").increment(1);
                return Err(KeeperError::PoolExhaustedTimeout);
            }
        };

        let idx = {
            let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
            idle.pop_front().expect("permit implies an idle slot exists")
        };
        let _guard = ReleaseOnDrop { pool: self, idx };

        let slot = &self.slots[idx];
        let client = slot.client.clone();
        let address = client.address();

        if slot.needs_resync.load(Ordering::SeqCst) {
            let onchain = client
                .get_transaction_count(address, None)
                .await
                .map_err(|e| KeeperError::Transient(e.to_string()))?;
            slot.next_nonce.store(onchain.as_u64(), Ordering::SeqCst);
            slot.needs_resync.store(false, Ordering::SeqCst);
        }

        let nonce = U256::from(slot.next_nonce.fetch_add(1, Ordering::SeqCst));

        tracing::debug!(signer = ?address, ?nonce, asset, "signer leased");

        let lease = SignerLease {
            client,
            address,
            nonce,
        };

        let result = task(lease).await;

        if result.is_err() {
            slot.needs_resync.store(true, Ordering::SeqCst);
        }

        result.map_err(|e| KeeperError::ExecutionFailed {
            account: address,
            reason: e.to_string(),
        })
    }
}

struct ReleaseOnDrop<'a> {
    pool: &'a SignerPool,
    idx: usize,
}

impl<'a> Drop for ReleaseOnDrop<'a> {
    fn drop(&mut self) {
        let mut idle = self.pool.idle.lock().unwrap_or_else(|e| e.into_inner());
        idle.push_back(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::signers::Signer;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    fn test_provider() -> Provider<Http> {
        Provider::<Http>::try_from("http://127.0.0.1:8545").unwrap()
    }

    fn test_wallets(n: usize) -> Vec<LocalWallet> {
        crate::mnemonic::derive_signers(
            "test test test test test test test test test test test junk",
            n,
            1,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn size_matches_wallet_count() {
        let pool = SignerPool::new(test_provider(), test_wallets(4), 0);
        assert_eq!(pool.size(), 4);
    }

    #[tokio::test]
    async fn serializes_two_concurrent_tasks_for_a_single_key() {
        // Invariant (spec §8 scenario 6): nonces observed sequentially are
        // n, n+1, never n, n or n, n-1, because the lease is held across
        // the whole task, and resync is skipped once primed.
        let pool = Arc::new(SignerPool::new(test_provider(), test_wallets(1), 7));
        // Prime the nonce without a live chain by forcing needs_resync off
        // in a first fast lease.
        pool.slots[0].needs_resync.store(false, Ordering::SeqCst);

        let barrier = Arc::new(Barrier::new(2));
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let pool = pool.clone();
            let barrier = barrier.clone();
            let observed = observed.clone();
            handles.push(tokio::spawn(async move {
                pool.with_signer(None, Duration::from_secs(1), |lease| {
                    let barrier = barrier.clone();
                    let observed = observed.clone();
                    async move {
                        observed.lock().unwrap().push(lease.nonce.as_u64());
                        barrier.wait().await;
                        Ok::<(), eyre::Report>(())
                    }
                })
                .await
                .unwrap();
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        let mut seen = observed.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![7, 8]);
    }

    #[tokio::test]
    async fn pool_exhausted_times_out_when_all_signers_busy() {
        let pool = Arc::new(SignerPool::new(test_provider(), test_wallets(1), 0));
        pool.slots[0].needs_resync.store(false, Ordering::SeqCst);

        let pool2 = pool.clone();
        let hold = tokio::spawn(async move {
            pool2
                .with_signer(None, Duration::from_secs(5), |_lease| async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<(), eyre::Report>(())
                })
                .await
        });

        // Give the first task a moment to acquire the only signer.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = pool
            .with_signer(None, Duration::from_millis(50), |_lease| async move {
                Ok::<(), eyre::Report>(())
            })
            .await;

        assert!(matches!(result, Err(KeeperError::PoolExhaustedTimeout)));
        hold.await.unwrap().unwrap();
    }
}
