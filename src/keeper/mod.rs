//! `Keeper` abstract (C5, spec §4.4): a capability interface with three
//! concrete variants, plus shared helpers used by composition rather than
//! inheritance (spec §9 design note).
//!
//! `exec_async_keeper_callback`/`wait_tx` factor out the
//! timing-metric-wrap-and-swallow-exceptions shape the teacher inlines
//! directly in `collector.rs`'s per-item task bodies.

pub mod delayed_orders;
pub mod liquidation;
pub mod offchain_delayed_orders;

use crate::events::{Event, PerpsEvent};
use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::TxHash;
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    pub number: u64,
    pub timestamp: u64,
}

/// Shared contract exposed to the `Distributor` (spec §4.4). `hydrate`
/// takes only the block context because each concrete keeper already owns
/// the `MarketContract`/`ChainClient` handles it needs to fetch its own
/// snapshot of on-chain state; there is no single snapshot shape shared
/// across keeper kinds (open orders vs. open positions), so object safety
/// is kept by letting each impl pull what it needs rather than threading a
/// generic snapshot type through the trait.
#[async_trait]
pub trait Keeper: Send + Sync {
    fn events_of_interest(&self) -> &'static [PerpsEvent];

    async fn update_index(&self, events: Vec<Event>, block: BlockContext, price: Option<f64>);

    async fn hydrate(&self, block: BlockContext);

    async fn execute(&self);
}

/// Runs `f`, recording a per-keeper timing metric and swallowing (logging,
/// counting) any error so a single keeper's failure never aborts the
/// Distributor's tick (spec §4.3, §7).
pub async fn exec_async_keeper_callback<F, Fut>(keeper_id: &str, callback_name: &str, f: F)
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = eyre::Result<()>>,
{
    let start = Instant::now();
    let result = f().await;
    let elapsed_ms = start.elapsed().as_millis() as f64;

    metrics::histogram!(
        "perpsv2_keeper_callback_duration_ms",
        "keeper" => keeper_id.to_string(),
        "callback" => callback_name.to_string()
    )
    .record(elapsed_ms);

    if let Err(err) = result {
        tracing::error!(keeper = keeper_id, callback = callback_name, error = %err, "keeper callback failed");
        metrics::counter!(
            crate::metrics::KEEPER_ERROR,
            "keeper" => keeper_id.to_string()
        )
        .increment(1);
    }
}

/// Await one confirmation for `tx_hash` with a hard timeout, mirroring the
/// teacher's `tokio::time::timeout(tx_timeout, pending)` pattern in
/// `collector.rs`, generalized off the `ethers::PendingTransaction` return
/// type (which borrows the middleware) to a plain hash lookup so any
/// concrete keeper can call it after submission.
pub async fn wait_tx<M: Middleware>(
    client: &M,
    tx_hash: TxHash,
    timeout: Duration,
) -> eyre::Result<bool> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(receipt) = client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| eyre::eyre!("get_transaction_receipt({tx_hash:?}) failed: {e}"))?
        {
            return Ok(receipt.status == Some(1u64.into()));
        }

        if Instant::now() >= deadline {
            return Err(eyre::eyre!("timed out waiting for confirmation of {tx_hash:?}"));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_WAIT_TIME: Duration = Duration::from_secs(2);
