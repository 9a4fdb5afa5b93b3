//! `Distributor` (C4, spec §4.3): the outer tick loop. Decides the next
//! block range, fans events out to each Keeper, drives `updateIndex` then
//! `execute`, and advances `lastProcessedBlock` only once every Keeper has
//! succeeded this tick.
//!
//! Grounded on the teacher's `main.rs` run loop (`loop { scan; collect;
//! sleep }` over one contract), generalized to N Keepers ticked per-market
//! with the ordering/backlog-cap rules of spec §4.3: each Keeper's
//! `updateIndex`+`execute` runs as its own `tokio::task` so ticks interleave
//! across Keepers (spec §5), joined back together before the tick advances.

use crate::chain::ChainClient;
use crate::events::EventSource;
use crate::keeper::{BlockContext, Keeper};
use crate::market::{u256_to_f64, MarketContract};
use ethers::types::Address;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One Keeper instance registered with the Distributor: which contract it
/// scans events for, and (LiquidationKeeper only) where to read the asset
/// price it needs for candidate selection (spec §4.3 step 3b).
#[derive(Clone)]
pub struct KeeperRegistration {
    pub id: String,
    pub keeper: Arc<dyn Keeper>,
    pub contract: Address,
    pub price_source: Option<Arc<dyn MarketContract>>,
}

pub struct Distributor {
    chain: Arc<dyn ChainClient>,
    entries: Vec<KeeperRegistration>,
    max_event_block_range: u64,
    max_backlog: u64,
    process_interval: Duration,
    shutdown_grace: Duration,
    last_processed_block: AtomicU64,
}

impl Distributor {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        entries: Vec<KeeperRegistration>,
        from_block: u64,
        max_event_block_range: u64,
        max_backlog: u64,
        process_interval: Duration,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            chain,
            entries,
            max_event_block_range,
            max_backlog,
            process_interval,
            shutdown_grace,
            // lastProcessedBlock starts one below from_block so the first
            // tick's range is `[from_block, toBlock]` inclusive.
            last_processed_block: AtomicU64::new(from_block.saturating_sub(1)),
        }
    }

    /// Hydrate every registered Keeper from current on-chain state before
    /// the first tick (spec §4.3 "Hydration").
    pub async fn hydrate(&self) -> eyre::Result<()> {
        let tip = self.chain.block_number().await?;
        let timestamp = self.chain.block_timestamp(tip).await?;
        let block = BlockContext {
            number: tip,
            timestamp,
        };
        for entry in &self.entries {
            entry.keeper.hydrate(block).await;
        }
        Ok(())
    }

    /// Drive ticks until `shutdown` is cancelled, letting the in-flight tick
    /// drain with a `shutdown_grace` hard deadline (spec §5 "Cancellation").
    pub async fn run(&self, shutdown: CancellationToken) -> eyre::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let tick_start = Instant::now();
            let tick = tokio::select! {
                result = self.run_tick() => result,
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested; draining in-flight tick");
                    tokio::time::timeout(self.shutdown_grace, self.run_tick())
                        .await
                        .unwrap_or_else(|_elapsed| {
                            tracing::warn!("shutdown grace period elapsed before tick finished draining");
                            Ok(())
                        })
                }
            };

            if let Err(err) = tick {
                tracing::error!(error = %err, "distributor tick failed");
            }

            metrics::gauge!(crate::metrics::DISTRIBUTOR_BLOCK_PROCESS_TIME_MS)
                .set(tick_start.elapsed().as_millis() as f64);

            if shutdown.is_cancelled() {
                return Ok(());
            }

            let elapsed = tick_start.elapsed();
            let remainder = self.process_interval.saturating_sub(elapsed);
            tokio::select! {
                _ = tokio::time::sleep(remainder) => {}
                _ = shutdown.cancelled() => {}
            }
        }
    }

    async fn run_tick(&self) -> eyre::Result<()> {
        let tip = self.chain.block_number().await?;
        let last_processed_block = self.last_processed_block.load(Ordering::SeqCst);

        let mut to_block = tip;
        let delta = tip.saturating_sub(last_processed_block);
        if delta > self.max_backlog {
            metrics::gauge!(crate::metrics::DISTRIBUTOR_BLOCK_DELTA).set(delta as f64);
            to_block = last_processed_block.saturating_add(self.max_backlog);
        }

        if to_block <= last_processed_block {
            // Nothing new since the last tick.
            return Ok(());
        }

        let from_block = last_processed_block.saturating_add(1);
        let timestamp = self.chain.block_timestamp(to_block).await?;
        let block = BlockContext {
            number: to_block,
            timestamp,
        };

        let tasks = self.entries.iter().cloned().map(|entry| {
            let chain = self.chain.clone();
            let max_event_block_range = self.max_event_block_range;
            tokio::spawn(async move {
                let source = EventSource::new(chain.as_ref(), max_event_block_range);
                let events = match source
                    .get_events(entry.contract, entry.keeper.events_of_interest(), from_block, to_block)
                    .await
                {
                    Ok(events) => events,
                    Err(err) => {
                        tracing::warn!(
                            keeper = %entry.id,
                            from_block,
                            to_block,
                            error = %err,
                            "event scan failed; skipping this keeper this tick"
                        );
                        metrics::counter!(crate::metrics::KEEPER_ERROR, "keeper" => entry.id.clone())
                            .increment(1);
                        return false;
                    }
                };

                let price = match &entry.price_source {
                    Some(source) => match source.asset_price().await {
                        Ok(p) => Some(u256_to_f64(p)),
                        Err(err) => {
                            tracing::warn!(keeper = %entry.id, error = %err, "asset price fetch failed");
                            None
                        }
                    },
                    None => None,
                };

                entry.keeper.update_index(events, block, price).await;
                entry.keeper.execute().await;
                true
            })
        });

        let results = futures::future::join_all(tasks).await;
        let all_ok = results
            .into_iter()
            .map(|r| r.unwrap_or_else(|join_err| {
                tracing::error!(error = %join_err, "keeper tick task panicked");
                false
            }))
            .all(|ok| ok);

        // spec §4.3: lastProcessedBlock only advances once every Keeper's
        // EventSource scan succeeded this tick; a skipped Keeper is retried
        // next tick against the same (unadvanced) range, so no event is
        // ever lost.
        if all_ok {
            self.last_processed_block.store(to_block, Ordering::SeqCst);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, PerpsEvent};
    use async_trait::async_trait;
    use ethers::types::{H256, U256};
    use std::sync::atomic::AtomicUsize;

    struct FixedChain {
        tip: u64,
        timestamp: u64,
    }

    #[async_trait]
    impl ChainClient for FixedChain {
        async fn block_number(&self) -> eyre::Result<u64> {
            Ok(self.tip)
        }
        async fn block_timestamp(&self, _block_number: u64) -> eyre::Result<u64> {
            Ok(self.timestamp)
        }
        async fn gas_price(&self) -> eyre::Result<U256> {
            Ok(U256::zero())
        }
        async fn balance(&self, _address: Address) -> eyre::Result<U256> {
            Ok(U256::zero())
        }
        async fn get_logs(
            &self,
            _address: Address,
            _topics: &[H256],
            _from_block: u64,
            _to_block: u64,
        ) -> eyre::Result<Vec<crate::chain::RawLog>> {
            Ok(Vec::new())
        }
    }

    struct CountingKeeper {
        events_seen: AtomicUsize,
        executes: AtomicUsize,
    }

    #[async_trait]
    impl Keeper for CountingKeeper {
        fn events_of_interest(&self) -> &'static [PerpsEvent] {
            &[PerpsEvent::PositionModified]
        }

        async fn update_index(&self, events: Vec<Event>, _block: BlockContext, _price: Option<f64>) {
            self.events_seen.fetch_add(events.len(), Ordering::SeqCst);
        }

        async fn hydrate(&self, _block: BlockContext) {}

        async fn execute(&self) {
            self.executes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn advances_last_processed_block_when_all_keepers_succeed() {
        let chain: Arc<dyn ChainClient> = Arc::new(FixedChain {
            tip: 100,
            timestamp: 1_000,
        });
        let keeper = Arc::new(CountingKeeper {
            events_seen: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
        });
        let entries = vec![KeeperRegistration {
            id: "test".into(),
            keeper: keeper.clone(),
            contract: Address::zero(),
            price_source: None,
        }];

        let distributor = Distributor::new(
            chain,
            entries,
            1,
            50_000,
            1_000_000,
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        distributor.run_tick().await.unwrap();
        assert_eq!(distributor.last_processed_block.load(Ordering::SeqCst), 100);
        assert_eq!(keeper.executes.load(Ordering::SeqCst), 1);

        // A second tick at the same tip has no new blocks to process.
        distributor.run_tick().await.unwrap();
        assert_eq!(keeper.executes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn caps_to_block_at_max_backlog_when_far_behind() {
        let chain: Arc<dyn ChainClient> = Arc::new(FixedChain {
            tip: 1_000_000,
            timestamp: 1,
        });
        let keeper = Arc::new(CountingKeeper {
            events_seen: AtomicUsize::new(0),
            executes: AtomicUsize::new(0),
        });
        let entries = vec![KeeperRegistration {
            id: "test".into(),
            keeper,
            contract: Address::zero(),
            price_source: None,
        }];

        let distributor = Distributor::new(
            chain,
            entries,
            1,
            50_000,
            100, // MAX_BACKLOG
            Duration::from_millis(10),
            Duration::from_secs(1),
        );

        distributor.run_tick().await.unwrap();
        assert_eq!(distributor.last_processed_block.load(Ordering::SeqCst), 100);
    }
}
