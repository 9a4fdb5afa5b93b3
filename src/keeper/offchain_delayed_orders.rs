//! OffchainDelayedOrdersKeeper (C7, spec §4.6).
//!
//! Same index/selection as [`crate::keeper::delayed_orders`]; the only
//! difference is the per-order submission path, which fetches a signed Pyth
//! update first and pays the on-chain update fee as `msg.value`. A Pyth
//! fetch failure is folded into the same `executionFailures` accounting as
//! an execution failure (spec §4.6: "counts as one failure").

use crate::events::{Event, EventArgs, PerpsEvent};
use crate::keeper::{wait_tx, BlockContext, Keeper};
use crate::market::{self, MarketContract};
use crate::notifier::Notifier;
use crate::pyth::PythClient;
use crate::signer_pool::SignerPool;
use async_trait::async_trait;
use ethers::types::{Address, U256};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const EVENTS_OF_INTEREST: [PerpsEvent; 2] = [
    PerpsEvent::DelayedOrderSubmitted,
    PerpsEvent::DelayedOrderRemoved,
];

#[derive(Debug, Clone)]
struct DelayedOrder {
    target_round_id: U256,
    executable_at_time: u64,
    #[allow(dead_code)]
    intention_time: u64,
    execution_failures: u32,
}

fn is_ready(order: &DelayedOrder, current_round_id: U256, now: u64) -> bool {
    current_round_id >= order.target_round_id || now >= order.executable_at_time
}

pub struct OffchainDelayedOrdersKeeper {
    id: String,
    asset: String,
    contract_address: Address,
    price_feed_id: String,
    market: Arc<dyn MarketContract>,
    pyth: Arc<dyn PythClient>,
    signer_pool: Arc<SignerPool>,
    notifier: Arc<dyn Notifier>,
    max_exec_attempts: u32,
    max_batch_size: usize,
    batch_wait_time: Duration,
    signer_lease_deadline: Duration,
    tx_confirm_timeout: Duration,
    orders: RwLock<HashMap<Address, DelayedOrder>>,
    last_block: RwLock<Option<BlockContext>>,
}

impl OffchainDelayedOrdersKeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        asset: String,
        contract_address: Address,
        price_feed_id: String,
        market: Arc<dyn MarketContract>,
        pyth: Arc<dyn PythClient>,
        signer_pool: Arc<SignerPool>,
        notifier: Arc<dyn Notifier>,
        max_exec_attempts: u32,
        max_batch_size: usize,
        batch_wait_time: Duration,
        signer_lease_deadline: Duration,
        tx_confirm_timeout: Duration,
    ) -> Self {
        Self {
            id,
            asset,
            contract_address,
            price_feed_id,
            market,
            pyth,
            signer_pool,
            notifier,
            max_exec_attempts,
            max_batch_size,
            batch_wait_time,
            signer_lease_deadline,
            tx_confirm_timeout,
            orders: RwLock::new(HashMap::new()),
            last_block: RwLock::new(None),
        }
    }

    async fn run_execute(&self) -> eyre::Result<()> {
        let current_round_id = self.market.current_round_id(&self.asset).await?;
        let now = self
            .last_block
            .read()
            .await
            .map(|b| b.timestamp)
            .unwrap_or(0);

        let ready: Vec<Address> = {
            let orders = self.orders.read().await;
            orders
                .iter()
                .filter(|(_, o)| is_ready(o, current_round_id, now))
                .map(|(account, _)| *account)
                .collect()
        };

        let mut chunks = ready.chunks(self.max_batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            stream::iter(chunk)
                .for_each_concurrent(self.max_batch_size, |&account| self.execute_one(account))
                .await;

            if chunks.peek().is_some() {
                tokio::time::sleep(self.batch_wait_time).await;
            }
        }

        Ok(())
    }

    async fn execute_one(&self, account: Address) {
        if let Err(err) = self.try_execute_one(account).await {
            self.record_failure(account, &err.to_string()).await;
        }
    }

    async fn try_execute_one(&self, account: Address) -> eyre::Result<()> {
        let onchain = self.market.delayed_order(account).await?;
        if onchain.size_delta == 0 {
            self.orders.write().await.remove(&account);
            metrics::counter!(
                crate::metrics::DELAYED_ORDER_ALREADY_EXECUTED,
                "asset" => self.asset.clone()
            )
            .increment(1);
            return Ok(());
        }

        let update_data = self
            .pyth
            .fetch_update_data(&self.price_feed_id)
            .await
            .map_err(|e| eyre::eyre!("pyth fetch failed for {account:?}: {e}"))?;
        let fee = self.pyth.update_fee(&update_data).await?;

        let gas_estimate = self.market.estimate_execute_delayed_order(account).await?;
        let gas_limit = gas_estimate * U256::from(12) / U256::from(10);

        let contract_address = self.contract_address;
        let tx_timeout = self.tx_confirm_timeout;

        self.signer_pool
            .with_signer(Some(&self.asset), self.signer_lease_deadline, move |lease| async move {
                let tx_hash = market::submit_execute_offchain_delayed_order(
                    contract_address,
                    lease.client.clone(),
                    account,
                    update_data,
                    fee,
                    gas_limit,
                    lease.nonce,
                )
                .await?;
                if !wait_tx(lease.client.as_ref(), tx_hash, tx_timeout).await? {
                    return Err(eyre::eyre!(
                        "execute_offchain_delayed_order {account:?} reverted ({tx_hash:?})"
                    ));
                }
                Ok(tx_hash)
            })
            .await?;

        self.orders.write().await.remove(&account);
        metrics::counter!(
            crate::metrics::OFFCHAIN_ORDER_EXECUTED,
            "asset" => self.asset.clone()
        )
        .increment(1);
        tracing::info!(keeper = %self.id, ?account, "executed offchain delayed order");
        Ok(())
    }

    async fn record_failure(&self, account: Address, reason: &str) {
        let evicted_attempts = {
            let mut orders = self.orders.write().await;
            match orders.get_mut(&account) {
                Some(order) => {
                    order.execution_failures += 1;
                    if order.execution_failures > self.max_exec_attempts {
                        let attempts = order.execution_failures;
                        orders.remove(&account);
                        Some(attempts)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        tracing::warn!(keeper = %self.id, ?account, reason, "offchain delayed order execution failed");
        metrics::counter!(crate::metrics::KEEPER_ERROR, "keeper" => self.id.clone()).increment(1);

        if let Some(attempts) = evicted_attempts {
            tracing::warn!(keeper = %self.id, ?account, attempts, "evicting offchain delayed order after max attempts");
            self.notifier.order_evicted(account, attempts).await;
        }
    }
}

#[async_trait]
impl Keeper for OffchainDelayedOrdersKeeper {
    fn events_of_interest(&self) -> &'static [PerpsEvent] {
        &EVENTS_OF_INTEREST
    }

    async fn update_index(&self, events: Vec<Event>, block: BlockContext, _price: Option<f64>) {
        *self.last_block.write().await = Some(block);

        let mut orders = self.orders.write().await;
        for event in events {
            match event.args {
                EventArgs::DelayedOrderSubmitted {
                    account,
                    target_round_id,
                    executable_at_time,
                    intention_time,
                    ..
                } => {
                    let intention_time = if intention_time == 0 {
                        block.timestamp
                    } else {
                        intention_time
                    };
                    orders.insert(
                        account,
                        DelayedOrder {
                            target_round_id,
                            executable_at_time,
                            intention_time,
                            execution_failures: 0,
                        },
                    );
                }
                EventArgs::DelayedOrderRemoved { account } => {
                    orders.remove(&account);
                }
                _ => {}
            }
        }
    }

    async fn hydrate(&self, block: BlockContext) {
        *self.last_block.write().await = Some(block);
        tracing::debug!(
            keeper = %self.id,
            "offchain delayed orders keeper hydrates from event replay only"
        );
    }

    async fn execute(&self) {
        crate::keeper::exec_async_keeper_callback(&self.id, "execute", || self.run_execute()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pyth_fetch_failure_is_a_plain_execution_failure() {
        // The error path in try_execute_one for a failed Pyth fetch returns
        // the same eyre::Report type record_failure already handles for a
        // reverted transaction, so no separate accounting is needed; this
        // just documents that `is_ready` is identical to the on-chain variant.
        let order = DelayedOrder {
            target_round_id: U256::from(5),
            executable_at_time: 100,
            intention_time: 90,
            execution_failures: 0,
        };
        assert!(is_ready(&order, U256::from(5), 0));
        assert!(is_ready(&order, U256::zero(), 100));
        assert!(!is_ready(&order, U256::zero(), 0));
    }
}
