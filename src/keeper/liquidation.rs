//! LiquidationKeeper (C8, spec §4.7): flags and liquidates underwater
//! positions, with an optional Multicall3 dry-run fast path for the flag
//! step when a Multicall3 address is configured.
//!
//! The three-group candidate ordering (close / unknown / outdated) and the
//! concurrent-batch submission shape are grounded on the same
//! `collector.rs` pattern the other two keepers use, specialised to §4.7's
//! sort/truncate rules instead of a flat due-list.

use crate::chain::ChainClient;
use crate::events::{Event, EventArgs, PerpsEvent};
use crate::keeper::{wait_tx, BlockContext, Keeper};
use crate::market::{self, u256_to_f64, MarketContract};
use crate::multicall::{encode_address_call, Call, Multicall3};
use crate::signer_pool::{SignerClient, SignerPool};
use async_trait::async_trait;
use ethers::providers::{Http, Provider};
use ethers::types::{Address, U256};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const EVENTS_OF_INTEREST: [PerpsEvent; 4] = [
    PerpsEvent::PositionModified,
    PerpsEvent::PositionLiquidated,
    PerpsEvent::PositionFlagged,
    PerpsEvent::FundingRecomputed,
];

const UNIT: f64 = 1e18;
const UNKNOWN_LIQ_PRICE: f64 = -1.0;

#[derive(Debug, Clone)]
struct Position {
    size: f64,
    leverage: f64,
    liq_price: f64,
    liq_price_updated_timestamp: u64,
}

fn i256_to_f64(v: ethers::types::I256) -> f64 {
    v.to_string().parse().unwrap_or(0.0)
}

pub struct LiquidationKeeper {
    id: String,
    asset: String,
    contract_address: Address,
    market: Arc<dyn MarketContract>,
    chain: Arc<dyn ChainClient>,
    signer_pool: Arc<SignerPool>,
    max_batch_size: usize,
    batch_wait_time: Duration,
    signer_lease_deadline: Duration,
    tx_confirm_timeout: Duration,
    proximity_threshold: f64,
    far_price_recency_cutoff_secs: u64,
    max_far_prices_to_update: usize,
    multicall: Option<Arc<Multicall3<Provider<Http>>>>,
    positions: RwLock<HashMap<Address, Position>>,
    block_tip_timestamp: AtomicU64,
    current_price: RwLock<Option<f64>>,
}

impl LiquidationKeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        asset: String,
        contract_address: Address,
        market: Arc<dyn MarketContract>,
        chain: Arc<dyn ChainClient>,
        signer_pool: Arc<SignerPool>,
        max_batch_size: usize,
        batch_wait_time: Duration,
        signer_lease_deadline: Duration,
        tx_confirm_timeout: Duration,
        proximity_threshold: f64,
        far_price_recency_cutoff_secs: u64,
        max_far_prices_to_update: usize,
        multicall: Option<Arc<Multicall3<Provider<Http>>>>,
    ) -> Self {
        Self {
            id,
            asset,
            contract_address,
            market,
            chain,
            signer_pool,
            max_batch_size,
            batch_wait_time,
            signer_lease_deadline,
            tx_confirm_timeout,
            proximity_threshold,
            far_price_recency_cutoff_secs,
            max_far_prices_to_update,
            multicall,
            positions: RwLock::new(HashMap::new()),
            block_tip_timestamp: AtomicU64::new(0),
            current_price: RwLock::new(None),
        }
    }

    /// Three-group candidate list (spec §4.7): close, unknown, outdated,
    /// concatenated in that order.
    async fn select_candidates(&self) -> Vec<Address> {
        let asset_price = match *self.current_price.read().await {
            Some(p) if p > 0.0 => p,
            _ => return Vec::new(),
        };
        let block_tip_timestamp = self.block_tip_timestamp.load(Ordering::SeqCst);

        let mut close: Vec<(Address, f64, f64)> = Vec::new();
        let mut unknown: Vec<(Address, f64)> = Vec::new();
        let mut outdated: Vec<(Address, u64)> = Vec::new();

        for (&account, pos) in self.positions.read().await.iter() {
            if pos.size == 0.0 {
                continue;
            }
            if pos.liq_price == UNKNOWN_LIQ_PRICE {
                unknown.push((account, pos.leverage));
                continue;
            }
            let distance = (pos.liq_price - asset_price).abs() / asset_price;
            if distance <= self.proximity_threshold {
                close.push((account, distance, pos.leverage));
            } else if block_tip_timestamp > 0
                && pos.liq_price_updated_timestamp
                    < block_tip_timestamp.saturating_sub(self.far_price_recency_cutoff_secs)
            {
                outdated.push((account, pos.liq_price_updated_timestamp));
            }
        }

        close.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap()
                .then_with(|| b.2.partial_cmp(&a.2).unwrap())
        });
        unknown.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        outdated.sort_by_key(|o| o.1);
        outdated.truncate(self.max_far_prices_to_update);

        close
            .into_iter()
            .map(|(a, _, _)| a)
            .chain(unknown.into_iter().map(|(a, _)| a))
            .chain(outdated.into_iter().map(|(a, _)| a))
            .collect()
    }

    async fn run_execute(&self) -> eyre::Result<()> {
        let candidates = self.select_candidates().await;

        let mut chunks = candidates.chunks(self.max_batch_size).peekable();
        while let Some(chunk) = chunks.next() {
            match &self.multicall {
                Some(multicall) => self.process_batch_with_multicall(chunk, multicall.clone()).await,
                None => {
                    stream::iter(chunk)
                        .for_each_concurrent(self.max_batch_size, |&account| self.process_one(account))
                        .await;
                }
            }

            if chunks.peek().is_some() {
                tokio::time::sleep(self.batch_wait_time).await;
            }
        }

        Ok(())
    }

    /// Per-account fallback path: read status, refresh `liqPrice` if neither
    /// flagged nor liquidatable yet, otherwise flag (if needed) then
    /// liquidate.
    async fn process_one(&self, account: Address) {
        if let Err(err) = self.try_process_one(account).await {
            tracing::warn!(keeper = %self.id, ?account, error = %err, "liquidation step failed");
            metrics::counter!(crate::metrics::KEEPER_ERROR, "keeper" => self.id.clone()).increment(1);
        }
    }

    async fn try_process_one(&self, account: Address) -> eyre::Result<()> {
        let can_liquidate = self.market.can_liquidate(account).await?;
        let is_flagged = self.market.is_flagged(account).await?;

        if !can_liquidate && !is_flagged {
            self.refresh_liq_price(account).await;
            return Ok(());
        }

        let gas_price = self.chain.gas_price().await? * U256::from(2);

        if !is_flagged {
            self.submit_flag(account, gas_price).await?;
        }
        self.submit_liquidate(account, gas_price).await
    }

    async fn refresh_liq_price(&self, account: Address) {
        match self.market.liquidation_price(account).await {
            Ok(price) => {
                let now = self.block_tip_timestamp.load(Ordering::SeqCst);
                if let Some(pos) = self.positions.write().await.get_mut(&account) {
                    pos.liq_price = u256_to_f64(price);
                    pos.liq_price_updated_timestamp = now;
                }
            }
            Err(err) => {
                tracing::warn!(keeper = %self.id, ?account, error = %err, "liquidationPrice refresh failed");
            }
        }
    }

    async fn submit_flag(&self, account: Address, gas_price: U256) -> eyre::Result<()> {
        let gas_estimate = self.market.estimate_flag_position(account).await?;
        let gas_limit = gas_estimate * U256::from(12) / U256::from(10);
        let contract_address = self.contract_address;
        let tx_timeout = self.tx_confirm_timeout;

        self.signer_pool
            .with_signer(Some(&self.asset), self.signer_lease_deadline, move |lease| async move {
                let tx_hash = market::submit_flag_position(
                    contract_address,
                    lease.client.clone(),
                    account,
                    gas_limit,
                    gas_price,
                    lease.nonce,
                )
                .await?;
                if !wait_tx(lease.client.as_ref(), tx_hash, tx_timeout).await? {
                    return Err(eyre::eyre!("flagPosition {account:?} reverted ({tx_hash:?})"));
                }
                Ok(tx_hash)
            })
            .await?;

        tracing::info!(keeper = %self.id, ?account, "flagged position");
        Ok(())
    }

    async fn submit_liquidate(&self, account: Address, gas_price: U256) -> eyre::Result<()> {
        let gas_estimate = self.market.estimate_liquidate_position(account).await?;
        let gas_limit = gas_estimate * U256::from(12) / U256::from(10);
        let contract_address = self.contract_address;
        let tx_timeout = self.tx_confirm_timeout;

        self.signer_pool
            .with_signer(Some(&self.asset), self.signer_lease_deadline, move |lease| async move {
                let tx_hash = market::submit_liquidate_position(
                    contract_address,
                    lease.client.clone(),
                    account,
                    gas_limit,
                    gas_price,
                    lease.nonce,
                )
                .await?;
                if !wait_tx(lease.client.as_ref(), tx_hash, tx_timeout).await? {
                    return Err(eyre::eyre!("liquidatePosition {account:?} reverted ({tx_hash:?})"));
                }
                Ok(tx_hash)
            })
            .await?;

        self.positions.write().await.remove(&account);
        metrics::counter!(crate::metrics::POSITION_LIQUIDATED, "asset" => self.asset.clone()).increment(1);
        tracing::info!(keeper = %self.id, ?account, "liquidated position");
        Ok(())
    }

    /// Fast path: batch-dry-run `flagPosition` for the whole chunk via
    /// Multicall3 and submit a single transaction with only the calls that
    /// would succeed; everything else (refresh, already-flagged
    /// liquidation) still runs per-account.
    async fn process_batch_with_multicall(&self, chunk: &[Address], multicall: Arc<Multicall3<Provider<Http>>>) {
        let statuses: Vec<(Address, bool, bool)> = stream::iter(chunk.iter().copied())
            .map(|account| async move {
                let can = self.market.can_liquidate(account).await.unwrap_or(false);
                let flagged = self.market.is_flagged(account).await.unwrap_or(false);
                (account, can, flagged)
            })
            .buffer_unordered(self.max_batch_size)
            .collect()
            .await;

        let to_refresh: Vec<Address> = statuses
            .iter()
            .filter(|(_, can, flagged)| !can && !flagged)
            .map(|(a, _, _)| *a)
            .collect();
        for account in to_refresh {
            self.refresh_liq_price(account).await;
        }

        let to_flag: Vec<Address> = statuses
            .iter()
            .filter(|(_, can, flagged)| *can && !flagged)
            .map(|(a, _, _)| *a)
            .collect();
        // Any already-flagged position goes straight to liquidation
        // regardless of canLiquidate, matching the per-account path in
        // `try_process_one` (spec §4.7: "If already flagged, submit
        // liquidatePosition").
        let already_flagged: Vec<Address> = statuses
            .iter()
            .filter(|(_, _can, flagged)| *flagged)
            .map(|(a, _, _)| *a)
            .collect();

        if !to_flag.is_empty() {
            let flag_selector = ethers::utils::keccak256(b"flagPosition(address)");
            let calls: Vec<Call> = to_flag
                .iter()
                .map(|&account| Call {
                    target: self.contract_address,
                    call_data: encode_address_call([flag_selector[0], flag_selector[1], flag_selector[2], flag_selector[3]], account),
                })
                .collect();

            match multicall.dry_run(&calls).await {
                Ok(results) => {
                    let accepted: Vec<(Address, Call)> = to_flag
                        .iter()
                        .copied()
                        .zip(calls)
                        .zip(results)
                        .filter_map(|((account, call), ok)| ok.then_some((account, call)))
                        .collect();
                    let accepted_accounts: Vec<Address> = accepted.iter().map(|(a, _)| *a).collect();
                    let accepted_calls: Vec<Call> = accepted.into_iter().map(|(_, c)| c).collect();

                    if let Err(err) = self.submit_multicall_flag(accepted_calls, multicall.as_ref()).await {
                        tracing::warn!(keeper = %self.id, error = %err, "multicall flag batch submission failed");
                    } else {
                        for account in &accepted_accounts {
                            let gas_price = self.gas_price_with_headroom().await.unwrap_or_default();
                            if let Err(err) = self.submit_liquidate(*account, gas_price).await {
                                tracing::warn!(keeper = %self.id, ?account, error = %err, "liquidation after multicall flag failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(keeper = %self.id, error = %err, "multicall dry run failed; falling back to per-account flagging");
                    stream::iter(to_flag)
                        .for_each_concurrent(self.max_batch_size, |account| self.process_one(account))
                        .await;
                }
            }
        }

        stream::iter(already_flagged)
            .for_each_concurrent(self.max_batch_size, |account| self.process_one(account))
            .await;
    }

    async fn gas_price_with_headroom(&self) -> eyre::Result<U256> {
        Ok(self.chain.gas_price().await? * U256::from(2))
    }

    async fn submit_multicall_flag(
        &self,
        calls: Vec<Call>,
        multicall: &Multicall3<Provider<Http>>,
    ) -> eyre::Result<()> {
        if calls.is_empty() {
            return Ok(());
        }

        let gas_estimate = multicall.estimate_gas(&calls).await?;
        let gas_limit = gas_estimate * U256::from(12) / U256::from(10);
        let gas_price = self.gas_price_with_headroom().await?;

        let contract_address = self.contract_address;
        let tx_timeout = self.tx_confirm_timeout;
        let signer_lease_deadline = self.signer_lease_deadline;

        self.signer_pool
            .with_signer(Some(&self.asset), signer_lease_deadline, move |lease| async move {
                let writer: Multicall3<SignerClient> = Multicall3::new(contract_address, lease.client.clone());
                let hashes = writer.submit(&calls, gas_limit, gas_price, lease.nonce).await?;
                for hash in &hashes {
                    if !wait_tx(lease.client.as_ref(), *hash, tx_timeout).await? {
                        return Err(eyre::eyre!("multicall flag batch tx {hash:?} reverted"));
                    }
                }
                Ok(())
            })
            .await?;

        Ok(())
    }
}

#[async_trait]
impl Keeper for LiquidationKeeper {
    fn events_of_interest(&self) -> &'static [PerpsEvent] {
        &EVENTS_OF_INTEREST
    }

    async fn update_index(&self, events: Vec<Event>, block: BlockContext, price: Option<f64>) {
        if let Some(price) = price {
            *self.current_price.write().await = Some(price);
        }

        let mut positions = self.positions.write().await;
        for event in events {
            match event.args {
                EventArgs::PositionModified {
                    margin,
                    size,
                    last_price,
                    account,
                    ..
                } => {
                    if margin.is_zero() {
                        positions.remove(&account);
                        continue;
                    }
                    let size_raw = i256_to_f64(size);
                    let margin_raw = u256_to_f64(margin);
                    let last_price_raw = u256_to_f64(last_price);
                    let leverage = (size_raw.abs() * last_price_raw) / (margin_raw * UNIT);
                    positions.insert(
                        account,
                        Position {
                            size: size_raw / UNIT,
                            leverage,
                            liq_price: UNKNOWN_LIQ_PRICE,
                            liq_price_updated_timestamp: 0,
                        },
                    );
                }
                EventArgs::PositionLiquidated { account } | EventArgs::PositionFlagged { account } => {
                    positions.remove(&account);
                }
                EventArgs::FundingRecomputed { timestamp } => {
                    self.block_tip_timestamp.store(timestamp, Ordering::SeqCst);
                }
                _ => {}
            }
        }
        drop(positions);

        // FundingRecomputed is also the only direct clock signal; if none
        // arrived this tick, fall back to the distributor's block timestamp
        // so far-price aging still progresses.
        self.block_tip_timestamp
            .fetch_max(block.timestamp, Ordering::SeqCst);
    }

    async fn hydrate(&self, block: BlockContext) {
        self.block_tip_timestamp.fetch_max(block.timestamp, Ordering::SeqCst);
        tracing::debug!(
            keeper = %self.id,
            "liquidation keeper hydrates from event replay only; no bulk on-chain \
             enumeration of open positions is exposed by the market contract"
        );
    }

    async fn execute(&self) {
        crate::keeper::exec_async_keeper_callback(&self.id, "execute", || self.run_execute()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(size: f64, leverage: f64, liq_price: f64, updated: u64) -> Position {
        Position {
            size,
            leverage,
            liq_price,
            liq_price_updated_timestamp: updated,
        }
    }

    #[tokio::test]
    async fn position_modified_to_leverage_matches_scenario_three() {
        // size=+10e18, margin=100e18, lastPrice=50e18 -> leverage 5.
        let size = ethers::types::I256::exp10(19); // 10e18
        let margin = U256::exp10(20); // 100e18
        let last_price = U256::exp10(19) * U256::from(5); // 50e18
        let size_raw = i256_to_f64(size);
        let margin_raw = u256_to_f64(margin);
        let last_price_raw = u256_to_f64(last_price);
        let leverage = (size_raw.abs() * last_price_raw) / (margin_raw * UNIT);
        assert!((leverage - 5.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn close_group_sorts_by_distance_then_leverage_descending() {
        let keeper_positions: HashMap<Address, Position> = [
            (Address::repeat_byte(0xC1), pos(1.0, 3.0, 9.6, 0)),
            (Address::repeat_byte(0xD1), pos(1.0, 2.0, 9.9, 0)),
        ]
        .into_iter()
        .collect();

        let mut close: Vec<(Address, f64, f64)> = keeper_positions
            .iter()
            .map(|(&a, p)| (a, (p.liq_price - 10.0).abs() / 10.0, p.leverage))
            .collect();
        close.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap()
                .then_with(|| b.2.partial_cmp(&a.2).unwrap())
        });

        let order: Vec<Address> = close.into_iter().map(|(a, _, _)| a).collect();
        assert_eq!(order, vec![Address::repeat_byte(0xD1), Address::repeat_byte(0xC1)]);
    }

    #[test]
    fn outdated_group_truncates_to_max_far_prices() {
        let mut outdated = vec![
            (Address::repeat_byte(1), 100u64),
            (Address::repeat_byte(2), 50u64),
            (Address::repeat_byte(3), 75u64),
        ];
        outdated.sort_by_key(|o| o.1);
        outdated.truncate(1);
        assert_eq!(outdated, vec![(Address::repeat_byte(2), 50u64)]);
    }
}
