//! The on-chain capability surface the keeper calls (spec §6.3), exposed as
//! an abstract `MarketContract` trait with one `ethers`-backed
//! implementation, the same `abigen!`-a-minimal-ABI idiom the teacher uses
//! in `opensub.rs`/`erc20.rs`, generalized to the PerpsV2 surface.

use crate::signer_pool::SignerClient;
use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::Middleware;
use ethers::types::{Address, TxHash, U256};
use eyre::Result;
use serde::Deserialize;
use std::sync::Arc;

/// One entry of the `MARKETS_CONFIG_FILE` JSON array (spec §3 `Market`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketConfig {
    pub key: String,
    pub asset: String,
    pub contract: Address,
    pub base_asset: String,
    /// Pyth price-feed id for this market's asset (C7 only).
    #[serde(default)]
    pub price_feed_id: Option<String>,
}

abigen!(
    PerpsV2MarketAbi,
    r#"[
        function delayedOrders(address account) view returns (uint256 targetRoundId, uint256 executableAtTime, uint256 intentionTime, int256 sizeDelta)
        function executeDelayedOrder(address account)
        function executeOffchainDelayedOrder(address account, bytes[] priceUpdateData) payable
        function offchainPriceFeedId() view returns (bytes32)
        function canLiquidate(address account) view returns (bool)
        function isFlagged(address account) view returns (bool)
        function liquidationPrice(address account) view returns (uint256)
        function flagPosition(address account)
        function liquidatePosition(address account)
        function assetPrice() view returns (uint256 price, bool invalid)
    ]"#
);

abigen!(
    ExchangeRatesAbi,
    r#"[
        function getCurrentRoundId(bytes32 currencyKey) view returns (uint256)
    ]"#
);

/// `(targetRoundId, executableAtTime, intentionTime, sizeDelta)` as read
/// straight off `delayedOrders(account)`; `sizeDelta == 0` means the order
/// no longer exists on-chain (spec §4.5 "already executed" precheck).
#[derive(Debug, Clone, Copy)]
pub struct OnchainDelayedOrder {
    pub target_round_id: U256,
    pub executable_at_time: u64,
    pub intention_time: u64,
    pub size_delta: i128,
}

/// Read-side capability set a Keeper needs from a single PerpsV2 market
/// contract plus its companion exchange-rates oracle. One implementor
/// (`EthersMarketContract`) talks to a live chain; tests substitute an
/// in-memory fake.
///
/// Write calls (`executeDelayedOrder`, `flagPosition`, ...) are deliberately
/// *not* on this trait: a write must go out under whichever signer the
/// `SignerPool` happens to lease for that task, not under the fixed client
/// this struct was constructed with. See the free functions below, which
/// build a short-lived contract handle over the leased
/// [`crate::signer_pool::SignerClient`] instead.
#[async_trait]
pub trait MarketContract: Send + Sync {
    async fn current_round_id(&self, currency_key: &str) -> Result<U256>;
    async fn offchain_price_feed_id(&self) -> Result<[u8; 32]>;
    async fn delayed_order(&self, account: Address) -> Result<OnchainDelayedOrder>;
    async fn can_liquidate(&self, account: Address) -> Result<bool>;
    async fn is_flagged(&self, account: Address) -> Result<bool>;
    async fn liquidation_price(&self, account: Address) -> Result<U256>;
    /// The market's current asset price (`assetPrice()`), used by the
    /// Distributor to supply `price` to `LiquidationKeeper::update_index`
    /// (spec §4.3 step 3b: "fetchAssetPrice(K.asset), LiquidationKeeper
    /// only"). Left in the same raw on-chain scale as `liquidation_price`;
    /// callers only ever compare the two as a ratio, so the scale cancels.
    async fn asset_price(&self) -> Result<U256>;
    async fn estimate_execute_delayed_order(&self, account: Address) -> Result<U256>;
    async fn estimate_flag_position(&self, account: Address) -> Result<U256>;
    async fn estimate_liquidate_position(&self, account: Address) -> Result<U256>;
}

pub struct EthersMarketContract<M: Middleware> {
    pub contract_address: Address,
    market: PerpsV2MarketAbi<M>,
    exchange_rates: ExchangeRatesAbi<M>,
}

impl<M: Middleware + 'static> EthersMarketContract<M> {
    pub fn new(market_address: Address, exchange_rates_address: Address, client: Arc<M>) -> Self {
        Self {
            contract_address: market_address,
            market: PerpsV2MarketAbi::new(market_address, client.clone()),
            exchange_rates: ExchangeRatesAbi::new(exchange_rates_address, client),
        }
    }
}

/// Lossy `U256` -> `f64` conversion shared by every module that compares
/// on-chain prices/leverage as ratios (`liquidation.rs`'s proximity/leverage
/// math) rather than needing exact integer precision.
pub fn u256_to_f64(v: U256) -> f64 {
    v.to_string().parse().unwrap_or(f64::MAX)
}

fn currency_key_bytes32(key: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let bytes = key.as_bytes();
    let n = bytes.len().min(32);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[async_trait]
impl<M: Middleware + 'static> MarketContract for EthersMarketContract<M> {
    async fn current_round_id(&self, currency_key: &str) -> Result<U256> {
        Ok(self
            .exchange_rates
            .get_current_round_id(currency_key_bytes32(currency_key))
            .call()
            .await?)
    }

    async fn offchain_price_feed_id(&self) -> Result<[u8; 32]> {
        Ok(self.market.offchain_price_feed_id().call().await?)
    }

    async fn delayed_order(&self, account: Address) -> Result<OnchainDelayedOrder> {
        let (target_round_id, executable_at_time, intention_time, size_delta) =
            self.market.delayed_orders(account).call().await?;
        Ok(OnchainDelayedOrder {
            target_round_id,
            executable_at_time: executable_at_time.as_u64(),
            intention_time: intention_time.as_u64(),
            size_delta: size_delta.as_i128(),
        })
    }

    async fn can_liquidate(&self, account: Address) -> Result<bool> {
        Ok(self.market.can_liquidate(account).call().await?)
    }

    async fn is_flagged(&self, account: Address) -> Result<bool> {
        Ok(self.market.is_flagged(account).call().await?)
    }

    async fn liquidation_price(&self, account: Address) -> Result<U256> {
        Ok(self.market.liquidation_price(account).call().await?)
    }

    async fn asset_price(&self) -> Result<U256> {
        let (price, _invalid) = self.market.asset_price().call().await?;
        Ok(price)
    }

    async fn estimate_execute_delayed_order(&self, account: Address) -> Result<U256> {
        Ok(self
            .market
            .execute_delayed_order(account)
            .estimate_gas()
            .await?)
    }

    async fn estimate_flag_position(&self, account: Address) -> Result<U256> {
        Ok(self.market.flag_position(account).estimate_gas().await?)
    }

    async fn estimate_liquidate_position(&self, account: Address) -> Result<U256> {
        Ok(self.market.liquidate_position(account).estimate_gas().await?)
    }
}

/// Build a write-capable contract handle over a signer-pool lease. Cheap:
/// just wraps the `Arc<SignerClient>` the lease already holds, no new
/// connection.
fn writer(contract_address: Address, client: Arc<SignerClient>) -> PerpsV2MarketAbi<SignerClient> {
    PerpsV2MarketAbi::new(contract_address, client)
}

pub async fn submit_execute_delayed_order(
    contract_address: Address,
    client: Arc<SignerClient>,
    account: Address,
    gas_limit: U256,
    nonce: U256,
) -> Result<TxHash> {
    let pending = writer(contract_address, client)
        .execute_delayed_order(account)
        .gas(gas_limit)
        .nonce(nonce)
        .send()
        .await?;
    Ok(pending.tx_hash())
}

pub async fn submit_execute_offchain_delayed_order(
    contract_address: Address,
    client: Arc<SignerClient>,
    account: Address,
    price_update_data: Vec<Vec<u8>>,
    value: U256,
    gas_limit: U256,
    nonce: U256,
) -> Result<TxHash> {
    let data: Vec<ethers::types::Bytes> = price_update_data.into_iter().map(Into::into).collect();
    let pending = writer(contract_address, client)
        .execute_offchain_delayed_order(account, data)
        .value(value)
        .gas(gas_limit)
        .nonce(nonce)
        .send()
        .await?;
    Ok(pending.tx_hash())
}

pub async fn submit_flag_position(
    contract_address: Address,
    client: Arc<SignerClient>,
    account: Address,
    gas_limit: U256,
    gas_price: U256,
    nonce: U256,
) -> Result<TxHash> {
    let pending = writer(contract_address, client)
        .flag_position(account)
        .gas(gas_limit)
        .gas_price(gas_price)
        .nonce(nonce)
        .send()
        .await?;
    Ok(pending.tx_hash())
}

pub async fn submit_liquidate_position(
    contract_address: Address,
    client: Arc<SignerClient>,
    account: Address,
    gas_limit: U256,
    gas_price: U256,
    nonce: U256,
) -> Result<TxHash> {
    let pending = writer(contract_address, client)
        .liquidate_position(account)
        .gas(gas_limit)
        .gas_price(gas_price)
        .nonce(nonce)
        .send()
        .await?;
    Ok(pending.tx_hash())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn currency_key_bytes32_pads_and_truncates() {
        let out = currency_key_bytes32("sETH");
        assert_eq!(&out[..4], b"sETH");
        assert!(out[4..].iter().all(|&b| b == 0));

        let long = "a".repeat(40);
        let out = currency_key_bytes32(&long);
        assert_eq!(out.len(), 32);
    }
}
