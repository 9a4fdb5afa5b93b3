//! `ChainClient`: the abstract block/event/read primitive set the rest of
//! the keeper is built against. One implementation wraps an `ethers`
//! `Middleware` over the usual provider stack
//! (`Provider<Http>` + `SignerMiddleware` + `NonceManagerMiddleware`).

use async_trait::async_trait;
use ethers::providers::Middleware;
use ethers::types::{Address, BlockNumber, Filter, H256, U256};
use eyre::Result;
use std::sync::Arc;

/// A single decoded-free chain log; keepers/EventSource decode `data`
/// according to the event kind.
#[derive(Debug, Clone)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub log_index: u64,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    async fn block_timestamp(&self, block_number: u64) -> Result<u64>;
    async fn gas_price(&self) -> Result<U256>;
    async fn balance(&self, address: Address) -> Result<U256>;
    async fn get_logs(
        &self,
        address: Address,
        topics: &[H256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>>;
}

pub struct EthersChainClient<M: Middleware> {
    inner: Arc<M>,
}

impl<M: Middleware> EthersChainClient<M> {
    pub fn new(inner: Arc<M>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainClient for EthersChainClient<M> {
    async fn block_number(&self) -> Result<u64> {
        Ok(self
            .inner
            .get_block_number()
            .await
            .map_err(|e| eyre::eyre!("get_block_number failed: {e}"))?
            .as_u64())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<u64> {
        let block = self
            .inner
            .get_block(block_number)
            .await
            .map_err(|e| eyre::eyre!("get_block({block_number}) failed: {e}"))?
            .ok_or_else(|| eyre::eyre!("block {block_number} not found"))?;
        Ok(block.timestamp.as_u64())
    }

    async fn gas_price(&self) -> Result<U256> {
        self.inner
            .get_gas_price()
            .await
            .map_err(|e| eyre::eyre!("get_gas_price failed: {e}"))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.inner
            .get_balance(address, None)
            .await
            .map_err(|e| eyre::eyre!("get_balance({address:?}) failed: {e}"))
    }

    async fn get_logs(
        &self,
        address: Address,
        topics: &[H256],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>> {
        let mut filter = Filter::new()
            .address(address)
            .from_block(BlockNumber::Number(from_block.into()))
            .to_block(BlockNumber::Number(to_block.into()));
        if !topics.is_empty() {
            filter = filter.topic0(topics.to_vec());
        }

        let logs = self
            .inner
            .get_logs(&filter)
            .await
            .map_err(|e| eyre::eyre!("get_logs({from_block}..={to_block}) failed: {e}"))?;

        Ok(logs
            .into_iter()
            .map(|log| RawLog {
                address: log.address,
                topics: log.topics,
                data: log.data.to_vec(),
                block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(to_block),
                log_index: log.log_index.map(|i| i.as_u64()).unwrap_or(0),
            })
            .collect())
    }
}
