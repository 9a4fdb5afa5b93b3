//! Multicall3 fast path (C8, spec §4.7): dry-run a batch of `flagPosition`
//! calls via `aggregate3(allowFailure=true)` to cheaply discover which
//! positions the market contract will actually accept, then submit a
//! single batched transaction with only those. Pagination size 20.
//!
//! Multicall3's ABI is a canonical, publicly known interface; declared
//! inline the same way the teacher inlines `OpenSub`'s ABI in `opensub.rs`.

use ethers::abi::AbiEncode;
use ethers::contract::abigen;
use ethers::middleware::Middleware;
use ethers::types::{Address, Bytes, TxHash, U256};
use eyre::Result;
use std::sync::Arc;

pub const PAGE_SIZE: usize = 20;

abigen!(
    Multicall3Abi,
    r#"[
        struct Call3 { address target; bool allowFailure; bytes callData; }
        struct Multicall3Result { bool success; bytes returnData; }
        function aggregate3(Call3[] calls) payable returns (Multicall3Result[] returnData)
    ]"#
);

#[derive(Debug, Clone)]
pub struct Call {
    pub target: Address,
    pub call_data: Bytes,
}

pub struct Multicall3<M: Middleware> {
    contract: Multicall3Abi<M>,
}

impl<M: Middleware + 'static> Multicall3<M> {
    pub fn new(address: Address, client: Arc<M>) -> Self {
        Self {
            contract: Multicall3Abi::new(address, client),
        }
    }

    /// Dry-run `calls` (each wrapped `allowFailure = true`) and return the
    /// indices that would succeed, without spending gas.
    pub async fn dry_run(&self, calls: &[Call]) -> Result<Vec<bool>> {
        let mut out = Vec::with_capacity(calls.len());
        for page in calls.chunks(PAGE_SIZE) {
            let entries: Vec<Call3> = page
                .iter()
                .map(|c| Call3 {
                    target: c.target,
                    allow_failure: true,
                    call_data: c.call_data.clone(),
                })
                .collect();

            let results = self.contract.aggregate3(entries).call().await?;
            out.extend(results.into_iter().map(|r| r.success));
        }
        Ok(out)
    }

    /// Estimate gas for one page of `calls` (used to size the real
    /// submission's gas limit before `submit`).
    pub async fn estimate_gas(&self, calls: &[Call]) -> Result<U256> {
        let entries: Vec<Call3> = calls
            .iter()
            .map(|c| Call3 {
                target: c.target,
                allow_failure: true,
                call_data: c.call_data.clone(),
            })
            .collect();
        Ok(self.contract.aggregate3(entries).estimate_gas().await?)
    }

    /// Submit only the calls that passed the dry run, paginated. `nonce` is
    /// the first page's nonce; later pages (when `calls` spans more than one
    /// page) use `nonce + page index` so a multi-page batch submitted under
    /// one signer lease still issues gap-free nonces.
    pub async fn submit(
        &self,
        calls: &[Call],
        gas_limit: U256,
        gas_price: U256,
        nonce: U256,
    ) -> Result<Vec<TxHash>> {
        let mut hashes = Vec::new();
        for (page_index, page) in calls.chunks(PAGE_SIZE).enumerate() {
            let entries: Vec<Call3> = page
                .iter()
                .map(|c| Call3 {
                    target: c.target,
                    allow_failure: true,
                    call_data: c.call_data.clone(),
                })
                .collect();

            let pending = self
                .contract
                .aggregate3(entries)
                .gas(gas_limit)
                .gas_price(gas_price)
                .nonce(nonce + U256::from(page_index as u64))
                .send()
                .await?;
            hashes.push(pending.tx_hash());
        }
        Ok(hashes)
    }
}

/// Encode a zero-argument contract call (`flagPosition(account)` /
/// `liquidatePosition(account)`) as Multicall3 `callData`.
pub fn encode_address_call(selector: [u8; 4], account: Address) -> Bytes {
    let mut data = selector.to_vec();
    data.extend_from_slice(&account.encode());
    data.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_address_call_prefixes_selector() {
        let selector = [0x01, 0x02, 0x03, 0x04];
        let account = Address::repeat_byte(0xAB);
        let encoded = encode_address_call(selector, account);
        assert_eq!(&encoded[..4], &selector);
        assert_eq!(encoded.len(), 4 + 32);
    }
}
