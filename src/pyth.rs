//! Pyth price-update client (C7, spec §4.6, §6.3): fetch a signed VAA for a
//! market's price-feed id and the on-chain update fee for it.
//!
//! Grounded on `signet-filler`'s `reqwest` dependency for the HTTP client
//! choice; the on-chain `getUpdateFee` call follows the teacher's
//! `abigen!`-minimal-ABI idiom.

use async_trait::async_trait;
use base64::Engine;
use ethers::contract::abigen;
use ethers::middleware::Middleware;
use ethers::types::{Address, U256};
use eyre::{eyre, Result};
use std::sync::Arc;

abigen!(
    PythAbi,
    r#"[
        function getUpdateFee(bytes[] updateData) view returns (uint256 feeAmount)
    ]"#
);

#[async_trait]
pub trait PythClient: Send + Sync {
    /// Fetch signed price-update payloads for a single feed id, as they'd
    /// be passed verbatim to `executeOffchainDelayedOrder`.
    async fn fetch_update_data(&self, price_feed_id: &str) -> Result<Vec<Vec<u8>>>;
    async fn update_fee(&self, update_data: &[Vec<u8>]) -> Result<U256>;
}

pub struct HttpPythClient<M: Middleware> {
    price_server: String,
    http: reqwest::Client,
    pyth: PythAbi<M>,
}

impl<M: Middleware + 'static> HttpPythClient<M> {
    pub fn new(price_server: String, pyth_contract: Address, client: Arc<M>) -> Self {
        Self {
            price_server,
            http: reqwest::Client::new(),
            pyth: PythAbi::new(pyth_contract, client),
        }
    }
}

#[derive(serde::Deserialize)]
struct LatestVaasEntry {
    vaa: String,
}

#[async_trait]
impl<M: Middleware + 'static> PythClient for HttpPythClient<M> {
    async fn fetch_update_data(&self, price_feed_id: &str) -> Result<Vec<Vec<u8>>> {
        let url = format!(
            "{}/api/latest_vaas?ids[]={}",
            self.price_server.trim_end_matches('/'),
            price_feed_id
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| eyre!("pyth price server request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(eyre!(
                "pyth price server returned status {}",
                resp.status()
            ));
        }

        // The endpoint may return either bare base64 strings or objects
        // carrying a `vaa` field depending on price-server version; accept
        // both.
        let raw: Vec<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| eyre!("failed to parse pyth response: {e}"))?;

        raw.into_iter()
            .map(|v| {
                let b64 = match v {
                    serde_json::Value::String(s) => s,
                    other => serde_json::from_value::<LatestVaasEntry>(other)
                        .map_err(|e| eyre!("unexpected pyth response shape: {e}"))?
                        .vaa,
                };
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| eyre!("invalid base64 in pyth response: {e}"))
            })
            .collect()
    }

    async fn update_fee(&self, update_data: &[Vec<u8>]) -> Result<U256> {
        let data: Vec<ethers::types::Bytes> =
            update_data.iter().cloned().map(Into::into).collect();
        Ok(self.pyth.get_update_fee(data).call().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_base64_value() {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode("aGVsbG8=")
            .unwrap();
        assert_eq!(decoded, b"hello".to_vec());
    }

    #[test]
    fn rejects_bad_base64_input() {
        assert!(base64::engine::general_purpose::STANDARD
            .decode("not valid base64!!")
            .is_err());
    }
}
