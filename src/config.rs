//! Environment/config loading (spec §6, SPEC_FULL §6.1).
//!
//! Mirrors the teacher's `KeeperConfig::from_cli_and_deployment`: direct
//! `std::env::var` reads, eager validation with descriptive errors, no
//! config-file layer beyond the per-market JSON artifact.

use crate::market::MarketConfig;
use ethers::types::Address;
use eyre::{eyre, Result, WrapErr};
use std::{fs, path::PathBuf, str::FromStr, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Optimism,
    OptimismGoerli,
}

impl FromStr for Network {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "optimism" => Ok(Network::Optimism),
            "optimism-goerli" => Ok(Network::OptimismGoerli),
            other => Err(eyre!(
                "unknown NETWORK '{other}'; expected 'optimism' or 'optimism-goerli'"
            )),
        }
    }
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Optimism => "optimism",
            Network::OptimismGoerli => "optimism-goerli",
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeeperConfig {
    pub network: Network,
    pub rpc_url: String,
    pub mnemonic: String,
    pub signer_pool_size: usize,
    pub from_block: u64,
    pub process_interval: Duration,
    pub max_order_exec_attempts: u32,
    pub pyth_price_server: String,
    pub metrics_enabled: bool,
    pub log_level: String,

    pub max_event_block_range: u64,
    pub max_backlog: u64,
    pub max_batch_size: usize,
    pub batch_wait_time: Duration,
    pub shutdown_grace: Duration,
    pub liquidation_proximity_threshold: f64,
    pub far_price_recency_cutoff: Duration,
    pub max_far_prices_to_update: usize,
    pub multicall3_address: Option<Address>,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    /// Hard deadline on `SignerPool::with_signer`'s FIFO wait (spec §4.1
    /// "Waiters must be cancellable"), mirroring the teacher's
    /// `tx_timeout_seconds` knob but scoped to acquiring the lease, not the
    /// confirmation wait it spans.
    pub signer_lease_deadline: Duration,
    /// Hard deadline on `wait_tx`'s confirmation poll, the direct analogue
    /// of the teacher's `tx_timeout_seconds` CLI flag.
    pub tx_confirm_timeout: Duration,

    /// Synthetix `ExchangeRates` oracle, shared by every configured market
    /// (`getCurrentRoundId`, spec §6.3).
    pub exchange_rates_address: Address,
    /// Pyth contract used for `getUpdateFee` (spec §6.3); required only if
    /// at least one market declares a `price_feed_id` (C7).
    pub pyth_contract_address: Option<Address>,

    pub markets: Vec<MarketConfig>,
}

fn env_var(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| eyre!("missing required environment variable {name}"))
}

fn env_var_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_var_opt(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| eyre!("invalid {name} '{raw}': {e}")),
    }
}

impl KeeperConfig {
    pub fn from_env() -> Result<Self> {
        let network: Network = env_var("NETWORK")?.parse()?;

        let rpc_url = resolve_rpc_url(network)?;

        let mnemonic = env_var("ETH_HDWALLET_MNEMONIC")?;
        if mnemonic.split_whitespace().count() < 12 {
            return Err(eyre!(
                "ETH_HDWALLET_MNEMONIC does not look like a valid BIP-39 mnemonic (too few words)"
            ));
        }

        let signer_pool_size: usize = env_parse("SIGNER_POOL_SIZE", 1usize)?;
        if signer_pool_size == 0 {
            return Err(eyre!("SIGNER_POOL_SIZE must be >= 1"));
        }

        let from_block: u64 = env_parse("FROM_BLOCK", 0u64)?;

        let process_interval_ms: u64 = env_parse("DISTRIBUTOR_PROCESS_INTERVAL", 15_000u64)?;
        if process_interval_ms == 0 {
            return Err(eyre!("DISTRIBUTOR_PROCESS_INTERVAL must be > 0"));
        }

        let max_order_exec_attempts: u32 = env_parse("MAX_ORDER_EXEC_ATTEMPTS", 10u32)?;

        let pyth_price_server = env_var("PYTH_PRICE_SERVER")?;

        let metrics_enabled = match env_var_opt("METRICS_ENABLED").as_deref() {
            None | Some("0") => false,
            Some("1") => true,
            Some(other) => {
                return Err(eyre!("METRICS_ENABLED must be '0' or '1', got '{other}'"))
            }
        };

        let log_level = env_var_opt("LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        if !["debug", "info", "warn", "error"].contains(&log_level.as_str()) {
            return Err(eyre!(
                "LOG_LEVEL must be one of debug/info/warn/error, got '{log_level}'"
            ));
        }

        let max_event_block_range: u64 = env_parse("MAX_EVENT_BLOCK_RANGE", 50_000u64)?;
        if max_event_block_range == 0 {
            return Err(eyre!("MAX_EVENT_BLOCK_RANGE must be > 0"));
        }

        let max_backlog: u64 = env_parse("MAX_BACKLOG", 100_000u64)?;

        let max_batch_size: usize = env_parse("MAX_BATCH_SIZE", 10usize)?;
        if max_batch_size == 0 {
            return Err(eyre!("MAX_BATCH_SIZE must be > 0"));
        }

        let batch_wait_time_ms: u64 = env_parse("BATCH_WAIT_TIME_MS", 2_000u64)?;

        let shutdown_grace_seconds: u64 = env_parse("SHUTDOWN_GRACE_SECONDS", 30u64)?;

        let liquidation_proximity_threshold: f64 =
            env_parse("LIQUIDATION_PROXIMITY_THRESHOLD", 0.05f64)?;

        let far_price_recency_cutoff_seconds: u64 =
            env_parse("LIQUIDATION_FAR_PRICE_RECENCY_CUTOFF_SECONDS", 6 * 3600u64)?;

        let max_far_prices_to_update: usize = env_parse("MAX_FAR_PRICES_TO_UPDATE", 1usize)?;

        let multicall3_address = match env_var_opt("MULTICALL3_ADDRESS") {
            None => None,
            Some(raw) => Some(
                Address::from_str(&raw)
                    .map_err(|e| eyre!("invalid MULTICALL3_ADDRESS '{raw}': {e}"))?,
            ),
        };

        let telegram_bot_token = env_var_opt("TELEGRAM_BOT_TOKEN");
        let telegram_chat_id = env_var_opt("TELEGRAM_CHAT_ID");

        let signer_lease_deadline_seconds: u64 =
            env_parse("SIGNER_LEASE_DEADLINE_SECONDS", 60u64)?;
        let tx_confirm_timeout_seconds: u64 = env_parse("TX_CONFIRM_TIMEOUT_SECONDS", 120u64)?;

        let markets_config_file: PathBuf = env_var("MARKETS_CONFIG_FILE")?.into();
        let markets = load_markets(&markets_config_file)?;
        if markets.is_empty() {
            return Err(eyre!(
                "{} declares no markets; the keeper has nothing to do",
                markets_config_file.display()
            ));
        }

        let exchange_rates_address = Address::from_str(&env_var("EXCHANGE_RATES_ADDRESS")?)
            .map_err(|e| eyre!("invalid EXCHANGE_RATES_ADDRESS: {e}"))?;

        let pyth_contract_address = match env_var_opt("PYTH_CONTRACT_ADDRESS") {
            None => None,
            Some(raw) => Some(
                Address::from_str(&raw)
                    .map_err(|e| eyre!("invalid PYTH_CONTRACT_ADDRESS '{raw}': {e}"))?,
            ),
        };
        if markets.iter().any(|m| m.price_feed_id.is_some()) && pyth_contract_address.is_none() {
            return Err(eyre!(
                "PYTH_CONTRACT_ADDRESS is required: at least one market declares a price_feed_id"
            ));
        }

        Ok(Self {
            network,
            rpc_url,
            mnemonic,
            signer_pool_size,
            from_block,
            process_interval: Duration::from_millis(process_interval_ms),
            max_order_exec_attempts,
            pyth_price_server,
            metrics_enabled,
            log_level,
            max_event_block_range,
            max_backlog,
            max_batch_size,
            batch_wait_time: Duration::from_millis(batch_wait_time_ms),
            shutdown_grace: Duration::from_secs(shutdown_grace_seconds.max(1)),
            liquidation_proximity_threshold,
            far_price_recency_cutoff: Duration::from_secs(far_price_recency_cutoff_seconds),
            max_far_prices_to_update,
            multicall3_address,
            telegram_bot_token,
            telegram_chat_id,
            signer_lease_deadline: Duration::from_secs(signer_lease_deadline_seconds.max(1)),
            tx_confirm_timeout: Duration::from_secs(tx_confirm_timeout_seconds.max(1)),
            exchange_rates_address,
            pyth_contract_address,
            markets,
        })
    }
}

fn resolve_rpc_url(network: Network) -> Result<String> {
    if let Some(url) = env_var_opt("RPC_URL") {
        return Ok(url);
    }

    if let Some(key) = env_var_opt("PROVIDER_API_KEY_ALCHEMY") {
        let subdomain = match network {
            Network::Optimism => "opt-mainnet",
            Network::OptimismGoerli => "opt-goerli",
        };
        return Ok(format!("https://{subdomain}.g.alchemy.com/v2/{key}"));
    }

    if let Some(key) = env_var_opt("PROVIDER_API_KEY_INFURA") {
        let subdomain = match network {
            Network::Optimism => "optimism-mainnet",
            Network::OptimismGoerli => "optimism-goerli",
        };
        return Ok(format!("https://{subdomain}.infura.io/v3/{key}"));
    }

    Err(eyre!(
        "no RPC provider configured: set PROVIDER_API_KEY_INFURA or PROVIDER_API_KEY_ALCHEMY (or RPC_URL directly)"
    ))
}

fn load_markets(path: &PathBuf) -> Result<Vec<MarketConfig>> {
    let raw = fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read markets config {}", path.display()))?;
    serde_json::from_str(&raw)
        .wrap_err_with(|| format!("failed to parse markets config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_parses_known_values() {
        assert_eq!("optimism".parse::<Network>().unwrap(), Network::Optimism);
        assert_eq!(
            "optimism-goerli".parse::<Network>().unwrap(),
            Network::OptimismGoerli
        );
        assert!("mainnet".parse::<Network>().is_err());
    }

    #[test]
    fn resolve_rpc_url_prefers_explicit_override() {
        std::env::set_var("RPC_URL", "https://example.invalid/rpc");
        std::env::remove_var("PROVIDER_API_KEY_ALCHEMY");
        std::env::remove_var("PROVIDER_API_KEY_INFURA");
        let url = resolve_rpc_url(Network::Optimism).unwrap();
        assert_eq!(url, "https://example.invalid/rpc");
        std::env::remove_var("RPC_URL");
    }
}
