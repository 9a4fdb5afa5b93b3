mod chain;
mod config;
mod distributor;
mod error;
mod events;
mod keeper;
mod market;
mod metrics;
mod mnemonic;
mod multicall;
mod notifier;
mod pyth;
mod signer_pool;

use chain::EthersChainClient;
use clap::{Parser, Subcommand};
use config::KeeperConfig;
use distributor::{Distributor, KeeperRegistration};
use ethers::providers::{Http, Middleware, Provider};
use eyre::{eyre, Result};
use keeper::delayed_orders::DelayedOrdersKeeper;
use keeper::liquidation::LiquidationKeeper;
use keeper::offchain_delayed_orders::OffchainDelayedOrdersKeeper;
use keeper::Keeper;
use market::{EthersMarketContract, MarketContract};
use multicall::Multicall3;
use notifier::{NoopNotifier, Notifier, TelegramNotifier};
use pyth::{HttpPythClient, PythClient};
use signer_pool::SignerPool;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A single-process PerpsV2 keeper: indexes delayed orders and positions
/// from chain events and submits execution/liquidation transactions.
#[derive(Parser, Debug)]
#[command(name = "perpsv2-keeper", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override the RPC URL derived from config/env (spec §6.2 "flags only
    /// ever override the env-derived config").
    #[arg(long)]
    rpc_url: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the keeper until terminated (the default when no subcommand is given).
    Run,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start tokio runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(run(args))
}

async fn run(args: Args) -> ExitCode {
    // `run` is the only subcommand; absence of one is equivalent to it
    // (spec §6.2).
    let Command::Run = args.command.unwrap_or(Command::Run);

    let mut cfg = match KeeperConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("fatal startup error: {e:#}");
            return ExitCode::from(1);
        }
    };
    if let Some(rpc_url) = args.rpc_url {
        cfg.rpc_url = rpc_url;
    }

    init_tracing(&cfg.log_level);

    if let Err(e) = metrics::install(cfg.network.as_str(), cfg.metrics_enabled) {
        eprintln!("fatal startup error: {e:#}");
        return ExitCode::from(1);
    }

    match start(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_startup => {
            eprintln!("fatal startup error: {:#}", e.report);
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!(error = %e.report, "unrecoverable runtime error");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wraps a startup-vs-runtime distinction around `eyre::Report` so `main`
/// can map each to its own exit code (spec §6.2, §7).
struct RunError {
    report: eyre::Report,
    is_startup: bool,
}

impl From<eyre::Report> for RunError {
    fn from(report: eyre::Report) -> Self {
        Self {
            report,
            is_startup: true,
        }
    }
}

async fn start(cfg: KeeperConfig) -> Result<(), RunError> {
    let provider = Provider::<Http>::try_from(cfg.rpc_url.as_str())
        .map_err(|e| eyre!("invalid RPC_URL '{}': {e}", cfg.rpc_url))?
        .interval(Duration::from_millis(800));
    let read_client = Arc::new(provider.clone());

    let chain_id = read_client
        .get_chainid()
        .await
        .map_err(|e| eyre!("failed to reach RPC at {}: {e}", cfg.rpc_url))?
        .as_u64();

    let wallets = mnemonic::derive_signers(&cfg.mnemonic, cfg.signer_pool_size, chain_id)
        .map_err(|e| eyre!("failed to derive signers from ETH_HDWALLET_MNEMONIC: {e}"))?;
    let signer_pool = Arc::new(SignerPool::new(provider.clone(), wallets, 0));
    ::metrics::gauge!(metrics::SIGNER_POOL_SIZE).set(signer_pool.size() as f64);

    let notifier: Arc<dyn Notifier> = match (&cfg.telegram_bot_token, &cfg.telegram_chat_id) {
        (Some(token), Some(chat_id)) => {
            Arc::new(TelegramNotifier::new(token.clone(), chat_id.clone()))
        }
        _ => Arc::new(NoopNotifier),
    };

    let multicall = match cfg.multicall3_address {
        Some(addr) => Some(Arc::new(Multicall3::new(addr, read_client.clone()))),
        None => None,
    };

    let chain: Arc<dyn chain::ChainClient> =
        Arc::new(EthersChainClient::new(read_client.clone()));

    let mut entries = Vec::new();

    for market_cfg in &cfg.markets {
        let code = read_client
            .get_code(market_cfg.contract, None)
            .await
            .map_err(|e| eyre!("failed to read code at market {}: {e}", market_cfg.key))?;
        if code.0.is_empty() {
            return Err(RunError::from(eyre!(
                "no contract code found at market '{}' address {:?}; check MARKETS_CONFIG_FILE",
                market_cfg.key,
                market_cfg.contract
            )));
        }

        let market: Arc<dyn MarketContract> = Arc::new(EthersMarketContract::new(
            market_cfg.contract,
            cfg.exchange_rates_address,
            read_client.clone(),
        ));

        let delayed_orders = DelayedOrdersKeeper::new(
            format!("{}-delayed-orders", market_cfg.key),
            market_cfg.asset.clone(),
            market_cfg.contract,
            market.clone(),
            signer_pool.clone(),
            notifier.clone(),
            cfg.max_order_exec_attempts,
            cfg.max_batch_size,
            cfg.batch_wait_time,
            cfg.signer_lease_deadline,
            cfg.tx_confirm_timeout,
        );
        entries.push(KeeperRegistration {
            id: format!("{}-delayed-orders", market_cfg.key),
            keeper: Arc::new(delayed_orders) as Arc<dyn Keeper>,
            contract: market_cfg.contract,
            price_source: None,
        });

        if let Some(price_feed_id) = &market_cfg.price_feed_id {
            let pyth_contract_address = cfg.pyth_contract_address.ok_or_else(|| {
                eyre!(
                    "market '{}' declares a price_feed_id but PYTH_CONTRACT_ADDRESS is unset",
                    market_cfg.key
                )
            })?;
            let pyth: Arc<dyn PythClient> = Arc::new(HttpPythClient::new(
                cfg.pyth_price_server.clone(),
                pyth_contract_address,
                read_client.clone(),
            ));

            let offchain_orders = OffchainDelayedOrdersKeeper::new(
                format!("{}-offchain-delayed-orders", market_cfg.key),
                market_cfg.asset.clone(),
                market_cfg.contract,
                price_feed_id.clone(),
                market.clone(),
                pyth,
                signer_pool.clone(),
                notifier.clone(),
                cfg.max_order_exec_attempts,
                cfg.max_batch_size,
                cfg.batch_wait_time,
                cfg.signer_lease_deadline,
                cfg.tx_confirm_timeout,
            );
            entries.push(KeeperRegistration {
                id: format!("{}-offchain-delayed-orders", market_cfg.key),
                keeper: Arc::new(offchain_orders) as Arc<dyn Keeper>,
                contract: market_cfg.contract,
                price_source: None,
            });
        }

        let liquidation = LiquidationKeeper::new(
            format!("{}-liquidation", market_cfg.key),
            market_cfg.asset.clone(),
            market_cfg.contract,
            market.clone(),
            chain.clone(),
            signer_pool.clone(),
            cfg.max_batch_size,
            cfg.batch_wait_time,
            cfg.signer_lease_deadline,
            cfg.tx_confirm_timeout,
            cfg.liquidation_proximity_threshold,
            cfg.far_price_recency_cutoff.as_secs(),
            cfg.max_far_prices_to_update,
            multicall.clone(),
        );
        entries.push(KeeperRegistration {
            id: format!("{}-liquidation", market_cfg.key),
            keeper: Arc::new(liquidation) as Arc<dyn Keeper>,
            contract: market_cfg.contract,
            price_source: Some(market.clone()),
        });
    }

    ::metrics::counter!(metrics::KEEPER_START_UP).increment(1);

    tracing::info!(
        network = cfg.network.as_str(),
        chain_id,
        signer_pool_size = signer_pool.size(),
        markets = cfg.markets.len(),
        keepers = entries.len(),
        "keeper starting"
    );

    let signer_addresses = signer_pool.addresses();
    let uptime_chain = chain.clone();
    let uptime_interval = cfg.process_interval;
    tokio::spawn(async move {
        report_uptime_and_balances(uptime_chain, signer_addresses, uptime_interval).await;
    });

    let distributor = Distributor::new(
        chain,
        entries,
        cfg.from_block,
        cfg.max_event_block_range,
        cfg.max_backlog,
        cfg.process_interval,
        cfg.shutdown_grace,
    );

    distributor
        .hydrate()
        .await
        .map_err(|e| eyre!("hydration failed: {e}"))?;

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received");
        shutdown_signal.cancel();
    });

    distributor.run(shutdown).await.map_err(|report| RunError {
        report,
        is_startup: false,
    })?;

    Ok(())
}

/// Background reporter for the two ambient gauges the Distributor's tick
/// loop has no natural place for: `KeeperUpTime` (seconds since process
/// start) and `KeeperSignerEthBalance` (per-signer, so an operator can
/// alert on a signer running low before it starts failing to submit
/// transactions). Runs on its own cadence, independent of tick outcome.
async fn report_uptime_and_balances(
    chain: Arc<dyn chain::ChainClient>,
    signer_addresses: Vec<ethers::types::Address>,
    interval: Duration,
) {
    let start = std::time::Instant::now();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        ::metrics::gauge!(metrics::KEEPER_UP_TIME).set(start.elapsed().as_secs_f64());

        for address in &signer_addresses {
            match chain.balance(*address).await {
                Ok(balance) => {
                    let eth = market::u256_to_f64(balance) / 1e18;
                    ::metrics::gauge!(
                        metrics::SIGNER_ETH_BALANCE,
                        "signer" => format!("{address:#x}")
                    )
                    .set(eth);
                }
                Err(err) => {
                    tracing::warn!(?address, error = %err, "failed to read signer balance");
                }
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
