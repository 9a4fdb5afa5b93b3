//! Metrics facade (spec §6 "Metrics emitted", SPEC_FULL §6.4).
//!
//! The keeper only ever calls the `metrics` crate's `counter!`/`gauge!`
//! macros; if `METRICS_ENABLED=1` a Prometheus exporter is installed once
//! at startup, otherwise the calls are inert (the crate's default when no
//! recorder is installed). The `network` label is attached once here, at
//! install time, rather than threaded through every call site, as
//! "PerpsV2Keeper/<Network>".
use eyre::{eyre, Result};
use metrics_exporter_prometheus::PrometheusBuilder;

pub fn install(network: &str, enabled: bool) -> Result<()> {
    if !enabled {
        return Ok(());
    }

    let builder = PrometheusBuilder::new()
        .add_global_label("namespace", format!("PerpsV2Keeper/{network}"));

    builder
        .install()
        .map_err(|e| eyre!("failed to install prometheus metrics exporter: {e}"))
}

pub const KEEPER_UP_TIME: &str = "perpsv2_keeper_up_time";
pub const SIGNER_ETH_BALANCE: &str = "perpsv2_keeper_signer_eth_balance";
pub const KEEPER_START_UP: &str = "perpsv2_keeper_start_up";
pub const KEEPER_ERROR: &str = "perpsv2_keeper_error";
pub const DISTRIBUTOR_BLOCK_DELTA: &str = "perpsv2_keeper_distributor_block_delta";
pub const DISTRIBUTOR_BLOCK_PROCESS_TIME_MS: &str =
    "perpsv2_keeper_distributor_block_process_time_ms";
pub const DELAYED_ORDER_EXECUTED: &str = "perpsv2_keeper_delayed_order_executed";
pub const DELAYED_ORDER_ALREADY_EXECUTED: &str = "perpsv2_keeper_delayed_order_already_executed";
pub const OFFCHAIN_ORDER_EXECUTED: &str = "perpsv2_keeper_offchain_order_executed";
pub const POSITION_LIQUIDATED: &str = "perpsv2_keeper_position_liquidated";
pub const SIGNER_POOL_SIZE: &str = "perpsv2_keeper_signer_pool_size";
