//! Error taxonomy shared across the keeper (spec §7).
//!
//! Typed variants exist so per-item call sites can match on failure class
//! (e.g. to decide whether a failure should count against
//! `executionFailures`); `eyre::Report` remains the top-level error type at
//! the process boundary, matching the teacher's `eyre`-first style.

use ethers::types::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeeperError {
    /// Transient RPC failure (timeout, rate limit, 5xx) whose retry budget
    /// has been exhausted inside the `ChainClient`.
    #[error("transient RPC error: {0}")]
    Transient(String),

    /// On-chain state had already moved on by the time we acted on it
    /// (order already executed, position already flagged). Not a failure:
    /// callers should drop the item and count an "already done" metric
    /// rather than bumping `executionFailures`.
    #[error("stale state: {0}")]
    StaleState(String),

    /// A submitted transaction reverted or timed out waiting for a receipt.
    #[error("execution failed for {account:?}: {reason}")]
    ExecutionFailed { account: Address, reason: String },

    /// No signer became idle within the caller's deadline.
    #[error("signer pool exhausted: no signer available within deadline")]
    PoolExhaustedTimeout,

    /// Missing config, bad mnemonic, unreachable RPC at boot. Always fatal.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl KeeperError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeeperError::Fatal(_))
    }
}

/// Scanning a block range either returns the full ordered event set or
/// fails wholesale; partial results are never surfaced (spec §4.2).
#[derive(Debug, Error)]
#[error("event scan failed for blocks {from}..={to}: {source}")]
pub struct EventScanFailed {
    pub from: u64,
    pub to: u64,
    #[source]
    pub source: eyre::Report,
}
