//! Error taxonomy for the detection core.
//!
//! Two layers: `RpcError` for everything that crosses the ChainClient
//! boundary (transient vs permanent decides retry behavior), and `CoreError`
//! for the rest of the pipeline. Detectors never return errors upward — they
//! log and emit partial results — so `CoreError` mostly surfaces at startup
//! (config) and in per-chain status counters.

use std::time::Duration;
use thiserror::Error;

/// Errors crossing the ChainClient boundary.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Timeout, WS drop, 5xx — retried with backoff by the RPC pool.
    #[error("transient rpc failure: {0}")]
    Transient(String),

    /// Chain-reverted view call or malformed response — no retry.
    #[error("permanent rpc failure: {0}")]
    Permanent(String),

    /// Per-call deadline exceeded (default 5s).
    #[error("rpc deadline exceeded after {0:?}")]
    Deadline(Duration),

    /// Every configured endpoint is unhealthy.
    #[error("all endpoints unhealthy on chain {chain_id}")]
    AllDown { chain_id: u64 },

    /// Subscription stream ended or was dropped by the remote.
    #[error("subscription closed: {0}")]
    SubscriptionClosed(String),
}

impl RpcError {
    /// Transient errors are retried against the next healthy endpoint;
    /// permanent errors return immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::Transient(_) | RpcError::Deadline(_) | RpcError::SubscriptionClosed(_)
        )
    }
}

/// Pipeline-level errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Invalid configuration. The only fatal error class: detected at
    /// startup, the process refuses to start.
    #[error("config error: {0}")]
    Config(String),

    /// Log payload did not match the expected ABI layout. The log is
    /// dropped and a counter incremented.
    #[error("decode error: {0}")]
    Decode(String),

    /// A bounded resource (e.g. the subscription set) is full.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// 256-bit intermediate exceeded the safe float range; the price
    /// calculator fell back to reduced-precision ratio math.
    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    /// A detector exceeded its per-block wall-clock budget. The partial
    /// result set is accepted.
    #[error("block budget exceeded after {elapsed:?} in {detector}")]
    BudgetExceeded {
        detector: &'static str,
        elapsed: Duration,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;
