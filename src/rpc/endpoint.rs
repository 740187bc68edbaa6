//! Per-endpoint health records.
//!
//! Counters are plain atomics: `call` paths update them without any
//! critical section, and health reads are tear-tolerant (a stale read just
//! shifts one selection decision).

use crate::config::EndpointKind;
use crate::rpc::client::ChainClient;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Failures in a row before an endpoint is considered unhealthy.
const UNHEALTHY_FAILURE_STREAK: u32 = 3;

/// No success for this long also marks an endpoint unhealthy.
const UNHEALTHY_IDLE: Duration = Duration::from_secs(60);

/// An unhealthy endpoint becomes probeable again after this long, so the
/// pool can discover recovery without a side channel.
const PROBE_BACKOFF: Duration = Duration::from_secs(5);

/// EMA smoothing factor numerator out of 8 (new sample weight 1/8).
const LATENCY_EMA_SHIFT: u64 = 3;

/// Process-wide monotonic epoch for atomic timestamp storage.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn now_ms() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Rolling health record: consecutive failures, last success, latency EMA.
#[derive(Debug)]
pub struct EndpointHealth {
    consecutive_failures: AtomicU32,
    last_success_ms: AtomicU64,
    last_failure_ms: AtomicU64,
    latency_ema_us: AtomicU64,
}

impl EndpointHealth {
    /// New endpoints start with a success timestamp of "now" so the idle
    /// rule does not blackball them before their first call.
    pub fn new() -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            last_success_ms: AtomicU64::new(now_ms()),
            last_failure_ms: AtomicU64::new(0),
            latency_ema_us: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, latency: Duration) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_ms.store(now_ms(), Ordering::Relaxed);
        let sample = latency.as_micros() as u64;
        let prev = self.latency_ema_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            prev - (prev >> LATENCY_EMA_SHIFT) + (sample >> LATENCY_EMA_SHIFT)
        };
        self.latency_ema_us.store(next, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        if self.consecutive_failures.load(Ordering::Relaxed) >= UNHEALTHY_FAILURE_STREAK {
            return false;
        }
        let idle = now_ms().saturating_sub(self.last_success_ms.load(Ordering::Relaxed));
        idle <= UNHEALTHY_IDLE.as_millis() as u64
    }

    /// Unhealthy endpoints become eligible again after a probe backoff;
    /// a success then resets the failure streak.
    pub fn is_probeable(&self) -> bool {
        let since_failure = now_ms().saturating_sub(self.last_failure_ms.load(Ordering::Relaxed));
        since_failure >= PROBE_BACKOFF.as_millis() as u64
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn latency_ema(&self) -> Duration {
        Duration::from_micros(self.latency_ema_us.load(Ordering::Relaxed))
    }
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// One configured endpoint: transport handle plus health state.
pub struct Endpoint {
    pub url: String,
    pub kind: EndpointKind,
    pub weight: u32,
    pub transport: Arc<dyn ChainClient>,
    pub health: EndpointHealth,
}

impl Endpoint {
    pub fn new(
        url: impl Into<String>,
        kind: EndpointKind,
        weight: u32,
        transport: Arc<dyn ChainClient>,
    ) -> Self {
        Self {
            url: url.into(),
            kind,
            weight: weight.max(1),
            transport,
            health: EndpointHealth::new(),
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("kind", &self.kind)
            .field("weight", &self.weight)
            .field("healthy", &self.health.is_healthy())
            .finish()
    }
}
