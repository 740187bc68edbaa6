//! Per-chain gas price cache with request coalescing.
//!
//! One in-flight fetch at a time: concurrent callers wait on the pending
//! result instead of stampeding the RPC pool. On fetch failure a stale
//! value inside the fallback window is served and counted as telemetry.

use crate::errors::RpcError;
use crate::math::u256_to_f64;
use crate::rpc::ChainClient;
use alloy::primitives::U256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cached value lifetime.
const TTL: Duration = Duration::from_millis(2000);

/// Stale values remain acceptable as a fallback for 10× the TTL.
const STALE_FALLBACK: Duration = Duration::from_millis(20_000);

struct GasState {
    value: Option<(U256, Instant)>,
    /// Pending fetch, if any: waiters subscribe instead of re-fetching.
    inflight: Option<watch::Receiver<Option<Option<U256>>>>,
}

/// Time-TTL gas price cache for one chain.
pub struct GasCache {
    client: Arc<dyn ChainClient>,
    state: Mutex<GasState>,
    stale_fallbacks: AtomicU64,
}

impl GasCache {
    pub fn new(client: Arc<dyn ChainClient>) -> Self {
        Self {
            client,
            state: Mutex::new(GasState {
                value: None,
                inflight: None,
            }),
            stale_fallbacks: AtomicU64::new(0),
        }
    }

    /// Times a stale value was served because the fetch failed.
    pub fn stale_fallback_count(&self) -> u64 {
        self.stale_fallbacks.load(Ordering::Relaxed)
    }

    /// Current gas price in wei: fresh cache hit, coalesced wait, or a new
    /// fetch — in that order.
    pub async fn gas_price(&self) -> Result<U256, RpcError> {
        let pending = {
            let mut state = self.state.lock().await;
            if let Some((value, at)) = state.value {
                if at.elapsed() < TTL {
                    return Ok(value);
                }
            }
            if let Some(rx) = &state.inflight {
                Some(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.inflight = Some(rx);
                drop(state);
                return self.fetch_and_publish(tx).await;
            }
        };

        // Coalesced path: wait for the in-flight fetch to resolve.
        let mut rx = pending.expect("inflight receiver");
        loop {
            let outcome = *rx.borrow();
            if let Some(outcome) = outcome {
                return self.resolve_waiter(outcome).await;
            }
            if rx.changed().await.is_err() {
                // Fetcher dropped without publishing; treat as failure.
                return self.resolve_waiter(None).await;
            }
        }
    }

    async fn fetch_and_publish(
        &self,
        tx: watch::Sender<Option<Option<U256>>>,
    ) -> Result<U256, RpcError> {
        let fetched = self.client.get_gas_price().await;

        let mut state = self.state.lock().await;
        state.inflight = None;
        match fetched {
            Ok(value) => {
                state.value = Some((value, Instant::now()));
                drop(state);
                let _ = tx.send(Some(Some(value)));
                Ok(value)
            }
            Err(err) => {
                let stale = state
                    .value
                    .filter(|(_, at)| at.elapsed() < STALE_FALLBACK)
                    .map(|(v, _)| v);
                drop(state);
                let _ = tx.send(Some(None));
                match stale {
                    Some(value) => {
                        self.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
                        warn!(%err, "gas fetch failed, serving stale value");
                        Ok(value)
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// A coalesced waiter resolving the published outcome. Failure applies
    /// the same stale-fallback policy as the fetcher itself.
    async fn resolve_waiter(&self, outcome: Option<U256>) -> Result<U256, RpcError> {
        if let Some(value) = outcome {
            return Ok(value);
        }
        let state = self.state.lock().await;
        let stale = state
            .value
            .filter(|(_, at)| at.elapsed() < STALE_FALLBACK)
            .map(|(v, _)| v);
        drop(state);
        match stale {
            Some(value) => {
                self.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            None => Err(RpcError::Transient("gas price fetch failed".into())),
        }
    }
}

/// USD cost of `gas_units` at `gas_price_wei`, given the native token's
/// USD reference. 18-decimal native assumed (EVM chains).
pub fn gas_cost_usd(gas_price_wei: U256, gas_units: u64, native_usd: f64) -> f64 {
    let wei = u256_to_f64(gas_price_wei) * gas_units as f64;
    (wei / 1e18) * native_usd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{BlockStream, LogFilter, LogStream};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Gas source with a per-call delay. Call n fails when n < fail_until
    /// or n >= fail_from.
    struct SlowGas {
        calls: AtomicUsize,
        fail_until: usize,
        fail_from: usize,
        delay: Duration,
    }

    impl SlowGas {
        fn ok(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_until: 0,
                fail_from: usize::MAX,
                delay,
            }
        }

        fn always_failing(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_until: usize::MAX,
                fail_from: 0,
                delay,
            }
        }

        fn failing_after(successes: usize, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_until: 0,
                fail_from: successes,
                delay,
            }
        }
    }

    #[async_trait]
    impl ChainClient for SlowGas {
        async fn call(
            &self,
            _m: &str,
            _p: serde_json::Value,
        ) -> Result<serde_json::Value, RpcError> {
            Ok(serde_json::Value::Null)
        }
        async fn subscribe_logs(&self, _f: LogFilter) -> Result<LogStream, RpcError> {
            Ok(Box::pin(futures::stream::pending()))
        }
        async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
            Ok(Box::pin(futures::stream::pending()))
        }
        async fn get_gas_price(&self) -> Result<U256, RpcError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.fail_until || n >= self.fail_from {
                Err(RpcError::Transient("5xx".into()))
            } else {
                Ok(U256::from(30_000_000_000u64 + n as u64))
            }
        }
        async fn get_block_number(&self) -> Result<u64, RpcError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_value_served_from_cache() {
        let client = Arc::new(SlowGas::ok(Duration::from_millis(1)));
        let cache = GasCache::new(Arc::clone(&client) as Arc<dyn ChainClient>);

        let a = cache.gas_price().await.unwrap();
        let b = cache.gas_price().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "second read was a cache hit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_triggers_refetch() {
        let client = Arc::new(SlowGas::ok(Duration::from_millis(1)));
        let cache = GasCache::new(Arc::clone(&client) as Arc<dyn ChainClient>);

        cache.gas_price().await.unwrap();
        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        cache.gas_price().await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_coalesce() {
        let client = Arc::new(SlowGas::ok(Duration::from_millis(50)));
        let cache = Arc::new(GasCache::new(Arc::clone(&client) as Arc<dyn ChainClient>));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&cache);
            handles.push(tokio::spawn(async move { c.gas_price().await }));
        }
        let mut values = Vec::new();
        for h in handles {
            values.push(h.await.unwrap().unwrap());
        }
        assert!(values.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "one fetch for eight callers");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_fallback_on_failure() {
        // First call succeeds; after TTL the next fetch fails and the
        // stale value is served with telemetry.
        let client = Arc::new(SlowGas::failing_after(1, Duration::from_millis(1)));
        let cache = GasCache::new(Arc::clone(&client) as Arc<dyn ChainClient>);
        let good = cache.gas_price().await.unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;
        let served = cache.gas_price().await.unwrap();
        assert_eq!(served, good);
        assert_eq!(cache.stale_fallback_count(), 1);

        // Past the stale window the failure propagates instead.
        tokio::time::advance(STALE_FALLBACK + Duration::from_millis(1)).await;
        assert!(cache.gas_price().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_without_stale_value_propagates() {
        let client = Arc::new(SlowGas::always_failing(Duration::from_millis(1)));
        let cache = GasCache::new(client as Arc<dyn ChainClient>);
        assert!(cache.gas_price().await.is_err());
    }

    #[test]
    fn test_gas_cost_usd() {
        // 30 gwei × 300k gas on a $0.50 native token ≈ $0.0045
        let cost = gas_cost_usd(U256::from(30_000_000_000u64), 300_000, 0.50);
        assert!((cost - 0.0045).abs() < 1e-9);
    }
}
