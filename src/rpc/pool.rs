//! RPC endpoint pool with health-based failover.
//!
//! Presents a single `ChainClient` that transparently chooses a healthy
//! endpoint per call: randomized weighted selection, exponential backoff
//! with jitter between retries, per-call deadlines, and pool-level
//! degraded/recovered notifications consumed by the block monitor.

use crate::config::EndpointKind;
use crate::errors::RpcError;
use crate::rpc::client::{BlockStream, ChainClient, LogFilter, LogStream};
use crate::rpc::endpoint::Endpoint;
use alloy::primitives::U256;
use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Base backoff between retries.
const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(3);

/// Default per-call deadline.
const CALL_DEADLINE: Duration = Duration::from_secs(5);

/// Default retry budget per logical call.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Pool health notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// The healthy set shrank to nothing usable. `healthy_ws` tells the
    /// block monitor whether a WS endpoint survives.
    Degraded { healthy_ws: bool },
    /// A previously-unhealthy endpoint came back.
    Recovered { kind: EndpointKind },
}

/// Per-call options. `ChainClient` methods use the defaults.
#[derive(Debug, Clone, Copy)]
pub struct CallOpts {
    pub max_retries: u32,
    pub deadline: Duration,
}

impl Default for CallOpts {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            deadline: CALL_DEADLINE,
        }
    }
}

/// Weighted pool of HTTP and WS endpoints for one chain.
pub struct RpcPool {
    chain_id: u64,
    endpoints: Vec<Arc<Endpoint>>,
    events: broadcast::Sender<PoolEvent>,
    degraded: AtomicBool,
}

impl RpcPool {
    pub fn new(chain_id: u64, endpoints: Vec<Endpoint>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            chain_id,
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            events,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Subscribe to degraded/recovered notifications.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Live event subscribers; used to verify exact listener cleanup on
    /// coordinator stop.
    pub fn event_listener_count(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    pub fn has_healthy(&self, kind: EndpointKind) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.kind == kind && e.health.is_healthy())
    }

    /// Candidates for one attempt: healthy endpoints of the requested kind,
    /// or unhealthy ones past their probe backoff (recovery path).
    fn candidates(&self, kind: Option<EndpointKind>) -> Vec<Arc<Endpoint>> {
        let matching = |e: &&Arc<Endpoint>| kind.map_or(true, |k| e.kind == k);
        let healthy: Vec<_> = self
            .endpoints
            .iter()
            .filter(matching)
            .filter(|e| e.health.is_healthy())
            .cloned()
            .collect();
        if !healthy.is_empty() {
            return healthy;
        }
        self.endpoints
            .iter()
            .filter(matching)
            .filter(|e| e.health.is_probeable())
            .cloned()
            .collect()
    }

    /// Randomized weighted draw without replacement.
    fn weighted_order(mut pool: Vec<Arc<Endpoint>>) -> Vec<Arc<Endpoint>> {
        let mut rng = rand::thread_rng();
        let mut ordered = Vec::with_capacity(pool.len());
        while !pool.is_empty() {
            let total: u64 = pool.iter().map(|e| e.weight as u64).sum();
            let mut pick = rng.gen_range(0..total);
            let mut idx = 0;
            for (i, e) in pool.iter().enumerate() {
                if pick < e.weight as u64 {
                    idx = i;
                    break;
                }
                pick -= e.weight as u64;
            }
            ordered.push(pool.swap_remove(idx));
        }
        ordered
    }

    fn backoff_with_jitter(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(4));
        let capped = exp.min(BACKOFF_CAP);
        // ±50% jitter spreads synchronized retries across endpoints.
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        capped.mul_f64(jitter)
    }

    fn on_success(&self, endpoint: &Endpoint, was_healthy: bool, latency: Duration) {
        endpoint.health.record_success(latency);
        if !was_healthy {
            debug!(url = %endpoint.url, "endpoint recovered");
            let _ = self.events.send(PoolEvent::Recovered { kind: endpoint.kind });
        }
        if self.degraded.load(Ordering::Relaxed) && self.has_healthy(EndpointKind::Ws) {
            // Degraded state only ends once a WS endpoint is healthy again;
            // the monitor uses this to switch back to streaming.
            self.degraded.store(false, Ordering::Relaxed);
            let _ = self.events.send(PoolEvent::Recovered { kind: EndpointKind::Ws });
        }
    }

    fn on_failure(&self, endpoint: &Endpoint) {
        endpoint.health.record_failure();
        let healthy_ws = self.has_healthy(EndpointKind::Ws);
        let any_healthy = self.endpoints.iter().any(|e| e.health.is_healthy());
        if (!any_healthy || !healthy_ws) && !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                chain_id = self.chain_id,
                healthy_ws, "endpoint pool degraded"
            );
            let _ = self.events.send(PoolEvent::Degraded { healthy_ws });
        }
    }

    /// Run `op` against endpoints with retry + failover. Transient errors
    /// rotate to the next endpoint with backoff; permanent errors return
    /// immediately; an empty candidate set is AllDown.
    async fn with_failover<T>(
        &self,
        kind: Option<EndpointKind>,
        opts: CallOpts,
        op: impl Fn(Arc<dyn ChainClient>) -> BoxFuture<'static, Result<T, RpcError>>,
    ) -> Result<T, RpcError> {
        let mut last_err: Option<RpcError> = None;

        for attempt in 0..opts.max_retries.max(1) {
            let candidates = self.candidates(kind);
            if candidates.is_empty() {
                let healthy_ws = self.has_healthy(EndpointKind::Ws);
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    let _ = self.events.send(PoolEvent::Degraded { healthy_ws });
                }
                return Err(last_err.unwrap_or(RpcError::AllDown {
                    chain_id: self.chain_id,
                }));
            }

            for endpoint in Self::weighted_order(candidates) {
                let was_healthy = endpoint.health.is_healthy();
                let started = Instant::now();
                let fut = op(Arc::clone(&endpoint.transport));
                match tokio::time::timeout(opts.deadline, fut).await {
                    Ok(Ok(value)) => {
                        self.on_success(&endpoint, was_healthy, started.elapsed());
                        return Ok(value);
                    }
                    Ok(Err(err)) if !err.is_transient() => {
                        // Chain-level revert: the endpoint itself is fine.
                        endpoint.health.record_success(started.elapsed());
                        return Err(err);
                    }
                    Ok(Err(err)) => {
                        debug!(url = %endpoint.url, %err, "endpoint call failed");
                        self.on_failure(&endpoint);
                        last_err = Some(err);
                    }
                    Err(_) => {
                        debug!(url = %endpoint.url, "endpoint call deadline exceeded");
                        self.on_failure(&endpoint);
                        last_err = Some(RpcError::Deadline(opts.deadline));
                    }
                }
            }

            if attempt + 1 < opts.max_retries.max(1) {
                tokio::time::sleep(Self::backoff_with_jitter(attempt)).await;
            }
        }

        Err(last_err.unwrap_or(RpcError::AllDown {
            chain_id: self.chain_id,
        }))
    }

    /// `call` with explicit options.
    pub async fn call_with_opts(
        &self,
        method: &str,
        params: serde_json::Value,
        opts: CallOpts,
    ) -> Result<serde_json::Value, RpcError> {
        let method = method.to_string();
        self.with_failover(None, opts, move |client| {
            let method = method.clone();
            let params = params.clone();
            Box::pin(async move { client.call(&method, params).await })
        })
        .await
    }
}

#[async_trait]
impl ChainClient for RpcPool {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        self.call_with_opts(method, params, CallOpts::default()).await
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream, RpcError> {
        self.with_failover(Some(EndpointKind::Ws), CallOpts::default(), move |client| {
            let filter = filter.clone();
            Box::pin(async move { client.subscribe_logs(filter).await })
        })
        .await
    }

    async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
        self.with_failover(Some(EndpointKind::Ws), CallOpts::default(), |client| {
            Box::pin(async move { client.subscribe_blocks().await })
        })
        .await
    }

    async fn get_gas_price(&self) -> Result<U256, RpcError> {
        self.with_failover(None, CallOpts::default(), |client| {
            Box::pin(async move { client.get_gas_price().await })
        })
        .await
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.with_failover(None, CallOpts::default(), |client| {
            Box::pin(async move { client.get_block_number().await })
        })
        .await
    }
}
