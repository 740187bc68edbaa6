//! Block monitor: WS-first, polling-fallback head tracking.
//!
//! State machine per chain:
//!     Disconnected → ConnectingWs → StreamingWs → {StreamingWs | PollingHttp | Disconnected}
//!
//! Falls back to HTTP polling when the WS stream errors, the pool reports
//! degraded with no healthy WS, or the stream goes stale (no block for
//! max(30s, 10× expected block time)). Returns to streaming when the pool
//! signals a recovered WS endpoint.
//!
//! Emits one `NewBlock` stream per chain. Numbers are monotonic
//! non-decreasing; duplicates and gaps are possible around failover and
//! consumers are expected to be idempotent in block number.

use crate::config::EndpointKind;
use crate::rpc::{BlockStream, ChainClient, PoolEvent, RpcPool};
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Minimum stale threshold regardless of chain speed.
const STALE_FLOOR: Duration = Duration::from_secs(30);

/// Polling never goes below 1s even on sub-second chains.
const POLL_FLOOR: Duration = Duration::from_secs(1);

/// How the current head was learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSourceMode {
    Ws,
    Polling,
}

/// Head notification delivered to the fetcher and ingestor bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBlock {
    pub number: u64,
    pub timestamp: u64,
    pub mode: BlockSourceMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Disconnected,
    ConnectingWs,
    StreamingWs,
    PollingHttp,
}

enum Exit {
    Shutdown,
    Fallback,
    Reconnect,
}

/// Per-chain block head monitor.
pub struct BlockMonitor {
    pool: Arc<RpcPool>,
    expected_block_ms: u64,
    blocks: broadcast::Sender<NewBlock>,
    state: watch::Sender<MonitorState>,
    last_emitted: AtomicU64,
}

impl BlockMonitor {
    pub fn new(pool: Arc<RpcPool>, expected_block_ms: u64) -> Self {
        let (blocks, _) = broadcast::channel(256);
        let (state, _) = watch::channel(MonitorState::Disconnected);
        Self {
            pool,
            expected_block_ms,
            blocks,
            state,
            last_emitted: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NewBlock> {
        self.blocks.subscribe()
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    fn stale_threshold(&self) -> Duration {
        STALE_FLOOR.max(Duration::from_millis(self.expected_block_ms * 10))
    }

    fn poll_interval(&self) -> Duration {
        POLL_FLOOR.max(Duration::from_millis(self.expected_block_ms / 2))
    }

    fn set_state(&self, next: MonitorState) {
        if *self.state.borrow() != next {
            debug!(chain_id = self.pool.chain_id(), ?next, "block monitor state");
            let _ = self.state.send(next);
        }
    }

    /// Emit a head if it keeps the stream monotonic non-decreasing.
    /// `strict` additionally suppresses duplicates (polling mode).
    fn emit(&self, number: u64, timestamp: u64, mode: BlockSourceMode, strict: bool) {
        let last = self.last_emitted.load(Ordering::Relaxed);
        let accept = if strict { number > last } else { number >= last };
        if !accept {
            return;
        }
        self.last_emitted.store(number, Ordering::Relaxed);
        let _ = self.blocks.send(NewBlock {
            number,
            timestamp,
            mode,
        });
    }

    /// Run until shutdown. Never returns early on chain errors — every
    /// failure path lands in polling mode and waits for WS recovery.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut pool_events = self.pool.events();
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.set_state(MonitorState::ConnectingWs);
            match self.pool.subscribe_blocks().await {
                Ok(stream) => {
                    self.set_state(MonitorState::StreamingWs);
                    match self
                        .stream_ws(stream, &mut shutdown, &mut pool_events)
                        .await
                    {
                        Exit::Shutdown => break,
                        Exit::Reconnect => continue,
                        Exit::Fallback => {}
                    }
                }
                Err(err) => {
                    warn!(chain_id = self.pool.chain_id(), %err, "ws subscribe failed, polling");
                }
            }

            self.set_state(MonitorState::PollingHttp);
            match self.poll_http(&mut shutdown, &mut pool_events).await {
                Exit::Shutdown => break,
                _ => continue, // recovered WS: reconnect
            }
        }
        self.set_state(MonitorState::Disconnected);
    }

    async fn stream_ws(
        &self,
        mut stream: BlockStream,
        shutdown: &mut watch::Receiver<bool>,
        pool_events: &mut broadcast::Receiver<PoolEvent>,
    ) -> Exit {
        let stale = self.stale_threshold();
        let stale_timer = tokio::time::sleep(stale);
        tokio::pin!(stale_timer);

        loop {
            tokio::select! {
                _ = &mut stale_timer => {
                    warn!(chain_id = self.pool.chain_id(), "block stream stale, switching to polling");
                    return Exit::Fallback;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Exit::Shutdown;
                    }
                }
                evt = pool_events.recv() => {
                    if let Ok(PoolEvent::Degraded { healthy_ws: false }) = evt {
                        return Exit::Fallback;
                    }
                }
                head = stream.next() => {
                    match head {
                        Some(h) => {
                            self.emit(h.number, h.timestamp, BlockSourceMode::Ws, false);
                            stale_timer.as_mut().reset(tokio::time::Instant::now() + stale);
                        }
                        None => {
                            debug!(chain_id = self.pool.chain_id(), "block stream ended");
                            return Exit::Fallback;
                        }
                    }
                }
            }
        }
    }

    async fn poll_http(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        pool_events: &mut broadcast::Receiver<PoolEvent>,
    ) -> Exit {
        let mut tick = tokio::time::interval(self.poll_interval());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Exit::Shutdown;
                    }
                }
                evt = pool_events.recv() => {
                    if let Ok(PoolEvent::Recovered { kind: EndpointKind::Ws }) = evt {
                        if self.pool.has_healthy(EndpointKind::Ws) {
                            info!(chain_id = self.pool.chain_id(), "ws recovered, leaving polling mode");
                            return Exit::Reconnect;
                        }
                    }
                }
                _ = tick.tick() => {
                    match self.pool.get_block_number().await {
                        Ok(number) => {
                            let ts = chrono::Utc::now().timestamp() as u64;
                            self.emit(number, ts, BlockSourceMode::Polling, true);
                        }
                        Err(err) => {
                            debug!(chain_id = self.pool.chain_id(), %err, "poll getBlockNumber failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcError;
    use crate::rpc::{BlockHead, Endpoint, LogFilter, LogStream};
    use alloy::primitives::U256;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU64;

    /// Transport whose block stream yields a fixed prefix then hangs, and
    /// whose polled block number advances on every read.
    struct ScriptedChain {
        ws_heads: Vec<BlockHead>,
        polled: AtomicU64,
        fail_subscribe: bool,
    }

    impl ScriptedChain {
        fn new(ws_heads: Vec<BlockHead>, first_polled: u64, fail_subscribe: bool) -> Self {
            Self {
                ws_heads,
                polled: AtomicU64::new(first_polled),
                fail_subscribe,
            }
        }
    }

    #[async_trait]
    impl ChainClient for ScriptedChain {
        async fn call(
            &self,
            _method: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value, RpcError> {
            Ok(serde_json::Value::Null)
        }

        async fn subscribe_logs(&self, _filter: LogFilter) -> Result<LogStream, RpcError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
            if self.fail_subscribe {
                return Err(RpcError::Transient("ws refused".into()));
            }
            let heads = self.ws_heads.clone();
            // Yield the scripted prefix, then stay pending forever (stale).
            let stream = futures::stream::iter(heads).chain(futures::stream::pending());
            Ok(Box::pin(stream))
        }

        async fn get_gas_price(&self) -> Result<U256, RpcError> {
            Ok(U256::from(1u64))
        }

        async fn get_block_number(&self) -> Result<u64, RpcError> {
            Ok(self.polled.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn monitor_over(chain: ScriptedChain, block_ms: u64) -> Arc<BlockMonitor> {
        let transport: Arc<dyn ChainClient> = Arc::new(chain);
        let pool = Arc::new(RpcPool::new(
            137,
            vec![
                Endpoint::new("mock-ws", EndpointKind::Ws, 1, Arc::clone(&transport)),
                Endpoint::new("mock-http", EndpointKind::Http, 1, transport),
            ],
        ));
        Arc::new(BlockMonitor::new(pool, block_ms))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ws_heads_are_emitted_monotonically() {
        let heads = vec![
            BlockHead { number: 100, timestamp: 1 },
            BlockHead { number: 101, timestamp: 2 },
            BlockHead { number: 101, timestamp: 2 }, // duplicate tolerated
            BlockHead { number: 99, timestamp: 3 },  // regression suppressed
            BlockHead { number: 103, timestamp: 4 }, // gap tolerated
        ];
        let monitor = monitor_over(ScriptedChain::new(heads, 0, false), 2000);
        let mut rx = monitor.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);

        let m = Arc::clone(&monitor);
        let task = tokio::spawn(async move { m.run(stop_rx).await });

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().number);
        }
        assert_eq!(seen, vec![100, 101, 101, 103]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(monitor.state(), MonitorState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_stream_falls_back_to_polling() {
        // One WS head, then silence: the stale timer fires and the monitor
        // must keep producing heads from polling.
        let heads = vec![BlockHead { number: 50, timestamp: 1 }];
        let monitor = monitor_over(ScriptedChain::new(heads, 51, false), 2000);
        let mut rx = monitor.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);

        let m = Arc::clone(&monitor);
        let task = tokio::spawn(async move { m.run(stop_rx).await });

        assert_eq!(rx.recv().await.unwrap().number, 50);
        let polled = rx.recv().await.unwrap();
        assert_eq!(polled.mode, BlockSourceMode::Polling);
        assert!(polled.number >= 51);
        assert_eq!(monitor.state(), MonitorState::PollingHttp);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_failure_goes_straight_to_polling() {
        let monitor = monitor_over(ScriptedChain::new(vec![], 10, true), 2000);
        let mut rx = monitor.subscribe();
        let (stop_tx, stop_rx) = watch::channel(false);

        let m = Arc::clone(&monitor);
        let task = tokio::spawn(async move { m.run(stop_rx).await });

        let head = rx.recv().await.unwrap();
        assert_eq!(head.mode, BlockSourceMode::Polling);

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }

    #[test]
    fn test_thresholds() {
        let transport: Arc<dyn ChainClient> =
            Arc::new(ScriptedChain::new(vec![], 0, false));
        let pool = Arc::new(RpcPool::new(
            1,
            vec![Endpoint::new("m", EndpointKind::Ws, 1, transport)],
        ));

        // Fast chain: floor values dominate
        let fast = BlockMonitor::new(Arc::clone(&pool), 400);
        assert_eq!(fast.stale_threshold(), Duration::from_secs(30));
        assert_eq!(fast.poll_interval(), Duration::from_secs(1));

        // Slow chain: multiples of block time dominate
        let slow = BlockMonitor::new(pool, 12_000);
        assert_eq!(slow.stale_threshold(), Duration::from_secs(120));
        assert_eq!(slow.poll_interval(), Duration::from_secs(6));
    }
}
