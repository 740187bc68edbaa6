//! Per-chain assembly: wires the RPC pool, block monitor, ingestor,
//! caches, prioritizer, fetcher, detector family, scorer and dispatcher
//! into one start/stop unit.
//!
//! The hot path is single-writer through channels: the block loop drives
//! snapshot detectors, the event loops drive the differential/statistical/
//! liquidation detectors, and everything funnels into the dispatcher. No
//! failure on any of these paths kills the chain — errors are counted into
//! status and the loop continues.

use crate::alerts::AlertSink;
use crate::cache::{gas_cost_usd, GasCache, PriceCache};
use crate::config::{AppConfig, ChainConfig};
use crate::detectors::{
    CrossVenueDetector, DifferentialDetector, LiquidationDetector, StablecoinDetector,
    StatisticalDetector, TriangularDetector,
};
use crate::dispatch::{DispatchDecision, Dispatcher, Executor};
use crate::fetcher::PriceFetcher;
use crate::graph::PriceGraph;
use crate::ingest::{EventIngestor, ReserveUpdate, SwapObserved};
use crate::math::{price_from_sqrt_x96, spot_price};
use crate::monitor::{BlockMonitor, MonitorState};
use crate::oracle::{PriceOracle, StaticPriceTable, UsdReference};
use crate::prioritizer::AdaptivePrioritizer;
use crate::rpc::{ChainClient, RpcPool};
use crate::scoring::OpportunityScorer;
use crate::types::{Opportunity, Pool, Quote, QuoteSource};
use crate::whale::WhaleTracker;
use alloy::primitives::{Address, U256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hard stop after this much graceful-drain time.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

/// Gas units assumed per two-leg arbitrage trade.
const GAS_UNITS_PER_TRADE: u64 = 300_000;

/// Fallback gas price when the cache cannot answer at all.
const FALLBACK_GAS_WEI: u64 = 30_000_000_000;

/// Whale threshold feeding the volume promotion path.
const WHALE_THRESHOLD_USD: f64 = 100_000.0;

/// Errors kept for status reporting.
const ERROR_HISTORY: usize = 50;

/// Point-in-time chain summary for the status surface.
#[derive(Debug, Clone)]
pub struct ChainStatus {
    pub chain_id: u64,
    pub name: String,
    pub running: bool,
    pub monitor_state: MonitorState,
    pub last_block: u64,
    pub pairs_tracked: usize,
    pub cached_quotes: usize,
    pub opportunities_found: u64,
    pub executed: u64,
    pub dropped_busy: u64,
    pub skipped_low_score: u64,
    pub decode_errors: u64,
    pub budget_exceeded: u64,
    pub stale_gas_fallbacks: u64,
    pub recent_errors: Vec<String>,
}

/// One chain's full detection pipeline.
pub struct ChainCoordinator {
    chain: ChainConfig,
    pools: Vec<Pool>,
    pools_by_address: HashMap<Address, Pool>,
    rpc: Arc<RpcPool>,
    monitor: Arc<BlockMonitor>,
    ingestor: Arc<EventIngestor>,
    cache: Arc<PriceCache>,
    gas: Arc<GasCache>,
    usd: Arc<UsdReference>,
    prioritizer: Arc<AdaptivePrioritizer>,
    fetcher: Arc<PriceFetcher>,
    cross_venue: Arc<CrossVenueDetector>,
    triangular: Arc<TriangularDetector>,
    differential: Arc<DifferentialDetector>,
    statistical: Arc<StatisticalDetector>,
    stablecoin: Arc<StablecoinDetector>,
    liquidation: Arc<LiquidationDetector>,
    scorer: Arc<OpportunityScorer>,
    dispatcher: Arc<Dispatcher>,
    whales: Arc<WhaleTracker>,
    alerts: Arc<AlertSink>,

    running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    last_block: AtomicU64,
    /// Gas cost per trade in USD, refreshed by the block loop and read by
    /// the event loops (f64 bits in an atomic).
    gas_cost_bits: AtomicU64,
    opportunities_found: AtomicU64,
    budget_exceeded: AtomicU64,
    channel_lagged: AtomicU64,
    errors: Mutex<VecDeque<String>>,
}

impl ChainCoordinator {
    pub fn new(
        chain: ChainConfig,
        app: &AppConfig,
        rpc: Arc<RpcPool>,
        executor: Arc<dyn Executor>,
        oracle: Option<Arc<dyn PriceOracle>>,
        liquidation_sources: Vec<Address>,
    ) -> crate::errors::CoreResult<Arc<Self>> {
        let pools = chain.build_pools()?;
        let pools_by_address: HashMap<Address, Pool> =
            pools.iter().map(|p| (p.address, p.clone())).collect();

        let client: Arc<dyn ChainClient> = Arc::clone(&rpc) as Arc<dyn ChainClient>;
        let usd = Arc::new(UsdReference::new(
            chain.id,
            StaticPriceTable::from_chain(&chain),
            oracle,
        ));

        let cache = Arc::new(PriceCache::new());
        let gas = Arc::new(GasCache::new(Arc::clone(&client)));
        let prioritizer = Arc::new(AdaptivePrioritizer::new(app.prioritizer.clone()));
        for pool in &pools {
            // Liquidity is unknown until the first fetch; start every pair
            // at NORMAL rather than condemning it to COLD.
            prioritizer.register_pair(pool.pair.clone(), 0.0, f64::INFINITY);
        }

        let monitor = Arc::new(BlockMonitor::new(Arc::clone(&rpc), chain.expected_block_ms));
        let ingestor = Arc::new(EventIngestor::new(
            Arc::clone(&client),
            liquidation_sources,
            200,
            50,
        ));
        let fetcher = Arc::new(PriceFetcher::new(
            Arc::clone(&client),
            Arc::clone(&cache),
            Arc::clone(&prioritizer),
            Arc::clone(&usd),
            pools.clone(),
        ));

        let detection = app.detection.clone();
        let stable_tokens: Vec<_> = chain.stable_tokens().into_iter().cloned().collect();
        let cross_venue = Arc::new(CrossVenueDetector::new(
            detection.clone(),
            Arc::clone(&usd),
            pools.clone(),
            chain.id,
        ));
        let triangular = Arc::new(TriangularDetector::new(
            detection.clone(),
            Arc::clone(&usd),
            chain.id,
        ));
        let differential = Arc::new(DifferentialDetector::new(
            detection.clone(),
            Arc::clone(&cache),
            pools.clone(),
            chain.id,
        ));
        let statistical = Arc::new(StatisticalDetector::new(detection.clone(), chain.id));
        let stablecoin = Arc::new(StablecoinDetector::new(
            detection.clone(),
            Arc::clone(&usd),
            pools.clone(),
            &stable_tokens,
            chain.id,
        ));
        let liquidation = Arc::new(LiquidationDetector::new(
            detection,
            Arc::clone(&usd),
            chain.tokens.clone(),
            chain.id,
        ));

        let scorer = Arc::new(OpportunityScorer::new(
            app.scoring.clone(),
            chain.tokens.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            executor,
            Arc::clone(&prioritizer),
            app.execution.min_score,
        ));
        let whales = Arc::new(WhaleTracker::new(
            pools.clone(),
            Arc::clone(&usd),
            Arc::clone(&prioritizer),
            WHALE_THRESHOLD_USD,
        ));
        let alerts = AlertSink::new(app.alerts.webhook_url.clone(), chain.name.clone());

        Ok(Arc::new(Self {
            chain,
            pools,
            pools_by_address,
            rpc,
            monitor,
            ingestor,
            cache,
            gas,
            usd,
            prioritizer,
            fetcher,
            cross_venue,
            triangular,
            differential,
            statistical,
            stablecoin,
            liquidation,
            scorer,
            dispatcher,
            whales,
            alerts,
            running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            last_block: AtomicU64::new(0),
            gas_cost_bits: AtomicU64::new(0.05f64.to_bits()),
            opportunities_found: AtomicU64::new(0),
            budget_exceeded: AtomicU64::new(0),
            channel_lagged: AtomicU64::new(0),
            errors: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY)),
        }))
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    fn record_error(&self, message: String) {
        error!(chain = %self.chain.name, "{message}");
        let mut errors = self.errors.lock().unwrap();
        if errors.len() == ERROR_HISTORY {
            errors.pop_front();
        }
        errors.push_back(message);
    }

    fn gas_cost(&self) -> f64 {
        f64::from_bits(self.gas_cost_bits.load(Ordering::Relaxed))
    }

    fn block_budget(&self) -> Duration {
        Duration::from_millis((self.chain.expected_block_ms / 2).max(500))
    }

    /// Score and dispatch a batch of detector output.
    async fn handle_opportunities(&self, opportunities: Vec<Opportunity>) {
        for opp in opportunities {
            self.opportunities_found.fetch_add(1, Ordering::Relaxed);
            let score = self.scorer.score(&opp);
            debug!(
                id = %opp.id,
                kind = ?opp.kind,
                composite = score.composite,
                recommendation = ?score.recommendation,
                "scored opportunity"
            );
            self.dispatcher.dispatch(opp, &score).await;
        }
    }

    /// Direct scoring + dispatch entry used by the cross-chain router.
    pub async fn execute_direct(&self, opp: Opportunity) -> DispatchDecision {
        let score = self.scorer.score(&opp);
        self.dispatcher.dispatch(opp, &score).await
    }

    /// Start all tasks. Idempotent: a running coordinator ignores the call.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            chain = %self.chain.name,
            pools = self.pools.len(),
            pairs = self.fetcher.pair_count(),
            "starting chain coordinator"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        for pool in &self.pools {
            if let Err(err) = self.ingestor.register_pool(pool.clone()) {
                self.record_error(format!("pool registration: {err}"));
            }
        }

        let mut tasks = self.tasks.lock().unwrap();

        let monitor = Arc::clone(&self.monitor);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { monitor.run(rx).await }));

        let ingestor = Arc::clone(&self.ingestor);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { ingestor.run(rx).await }));

        let cache = Arc::clone(&self.cache);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { cache.run_sweeper(rx).await }));

        let prioritizer = Arc::clone(&self.prioritizer);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { prioritizer.run_decay_loop(rx).await }));

        let me = Arc::clone(self);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { me.block_loop(rx).await }));

        let me = Arc::clone(self);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { me.reserve_loop(rx).await }));

        let me = Arc::clone(self);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { me.swap_loop(rx).await }));

        let me = Arc::clone(self);
        tasks.push(tokio::spawn(async move { me.liquidation_loop(shutdown_rx).await }));
    }

    /// Graceful stop: signal shutdown, wait for any in-flight execution,
    /// then join tasks within the remaining budget and abort stragglers.
    /// Every listener is released — a later start() gets fresh channels.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(chain = %self.chain.name, "stopping chain coordinator");

        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }

        if !self.dispatcher.drain(GRACEFUL_TIMEOUT).await {
            warn!(chain = %self.chain.name, "in-flight execution outlived graceful timeout");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        let deadline = tokio::time::Instant::now() + GRACEFUL_TIMEOUT;
        for task in tasks {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let abort = task.abort_handle();
            if tokio::time::timeout(remaining, task).await.is_err() {
                // Hard stop: the graceful budget is spent.
                abort.abort();
            }
        }
        info!(chain = %self.chain.name, "chain coordinator stopped");
    }

    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            chain_id: self.chain.id,
            name: self.chain.name.clone(),
            running: self.running.load(Ordering::SeqCst),
            monitor_state: self.monitor.state(),
            last_block: self.last_block.load(Ordering::Relaxed),
            pairs_tracked: self.prioritizer.len(),
            cached_quotes: self.cache.len(),
            opportunities_found: self.opportunities_found.load(Ordering::Relaxed),
            executed: self.dispatcher.executed_count(),
            dropped_busy: self.dispatcher.dropped_busy_count(),
            skipped_low_score: self.dispatcher.skipped_count(),
            decode_errors: self.ingestor.decode_errors(),
            budget_exceeded: self.budget_exceeded.load(Ordering::Relaxed),
            stale_gas_fallbacks: self.gas.stale_fallback_count(),
            recent_errors: self.errors.lock().unwrap().iter().cloned().collect(),
        }
    }

    /// Block-tick pipeline: refresh prices, rebuild the graph, run the
    /// snapshot detectors under the block budget.
    async fn block_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut blocks = self.monitor.subscribe();
        loop {
            let block = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                received = blocks.recv() => match received {
                    Ok(b) => b,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.channel_lagged.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            self.last_block.store(block.number, Ordering::Relaxed);
            let started = tokio::time::Instant::now();
            let deadline = started + self.block_budget();

            // Refresh the per-trade gas cost for every detector path.
            let gas_price = match self.gas.gas_price().await {
                Ok(p) => p,
                Err(err) => {
                    self.record_error(format!("gas price: {err}"));
                    U256::from(FALLBACK_GAS_WEI)
                }
            };
            let cost = gas_cost_usd(gas_price, GAS_UNITS_PER_TRADE, self.chain.native_usd);
            self.gas_cost_bits.store(cost.to_bits(), Ordering::Relaxed);

            let updated = self.ingestor.updated_in_block(block.number);
            let snapshot = self.fetcher.refresh(block.number, &updated).await;
            if snapshot.is_empty() {
                continue;
            }
            let graph = PriceGraph::from_snapshot(self.pools.iter(), &snapshot);

            let mut opportunities = self
                .cross_venue
                .scan(&snapshot, block.number, cost, deadline)
                .await;
            opportunities.extend(
                self.triangular
                    .scan(&graph, &self.chain.base_tokens, block.number, cost, deadline)
                    .await,
            );
            let (stable_opps, depegs) = self
                .stablecoin
                .scan(&snapshot, &graph, block.number, cost, deadline)
                .await;
            opportunities.extend(stable_opps);
            for alert in &depegs {
                self.alerts.notify_depeg(alert);
            }

            if tokio::time::Instant::now() >= deadline {
                // Partial results were accepted; the block still counts.
                self.budget_exceeded.fetch_add(1, Ordering::Relaxed);
            }

            self.handle_opportunities(opportunities).await;
        }
    }

    async fn reserve_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut updates = self.ingestor.reserve_updates();
        loop {
            let update = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                received = updates.recv() => match received {
                    Ok(u) => u,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.channel_lagged.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            self.apply_reserve_update(&update).await;
            let opportunities = self.differential.on_reserve_update(&update, self.gas_cost());
            self.handle_opportunities(opportunities).await;
        }
    }

    /// Event-sourced cache write for a V2 reserve change.
    async fn apply_reserve_update(&self, update: &ReserveUpdate) {
        let Some(pool) = self.pools_by_address.get(&update.pool) else {
            return;
        };
        if update.reserve0.is_zero() || update.reserve1.is_zero() {
            // Bad reserves: skip this block for the pair, keep the old quote.
            debug!(pool = %update.pool, "empty reserves in sync event");
            return;
        }
        let price = spot_price(
            update.reserve0,
            update.reserve1,
            pool.token0.decimals,
            pool.token1.decimals,
        );
        if price <= 0.0 || !price.is_finite() {
            return;
        }
        let liquidity_usd = self
            .usd
            .cp_liquidity_usd(pool, update.reserve0, update.reserve1)
            .await;
        self.cache.put(Quote {
            pair: update.pair.clone(),
            venue: pool.venue.clone(),
            price,
            reserves: Some((update.reserve0, update.reserve1)),
            liquidity_usd,
            block_number: update.block_number,
            observed_at: std::time::Instant::now(),
            source: QuoteSource::SyncEvent,
        });
    }

    async fn swap_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut swaps = self.ingestor.swaps();
        loop {
            let swap = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                received = swaps.recv() => match received {
                    Ok(s) => s,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.channel_lagged.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            let Some(quote) = self.apply_swap(&swap).await else {
                continue;
            };
            self.whales.on_swap(&swap).await;

            // Spread samples against every other venue quoting the pair.
            let mut opportunities = Vec::new();
            for (venue, other) in self.cache.get_pair(&swap.pair) {
                if venue == quote.venue {
                    continue;
                }
                if let Some(opp) = self.statistical.observe(&quote, &other, self.gas_cost()) {
                    opportunities.push(opp);
                }
            }
            self.handle_opportunities(opportunities).await;
        }
    }

    /// Event-sourced cache write for a concentrated-liquidity swap.
    async fn apply_swap(&self, swap: &SwapObserved) -> Option<Quote> {
        let pool = self.pools_by_address.get(&swap.pool)?;
        let price = price_from_sqrt_x96(
            swap.sqrt_price_x96,
            pool.token0.decimals,
            pool.token1.decimals,
        );
        if price <= 0.0 || !price.is_finite() {
            return None;
        }
        let liquidity_usd = self
            .usd
            .concentrated_liquidity_usd(pool, swap.sqrt_price_x96, swap.liquidity)
            .await;
        let quote = Quote {
            pair: swap.pair.clone(),
            venue: pool.venue.clone(),
            price,
            reserves: None,
            liquidity_usd,
            block_number: swap.block_number,
            observed_at: std::time::Instant::now(),
            source: QuoteSource::SwapEvent,
        };
        self.cache.put(quote.clone());
        Some(quote)
    }

    async fn liquidation_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut liquidations = self.ingestor.liquidations();
        loop {
            let event = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                received = liquidations.recv() => match received {
                    Ok(l) => l,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.channel_lagged.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };

            if let Some(opp) = self.liquidation.on_liquidation(&event, self.gas_cost()).await {
                self.handle_opportunities(vec![opp]).await;
            }
        }
    }
}
