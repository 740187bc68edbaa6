//! Event ingestor: pool log subscriptions → normalized update streams.
//!
//! Subscribes to reserve-change (V2 Sync) and swap (V3 Swap) topics over
//! the registered pool set, batching addresses to respect per-endpoint
//! filter limits, plus liquidation topics over configured lending pools.
//! Decoded events are debounced per pool and fanned out on bounded
//! broadcast channels; a per-block updated-pairs set feeds the price
//! fetcher's skip logic.
//!
//! Failure policy: decode errors increment a counter and drop the log;
//! subscription errors bubble into the RPC pool's failover and the
//! ingestor resubscribes.

pub mod decoder;

pub use decoder::{LendingProtocol, LiquidationFields, SwapFields, SyncFields};

use crate::errors::{CoreError, CoreResult};
use crate::rpc::{ChainClient, Log, LogFilter};
use crate::types::{PairKey, Pool};
use alloy::primitives::{Address, B256, I256, U256};
use dashmap::DashMap;
use decoder::{AAVE_LIQUIDATION_TOPIC, COMET_ABSORB_TOPIC, SWAP_TOPIC, SYNC_TOPIC};
use futures::stream::SelectAll;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Debounce window per pool address.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// Bound on each output channel. Lagging consumers lose the oldest
/// messages; the next update supersedes, so loss is acceptable.
const CHANNEL_BOUND: usize = 1024;

/// Blocks of updated-pair bookkeeping retained for the fetcher.
const UPDATED_BLOCKS_KEPT: u64 = 64;

/// Normalized V2 reserve change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveUpdate {
    pub pool: Address,
    pub pair: PairKey,
    pub reserve0: U256,
    pub reserve1: U256,
    pub block_number: u64,
    pub tx_hash: B256,
}

/// Normalized V3 swap observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapObserved {
    pub pool: Address,
    pub pair: PairKey,
    pub amount0: I256,
    pub amount1: I256,
    pub sqrt_price_x96: U256,
    pub liquidity: u128,
    pub tick: i32,
    pub sender: Address,
    pub recipient: Address,
    pub block_number: u64,
}

/// Normalized liquidation observation from a lending pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiquidationObserved {
    pub protocol: LendingProtocol,
    pub user: Address,
    pub collateral_asset: Address,
    pub debt_asset: Option<Address>,
    pub collateral_amount: U256,
    pub debt_amount: U256,
    pub block_number: u64,
    pub tx_hash: B256,
}

struct DebounceSlot {
    last_emit: Option<Instant>,
    pending: Option<Log>,
}

impl DebounceSlot {
    fn window_open(&self, now: Instant) -> bool {
        self.last_emit
            .map_or(true, |t| now.duration_since(t) >= DEBOUNCE_WINDOW)
    }
}

/// Subscribes, decodes, debounces, fans out.
pub struct EventIngestor {
    client: Arc<dyn ChainClient>,
    pools: DashMap<Address, Pool>,
    liquidation_sources: Vec<Address>,
    max_subscribed: usize,
    filter_batch_size: usize,
    reserve_tx: broadcast::Sender<ReserveUpdate>,
    swap_tx: broadcast::Sender<SwapObserved>,
    liq_tx: broadcast::Sender<LiquidationObserved>,
    debounce: DashMap<Address, DebounceSlot>,
    updated: DashMap<u64, HashSet<PairKey>>,
    resubscribe: Notify,
    decode_errors: AtomicU64,
    coalesced: AtomicU64,
}

impl EventIngestor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        liquidation_sources: Vec<Address>,
        max_subscribed: usize,
        filter_batch_size: usize,
    ) -> Self {
        let (reserve_tx, _) = broadcast::channel(CHANNEL_BOUND);
        let (swap_tx, _) = broadcast::channel(CHANNEL_BOUND);
        let (liq_tx, _) = broadcast::channel(256);
        Self {
            client,
            pools: DashMap::new(),
            liquidation_sources,
            max_subscribed,
            filter_batch_size: filter_batch_size.max(1),
            reserve_tx,
            swap_tx,
            liq_tx,
            debounce: DashMap::new(),
            updated: DashMap::new(),
            resubscribe: Notify::new(),
            decode_errors: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// Add a pool to the subscription set. While running, triggers a
    /// resubscribe on the live connection.
    pub fn register_pool(&self, pool: Pool) -> CoreResult<()> {
        if !self.pools.contains_key(&pool.address) && self.pools.len() >= self.max_subscribed {
            return Err(CoreError::Capacity(format!(
                "subscribed pool limit {} reached",
                self.max_subscribed
            )));
        }
        self.pools.insert(pool.address, pool);
        self.resubscribe.notify_one();
        Ok(())
    }

    pub fn subscribed_count(&self) -> usize {
        self.pools.len()
    }

    pub fn reserve_updates(&self) -> broadcast::Receiver<ReserveUpdate> {
        self.reserve_tx.subscribe()
    }

    pub fn swaps(&self) -> broadcast::Receiver<SwapObserved> {
        self.swap_tx.subscribe()
    }

    pub fn liquidations(&self) -> broadcast::Receiver<LiquidationObserved> {
        self.liq_tx.subscribe()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Pairs whose price was refreshed by an event in block `b`.
    pub fn updated_in_block(&self, b: u64) -> HashSet<PairKey> {
        self.updated.get(&b).map(|s| s.clone()).unwrap_or_default()
    }

    /// One filter per address batch: both pool topics in position 0.
    fn pool_filters(&self) -> Vec<LogFilter> {
        let mut addresses: Vec<Address> = self.pools.iter().map(|e| *e.key()).collect();
        addresses.sort();
        addresses
            .chunks(self.filter_batch_size)
            .map(|chunk| LogFilter {
                address: chunk.to_vec(),
                topics: vec![vec![SYNC_TOPIC, SWAP_TOPIC]],
            })
            .collect()
    }

    fn liquidation_filter(&self) -> Option<LogFilter> {
        if self.liquidation_sources.is_empty() {
            return None;
        }
        Some(LogFilter {
            address: self.liquidation_sources.clone(),
            topics: vec![vec![AAVE_LIQUIDATION_TOPIC, COMET_ABSORB_TOPIC]],
        })
    }

    /// Run until shutdown: install subscriptions, pump logs, flush the
    /// debounce queue. Rebuilds all subscriptions when a pool is
    /// registered mid-flight or a stream dies.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            let mut merged: SelectAll<crate::rpc::LogStream> = SelectAll::new();
            let mut filters = self.pool_filters();
            if let Some(f) = self.liquidation_filter() {
                filters.push(f);
            }
            let mut installed = 0usize;
            for filter in filters {
                match self.client.subscribe_logs(filter).await {
                    Ok(stream) => {
                        merged.push(stream);
                        installed += 1;
                    }
                    Err(err) => warn!(%err, "log subscription failed"),
                }
            }
            info!(subscriptions = installed, pools = self.pools.len(), "ingestor subscribed");

            if installed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    _ = shutdown.changed() => continue,
                }
            }

            let mut flush_tick = tokio::time::interval(DEBOUNCE_WINDOW / 2);
            flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    _ = self.resubscribe.notified() => {
                        debug!("pool set changed, resubscribing");
                        break;
                    }
                    _ = flush_tick.tick() => {
                        self.flush_pending();
                    }
                    log = merged.next() => {
                        match log {
                            Some(log) => self.handle_log(log),
                            None => {
                                warn!("all log streams ended, resubscribing");
                                tokio::time::sleep(Duration::from_millis(500)).await;
                                break;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Route one raw log. Liquidations skip the debounce (the detector
    /// dedupes by tx/user); pool logs debounce per address.
    pub(crate) fn handle_log(&self, log: Log) {
        let Some(topic0) = log.topics.first().copied() else {
            self.decode_errors.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if topic0 == AAVE_LIQUIDATION_TOPIC || topic0 == COMET_ABSORB_TOPIC {
            self.emit_liquidation(&log);
            return;
        }

        if !self.pools.contains_key(&log.address) {
            return;
        }

        let now = Instant::now();
        let mut slot = self
            .debounce
            .entry(log.address)
            .or_insert_with(|| DebounceSlot {
                last_emit: None,
                pending: None,
            });

        if slot.window_open(now) {
            // Outside the window: emit immediately, preferring a pending
            // event with a higher block (ordering violations tolerated).
            let chosen = match slot.pending.take() {
                Some(pending) => {
                    self.coalesced.fetch_add(1, Ordering::Relaxed);
                    if pending.block_number > log.block_number {
                        pending
                    } else {
                        log
                    }
                }
                None => log,
            };
            slot.last_emit = Some(now);
            drop(slot);
            self.emit_pool_event(&chosen);
        } else {
            // Coalesce: keep the newer event unless it regresses in block.
            let replace = match &slot.pending {
                Some(pending) => log.block_number >= pending.block_number,
                None => true,
            };
            if replace {
                slot.pending = Some(log);
            }
            self.coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Emit pending events whose debounce window has elapsed.
    pub(crate) fn flush_pending(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        for mut slot in self.debounce.iter_mut() {
            if slot.pending.is_some() && slot.window_open(now) {
                slot.last_emit = Some(now);
                due.push(slot.pending.take().unwrap());
            }
        }
        for log in due {
            self.emit_pool_event(&log);
        }
    }

    fn emit_pool_event(&self, log: &Log) {
        let Some(pool) = self.pools.get(&log.address).map(|p| p.clone()) else {
            return;
        };
        let topic0 = log.topics[0];

        if topic0 == SYNC_TOPIC {
            match decoder::decode_sync(log) {
                Ok(fields) => {
                    self.mark_updated(log.block_number, pool.pair.clone());
                    let _ = self.reserve_tx.send(ReserveUpdate {
                        pool: log.address,
                        pair: pool.pair.clone(),
                        reserve0: fields.reserve0,
                        reserve1: fields.reserve1,
                        block_number: log.block_number,
                        tx_hash: log.tx_hash,
                    });
                }
                Err(err) => {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(%err, pool = %log.address, "sync decode failed");
                }
            }
        } else if topic0 == SWAP_TOPIC {
            match decoder::decode_swap(log) {
                Ok(fields) => {
                    self.mark_updated(log.block_number, pool.pair.clone());
                    let _ = self.swap_tx.send(SwapObserved {
                        pool: log.address,
                        pair: pool.pair.clone(),
                        amount0: fields.amount0,
                        amount1: fields.amount1,
                        sqrt_price_x96: fields.sqrt_price_x96,
                        liquidity: fields.liquidity,
                        tick: fields.tick,
                        sender: fields.sender,
                        recipient: fields.recipient,
                        block_number: log.block_number,
                    });
                }
                Err(err) => {
                    self.decode_errors.fetch_add(1, Ordering::Relaxed);
                    debug!(%err, pool = %log.address, "swap decode failed");
                }
            }
        }
    }

    fn emit_liquidation(&self, log: &Log) {
        match decoder::decode_liquidation(log) {
            Ok(fields) => {
                let _ = self.liq_tx.send(LiquidationObserved {
                    protocol: fields.protocol,
                    user: fields.user,
                    collateral_asset: fields.collateral_asset,
                    debt_asset: fields.debt_asset,
                    collateral_amount: fields.collateral_amount,
                    debt_amount: fields.debt_amount,
                    block_number: log.block_number,
                    tx_hash: log.tx_hash,
                });
            }
            Err(err) => {
                self.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!(%err, "liquidation decode failed");
            }
        }
    }

    fn mark_updated(&self, block: u64, pair: PairKey) {
        self.updated.entry(block).or_default().insert(pair);
        // Prune old bookkeeping so the map stays bounded.
        let cutoff = block.saturating_sub(UPDATED_BLOCKS_KEPT);
        self.updated.retain(|b, _| *b >= cutoff);
    }
}
