//! Per-block price refresh.
//!
//! On each block tick the fetcher decides, pair by pair, whether cached
//! data suffices: event-updated pairs with fresh quotes are copied as-is,
//! pairs off their sampling cycle reuse whatever the cache holds, and
//! everything else is read over RPC in multicall batches. Partial RPC
//! failures drop the affected pairs from the snapshot — never an error —
//! and the cache keeps its previous values.

use crate::cache::{PriceCache, QuoteKey};
use crate::math::{price_from_sqrt_x96, spot_price};
use crate::oracle::UsdReference;
use crate::prioritizer::AdaptivePrioritizer;
use crate::rpc::ChainClient;
use crate::types::{PairKey, Pool, PoolReserves, Quote, QuoteSource, VenueKind};
use alloy::primitives::{Address, U256};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Reads per multicall group.
const MULTICALL_BATCH: usize = 50;

/// Snapshot returned to the detectors for one block.
pub type PriceSnapshot = HashMap<QuoteKey, Quote>;

/// Decides refresh-vs-reuse per pair and performs the batched reads.
pub struct PriceFetcher {
    client: Arc<dyn ChainClient>,
    cache: Arc<PriceCache>,
    prioritizer: Arc<AdaptivePrioritizer>,
    usd: Arc<UsdReference>,
    pools_by_pair: HashMap<PairKey, Vec<Pool>>,
}

impl PriceFetcher {
    pub fn new(
        client: Arc<dyn ChainClient>,
        cache: Arc<PriceCache>,
        prioritizer: Arc<AdaptivePrioritizer>,
        usd: Arc<UsdReference>,
        pools: Vec<Pool>,
    ) -> Self {
        let mut pools_by_pair: HashMap<PairKey, Vec<Pool>> = HashMap::new();
        for pool in pools {
            pools_by_pair.entry(pool.pair.clone()).or_default().push(pool);
        }
        Self {
            client,
            cache,
            prioritizer,
            usd,
            pools_by_pair,
        }
    }

    pub fn pair_count(&self) -> usize {
        self.pools_by_pair.len()
    }

    /// Produce the price snapshot for block `block`. `event_updated` is
    /// the ingestor's updated-pairs set for that block.
    pub async fn refresh(&self, block: u64, event_updated: &HashSet<PairKey>) -> PriceSnapshot {
        let mut snapshot: PriceSnapshot = HashMap::new();
        let mut to_fetch: Vec<&Pool> = Vec::new();

        for (pair, pools) in &self.pools_by_pair {
            // Event-fresh pairs: every venue quote is event-sourced and
            // recent, so the cache already reflects this block.
            if event_updated.contains(pair) {
                let all_fresh = pools.iter().all(|p| {
                    self.cache
                        .fresh_for_block(&QuoteKey::new(pair.clone(), p.venue.clone()), block)
                });
                if all_fresh {
                    self.copy_cached(pair, pools, block, &mut snapshot);
                    continue;
                }
            }

            // Off the sampling cycle: reuse whatever is cached, stale or not.
            if !self.prioritizer.should_check(pair, block) {
                self.copy_cached(pair, pools, block, &mut snapshot);
                continue;
            }

            to_fetch.extend(pools.iter());
        }

        if !to_fetch.is_empty() {
            self.fetch_batches(block, &to_fetch, &mut snapshot).await;
        }

        snapshot
    }

    fn copy_cached(&self, pair: &PairKey, pools: &[Pool], block: u64, snapshot: &mut PriceSnapshot) {
        for pool in pools {
            let key = QuoteKey::new(pair.clone(), pool.venue.clone());
            if let Some(quote) = self.cache.get(&key) {
                // Snapshot contract: nothing newer than the block it is for.
                if quote.block_number <= block {
                    snapshot.insert(key, quote);
                }
            }
        }
    }

    async fn fetch_batches(&self, block: u64, pools: &[&Pool], snapshot: &mut PriceSnapshot) {
        for chunk in pools.chunks(MULTICALL_BATCH) {
            let reads: Vec<serde_json::Value> = chunk
                .iter()
                .map(|p| {
                    json!({
                        "pool": p.address,
                        "kind": match p.kind {
                            VenueKind::Concentrated => "slot0",
                            _ => "reserves",
                        },
                    })
                })
                .collect();

            let result = self
                .client
                .call("multicall", json!({ "block": block, "reads": reads }))
                .await;

            let results = match result {
                Ok(serde_json::Value::Array(items)) => items,
                Ok(other) => {
                    warn!(?other, "multicall returned non-array, skipping batch");
                    continue;
                }
                Err(err) => {
                    // Pairs in this batch keep their previous cache entries.
                    warn!(%err, "multicall batch failed");
                    continue;
                }
            };

            for (pool, item) in chunk.iter().zip(results) {
                match parse_pool_read(pool, &item) {
                    Some(reserves) => {
                        if let Some(quote) = self.quote_from_reserves(pool, reserves, block).await {
                            let key = QuoteKey::new(pool.pair.clone(), pool.venue.clone());
                            self.cache.put(quote.clone());
                            snapshot.insert(key, quote);
                        }
                    }
                    None => {
                        debug!(pool = %pool.address, "pool read missing or malformed, omitted");
                    }
                }
            }
        }
    }

    /// Build a Quote from a fresh on-chain read. Empty reserves are a
    /// protocol-level bad state: the pair sits out this block.
    async fn quote_from_reserves(
        &self,
        pool: &Pool,
        reserves: PoolReserves,
        block: u64,
    ) -> Option<Quote> {
        let (price, raw_reserves, liquidity_usd) = match reserves {
            PoolReserves::ConstantProduct { reserve0, reserve1 } => {
                if reserve0.is_zero() || reserve1.is_zero() {
                    return None;
                }
                let price = spot_price(
                    reserve0,
                    reserve1,
                    pool.token0.decimals,
                    pool.token1.decimals,
                );
                let liq = self.usd.cp_liquidity_usd(pool, reserve0, reserve1).await;
                (price, Some((reserve0, reserve1)), liq)
            }
            PoolReserves::Concentrated {
                sqrt_price_x96,
                liquidity,
                ..
            } => {
                if sqrt_price_x96.is_zero() {
                    return None;
                }
                let price = price_from_sqrt_x96(
                    sqrt_price_x96,
                    pool.token0.decimals,
                    pool.token1.decimals,
                );
                let liq = self
                    .usd
                    .concentrated_liquidity_usd(pool, sqrt_price_x96, liquidity)
                    .await;
                (price, None, liq)
            }
        };

        if price <= 0.0 || !price.is_finite() {
            return None;
        }

        Some(Quote {
            pair: pool.pair.clone(),
            venue: pool.venue.clone(),
            price,
            reserves: raw_reserves,
            liquidity_usd,
            block_number: block,
            observed_at: Instant::now(),
            source: QuoteSource::RpcFetch,
        })
    }

}

fn json_u256(v: &serde_json::Value) -> Option<U256> {
    match v {
        serde_json::Value::String(s) => U256::from_str(s).ok(),
        serde_json::Value::Number(n) => n.as_u64().map(U256::from),
        _ => None,
    }
}

/// Parse one multicall read result. `null` means the read failed on the
/// transport side.
fn parse_pool_read(pool: &Pool, item: &serde_json::Value) -> Option<PoolReserves> {
    if item.is_null() {
        return None;
    }
    match pool.kind {
        VenueKind::Concentrated => Some(PoolReserves::Concentrated {
            sqrt_price_x96: json_u256(item.get("sqrtPriceX96")?)?,
            liquidity: json_u256(item.get("liquidity")?)?.try_into().ok()?,
            tick: item.get("tick")?.as_i64()? as i32,
            fee_tier: item
                .get("feeTier")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
        }),
        _ => Some(PoolReserves::ConstantProduct {
            reserve0: json_u256(item.get("reserve0")?)?,
            reserve1: json_u256(item.get("reserve1")?)?,
        }),
    }
}
