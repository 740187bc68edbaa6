//! Whale activity tracking.
//!
//! Watches the swap stream for outsized trades. Large swaps concentrate
//! opportunity: the tracker keeps a short rolling window per pair and
//! feeds the aggregate volume back into the prioritizer so busy pairs get
//! promoted ahead of their next opportunity.

use crate::oracle::UsdReference;
use crate::prioritizer::AdaptivePrioritizer;
use crate::ingest::SwapObserved;
use crate::types::{PairKey, Pool};
use alloy::primitives::Address;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Rolling volume window.
const VOLUME_WINDOW: Duration = Duration::from_secs(300);

/// Retained whale observations.
const RECENT_CAP: usize = 256;

/// One qualifying swap.
#[derive(Debug, Clone)]
pub struct WhaleSwap {
    pub pair: PairKey,
    pub venue: String,
    pub pool: Address,
    pub sender: Address,
    pub value_usd: f64,
    pub block_number: u64,
    pub observed_at: Instant,
}

pub struct WhaleTracker {
    pools_by_address: HashMap<Address, Pool>,
    usd: Arc<UsdReference>,
    prioritizer: Arc<AdaptivePrioritizer>,
    threshold_usd: f64,
    recent: Mutex<VecDeque<WhaleSwap>>,
}

impl WhaleTracker {
    pub fn new(
        pools: Vec<Pool>,
        usd: Arc<UsdReference>,
        prioritizer: Arc<AdaptivePrioritizer>,
        threshold_usd: f64,
    ) -> Self {
        Self {
            pools_by_address: pools.into_iter().map(|p| (p.address, p)).collect(),
            usd,
            prioritizer,
            threshold_usd,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAP)),
        }
    }

    /// Consume one observed swap; records it when the notional clears the
    /// whale threshold and refreshes the pair's rolling volume.
    pub async fn on_swap(&self, swap: &SwapObserved) {
        let Some(pool) = self.pools_by_address.get(&swap.pool) else {
            return;
        };

        // Notional: value the token0 side; fall back to token1 when the
        // oracle has no reference for token0.
        let amount0 = swap.amount0.unsigned_abs();
        let amount1 = swap.amount1.unsigned_abs();
        let value_usd = match self
            .usd
            .amount_usd(pool.token0.address, amount0, pool.token0.decimals)
            .await
        {
            Some(v) if v > 0.0 => v,
            _ => self
                .usd
                .amount_usd(pool.token1.address, amount1, pool.token1.decimals)
                .await
                .unwrap_or(0.0),
        };

        if value_usd < self.threshold_usd {
            return;
        }

        info!(
            pair = %swap.pair,
            venue = %pool.venue,
            value_usd,
            sender = %swap.sender,
            "whale swap"
        );

        let now = Instant::now();
        let rolling = {
            let mut recent = self.recent.lock().unwrap();
            if recent.len() == RECENT_CAP {
                recent.pop_front();
            }
            recent.push_back(WhaleSwap {
                pair: swap.pair.clone(),
                venue: pool.venue.clone(),
                pool: swap.pool,
                sender: swap.sender,
                value_usd,
                block_number: swap.block_number,
                observed_at: now,
            });
            recent
                .iter()
                .filter(|w| {
                    w.pair == swap.pair && now.duration_since(w.observed_at) <= VOLUME_WINDOW
                })
                .map(|w| w.value_usd)
                .sum::<f64>()
        };

        debug!(pair = %swap.pair, rolling, "whale volume updated");
        self.prioritizer.update_volume(&swap.pair, rolling);
    }

    /// Most recent whale swaps, newest last.
    pub fn recent(&self, n: usize) -> Vec<WhaleSwap> {
        let recent = self.recent.lock().unwrap();
        recent.iter().rev().take(n).rev().cloned().collect()
    }
}
