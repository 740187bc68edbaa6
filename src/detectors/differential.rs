//! Differential (lag) detection.
//!
//! A significant reserve change on one venue opens a short-lived window
//! before the other venues for the same pair catch up. On each
//! ReserveUpdate the detector compares the new reserves against the
//! previous ones for that pool; a move past the significance threshold
//! triggers a spread check against every other venue whose quote is still
//! inside the history-age window.
//!
//! Idempotency: redelivered updates carry identical reserves, produce a
//! zero-magnitude delta, and fall out at the threshold check.

use crate::cache::PriceCache;
use crate::config::DetectionConfig;
use crate::detectors::{clears_thresholds, probe_notional_usd};
use crate::ingest::ReserveUpdate;
use crate::math::{spot_price, u256_to_f64};
use crate::types::{
    Opportunity, OpportunityKind, OpportunityLeg, OpportunitySource, PairKey, Pool,
};
use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct DifferentialDetector {
    cfg: DetectionConfig,
    cache: Arc<PriceCache>,
    pools_by_address: HashMap<Address, Pool>,
    prev_reserves: DashMap<Address, (U256, U256)>,
    chain_id: u64,
}

impl DifferentialDetector {
    pub fn new(
        cfg: DetectionConfig,
        cache: Arc<PriceCache>,
        pools: Vec<Pool>,
        chain_id: u64,
    ) -> Self {
        Self {
            cfg,
            cache,
            pools_by_address: pools.into_iter().map(|p| (p.address, p)).collect(),
            prev_reserves: DashMap::new(),
            chain_id,
        }
    }

    /// Relative reserve move: max(|Δr0|/r0, |Δr1|/r1).
    fn magnitude(prev: (U256, U256), next: (U256, U256)) -> f64 {
        let rel = |old: U256, new: U256| -> f64 {
            if old.is_zero() {
                return 0.0;
            }
            let delta = if new > old { new - old } else { old - new };
            u256_to_f64(delta) / u256_to_f64(old)
        };
        rel(prev.0, next.0).max(rel(prev.1, next.1))
    }

    /// Consume one reserve update; returns any lag opportunities it opens.
    pub fn on_reserve_update(&self, update: &ReserveUpdate, gas_cost_usd: f64) -> Vec<Opportunity> {
        let Some(trigger_pool) = self.pools_by_address.get(&update.pool) else {
            return Vec::new();
        };
        let next = (update.reserve0, update.reserve1);
        let prev = self.prev_reserves.insert(update.pool, next);

        let Some(prev) = prev else {
            // First observation: nothing to compare against.
            return Vec::new();
        };

        let magnitude = Self::magnitude(prev, next);
        if magnitude < self.cfg.significant_change_percent / 100.0 {
            return Vec::new();
        }

        let trigger_price = spot_price(
            update.reserve0,
            update.reserve1,
            trigger_pool.token0.decimals,
            trigger_pool.token1.decimals,
        );
        if trigger_price <= 0.0 || !trigger_price.is_finite() {
            return Vec::new();
        }

        debug!(
            pair = %update.pair,
            venue = %trigger_pool.venue,
            magnitude_pct = magnitude * 100.0,
            "significant reserve change"
        );

        let max_age = Duration::from_millis(self.cfg.max_history_age_ms);
        let mut out = Vec::new();

        for (venue, lagging) in self.cache.get_pair(&update.pair) {
            if venue == trigger_pool.venue || lagging.age() > max_age {
                continue;
            }
            let spread = (lagging.price - trigger_price).abs()
                / trigger_price.min(lagging.price);
            let round_trip_fee = trigger_pool.fee * 2.0;
            let executable = spread - round_trip_fee;
            if executable < self.cfg.min_profit_percent / 100.0 {
                continue;
            }

            let min_liq = lagging.liquidity_usd;
            let notional = probe_notional_usd(min_liq);
            let gross_usd = executable * notional;
            let net_usd = gross_usd - gas_cost_usd;
            if !clears_thresholds(&self.cfg, executable, net_usd) {
                continue;
            }

            let lag_ms = lagging.age().as_millis() as u64;
            // Direction is the action on the lagging venue: buy there when
            // it is now the cheap side.
            let lagging_is_cheap = lagging.price < trigger_price;

            info!(
                pair = %update.pair,
                trigger = %trigger_pool.venue,
                lagging = %venue,
                lag_ms,
                spread_pct = executable * 100.0,
                direction = if lagging_is_cheap { "buy" } else { "sell" },
                "differential opportunity"
            );

            let legs = self.build_legs(trigger_pool, &venue, lagging_is_cheap, update);
            out.push(Opportunity::new(
                self.chain_id,
                OpportunityKind::Differential,
                update.block_number,
                legs,
                gross_usd,
                gas_cost_usd,
                min_liq,
                OpportunitySource::Differential,
                // The shorter the lag, the likelier the window is real.
                (1.0 - lag_ms as f64 / self.cfg.max_history_age_ms as f64).clamp(0.3, 0.95),
                vec![update.pair.clone()],
            ));
        }
        out
    }

    /// Buy leg on the cheap side, sell leg on the dear side. Amounts stay
    /// zero here: lag opportunities re-size at execution time because the
    /// lagging quote is, by definition, about to move.
    fn build_legs(
        &self,
        trigger_pool: &Pool,
        lagging_venue: &str,
        lagging_is_cheap: bool,
        update: &ReserveUpdate,
    ) -> Vec<OpportunityLeg> {
        let lagging_pool = self
            .pools_by_address
            .values()
            .find(|p| p.pair == update.pair && p.venue == lagging_venue);
        let Some(lagging_pool) = lagging_pool else {
            return Vec::new();
        };

        let (buy, sell) = if lagging_is_cheap {
            (lagging_pool, trigger_pool)
        } else {
            (trigger_pool, lagging_pool)
        };
        vec![
            OpportunityLeg {
                venue: buy.venue.clone(),
                pool: buy.address,
                token_in: buy.token1.address,
                token_out: buy.token0.address,
                amount_in: U256::ZERO,
                amount_out: U256::ZERO,
                fee: buy.fee,
            },
            OpportunityLeg {
                venue: sell.venue.clone(),
                pool: sell.address,
                token_in: sell.token0.address,
                token_out: sell.token1.address,
                amount_in: U256::ZERO,
                amount_out: U256::ZERO,
                fee: sell.fee,
            },
        ]
    }
}
