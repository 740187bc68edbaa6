//! Cross-venue spread detection with binary-search trade sizing.
//!
//! For every pair quoted on at least two venues, finds the cheapest and
//! dearest venue, nets both taker fees off the spread, and — when raw
//! reserves are available on both legs — sizes the trade by ternary search
//! on the two-leg constant-product profit curve. Concentrated legs without
//! reserves fall back to a probe-notional estimate with a slippage
//! haircut.

use crate::cache::QuoteKey;
use crate::config::DetectionConfig;
use crate::detectors::{clears_thresholds, probe_notional_usd};
use crate::fetcher::PriceSnapshot;
use crate::math::{get_amount_out, optimal_two_leg_size, u256_to_f64};
use crate::oracle::UsdReference;
use crate::types::{
    Opportunity, OpportunityKind, OpportunityLeg, OpportunitySource, PairKey, Pool, Quote,
};
use alloy::primitives::U256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Sizing search range as fractions of the input-side reserve.
const SIZE_MIN_FRACTION: u64 = 10_000; // 0.01%
const SIZE_MAX_FRACTION: u64 = 10; // 10%

/// Haircut applied to probe-notional estimates (no exact sizing).
const ESTIMATE_SLIPPAGE: f64 = 0.10;

pub struct CrossVenueDetector {
    cfg: DetectionConfig,
    usd: Arc<UsdReference>,
    pools_by_pair: HashMap<PairKey, Vec<Pool>>,
    chain_id: u64,
}

impl CrossVenueDetector {
    pub fn new(
        cfg: DetectionConfig,
        usd: Arc<UsdReference>,
        pools: Vec<Pool>,
        chain_id: u64,
    ) -> Self {
        let mut pools_by_pair: HashMap<PairKey, Vec<Pool>> = HashMap::new();
        for pool in pools {
            pools_by_pair.entry(pool.pair.clone()).or_default().push(pool);
        }
        Self {
            cfg,
            usd,
            pools_by_pair,
            chain_id,
        }
    }

    /// Scan the snapshot. Returns partial results if the deadline passes
    /// mid-scan.
    pub async fn scan(
        &self,
        snapshot: &PriceSnapshot,
        block: u64,
        gas_cost_usd: f64,
        deadline: Instant,
    ) -> Vec<Opportunity> {
        let mut out = Vec::new();
        for (pair, pools) in &self.pools_by_pair {
            if Instant::now() >= deadline {
                debug!("cross-venue scan hit block budget, returning partial set");
                break;
            }
            if let Some(opp) = self.check_pair(pair, pools, snapshot, block, gas_cost_usd).await {
                out.push(opp);
            }
        }
        out.sort_by(|a, b| {
            b.estimated_net_profit
                .partial_cmp(&a.estimated_net_profit)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out
    }

    async fn check_pair(
        &self,
        pair: &PairKey,
        pools: &[Pool],
        snapshot: &PriceSnapshot,
        block: u64,
        gas_cost_usd: f64,
    ) -> Option<Opportunity> {
        // Collect (pool, quote) for venues present in this snapshot.
        let quoted: Vec<(&Pool, &Quote)> = pools
            .iter()
            .filter_map(|p| {
                snapshot
                    .get(&QuoteKey::new(pair.clone(), p.venue.clone()))
                    .filter(|q| q.price > 0.0 && q.price.is_finite())
                    .map(|q| (p, q))
            })
            .collect();
        if quoted.len() < 2 {
            return None;
        }

        let (buy_pool, buy_quote) = quoted
            .iter()
            .min_by(|a, b| a.1.price.partial_cmp(&b.1.price).unwrap())?;
        let (sell_pool, sell_quote) = quoted
            .iter()
            .max_by(|a, b| a.1.price.partial_cmp(&b.1.price).unwrap())?;
        if buy_pool.venue == sell_pool.venue {
            return None;
        }

        let gross_spread = (sell_quote.price - buy_quote.price) / buy_quote.price
            - (buy_pool.fee + sell_pool.fee);
        if gross_spread < self.cfg.min_profit_percent / 100.0 {
            return None;
        }

        let min_liquidity = buy_quote.liquidity_usd.min(sell_quote.liquidity_usd);

        // Exact sizing when both legs carry raw reserves.
        let sized = match (buy_quote.reserves, sell_quote.reserves) {
            (Some((b0, b1)), Some((s0, s1))) => {
                self.size_trade(buy_pool, sell_pool, (b0, b1), (s0, s1)).await
            }
            _ => None,
        };

        let (gross_usd, legs, confidence) = match sized {
            Some(v) => v,
            None => {
                // Probe estimate for concentrated legs.
                let notional = probe_notional_usd(min_liquidity);
                let gross = gross_spread * notional * (1.0 - ESTIMATE_SLIPPAGE);
                (gross, Vec::new(), 0.6)
            }
        };

        let net_usd = gross_usd - gas_cost_usd;
        if !clears_thresholds(&self.cfg, gross_spread, net_usd) {
            return None;
        }

        info!(
            pair = %pair,
            buy = %buy_pool.venue,
            sell = %sell_pool.venue,
            spread_pct = gross_spread * 100.0,
            net_usd,
            "cross-venue opportunity"
        );

        Some(Opportunity::new(
            self.chain_id,
            OpportunityKind::CrossVenue,
            block,
            legs,
            gross_usd,
            gas_cost_usd,
            min_liquidity,
            OpportunitySource::Block,
            confidence,
            vec![pair.clone()],
        ))
    }

    /// Ternary-search the round trip: quote token in on the cheap venue,
    /// quote token back out on the dear venue. Reserves are (reserve0,
    /// reserve1) with price = token1/token0, so the input side is token1.
    async fn size_trade(
        &self,
        buy_pool: &Pool,
        sell_pool: &Pool,
        buy_reserves: (U256, U256),
        sell_reserves: (U256, U256),
    ) -> Option<(f64, Vec<OpportunityLeg>, f64)> {
        let (b0, b1) = buy_reserves;
        let (s0, s1) = sell_reserves;
        if b0.is_zero() || b1.is_zero() || s0.is_zero() || s1.is_zero() {
            return None;
        }

        let lo = b1 / U256::from(SIZE_MIN_FRACTION);
        let hi = b1 / U256::from(SIZE_MAX_FRACTION);
        let (size, final_out) = optimal_two_leg_size(
            lo,
            hi,
            b1,
            b0,
            buy_pool.fee_ppm(),
            s0,
            s1,
            sell_pool.fee_ppm(),
        );
        if size.is_zero() || final_out <= size {
            return None;
        }

        let mid = get_amount_out(size, b1, b0, buy_pool.fee_ppm());
        let profit_raw = final_out - size;
        let quote_token = &buy_pool.token1;
        let gross_usd = self
            .usd
            .amount_usd(quote_token.address, profit_raw, quote_token.decimals)
            .await
            .unwrap_or_else(|| {
                // No USD reference: treat the quote token as a dollar proxy.
                u256_to_f64(profit_raw) / 10f64.powi(quote_token.decimals as i32)
            });

        let legs = vec![
            OpportunityLeg {
                venue: buy_pool.venue.clone(),
                pool: buy_pool.address,
                token_in: buy_pool.token1.address,
                token_out: buy_pool.token0.address,
                amount_in: size,
                amount_out: mid,
                fee: buy_pool.fee,
            },
            OpportunityLeg {
                venue: sell_pool.venue.clone(),
                pool: sell_pool.address,
                token_in: sell_pool.token0.address,
                token_out: sell_pool.token1.address,
                amount_in: mid,
                amount_out: final_out,
                fee: sell_pool.fee,
            },
        ];

        Some((gross_usd, legs, 0.9))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StaticPriceTable;
    use crate::types::{QuoteSource, Token, TokenClass, VenueKind};
    use alloy::primitives::Address;
    use std::time::Duration;

    fn token(symbol: &str, byte: u8, decimals: u8, class: TokenClass) -> Token {
        Token {
            symbol: symbol.into(),
            address: Address::repeat_byte(byte),
            decimals,
            class,
            usd_hint: None,
        }
    }

    /// WETH/USDC pool with token0 = WETH, token1 = USDC so the quoted
    /// price (token1 per token0) reads in dollars.
    fn pool(venue: &str, addr: u8, fee: f64) -> Pool {
        Pool {
            address: Address::repeat_byte(addr),
            venue: venue.into(),
            kind: VenueKind::ConstantProduct,
            fee,
            token0: token("WETH", 0x02, 18, TokenClass::BlueChip),
            token1: token("USDC", 0x01, 6, TokenClass::Stable),
            pair: PairKey::new("WETH", "USDC"),
            chain_id: 137,
        }
    }

    fn quote(venue: &str, price: f64, r_weth: u128, r_usdc: u128) -> Quote {
        Quote {
            pair: PairKey::new("WETH", "USDC"),
            venue: venue.into(),
            price,
            reserves: Some((U256::from(r_weth), U256::from(r_usdc))),
            liquidity_usd: 7_000_000.0,
            block_number: 100,
            observed_at: std::time::Instant::now(),
            source: QuoteSource::SyncEvent,
        }
    }

    fn detector(min_profit_usd: f64) -> CrossVenueDetector {
        let cfg = DetectionConfig {
            min_profit_percent: 0.01,
            min_profit_usd,
            ..DetectionConfig::default()
        };
        let mut table = StaticPriceTable::default();
        table.insert(137, Address::repeat_byte(0x01), 1.0); // USDC
        table.insert(137, Address::repeat_byte(0x02), 3500.0); // WETH
        let usd = Arc::new(UsdReference::new(137, table, None));
        CrossVenueDetector::new(
            cfg,
            usd,
            vec![pool("v1", 0x10, 0.0005), pool("v2", 0x11, 0.0005)],
            137,
        )
    }

    fn snapshot(quotes: Vec<Quote>) -> PriceSnapshot {
        quotes
            .into_iter()
            .map(|q| (QuoteKey::new(q.pair.clone(), q.venue.clone()), q))
            .collect()
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_lowest_spread_scenario_detected() {
        // V1 at 3500.0 vs V2 at 3508.5, 1000 WETH pools: buy V1, sell V2.
        let det = detector(0.1);
        let snap = snapshot(vec![
            quote("v1", 3500.0, 1_000_000_000_000_000_000_000, 3_500_000_000_000),
            quote("v2", 3508.5, 1_000_000_000_000_000_000_000, 3_508_500_000_000),
        ]);

        let opps = det.scan(&snap, 100, 0.05, far_deadline()).await;
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_eq!(opp.kind, OpportunityKind::CrossVenue);
        assert_eq!(opp.legs.len(), 2);
        // Buy leg executes on the cheap venue, sell leg on the dear one
        assert_eq!(opp.legs[0].venue, "v1");
        assert_eq!(opp.legs[1].venue, "v2");
        assert!(opp.estimated_gross_profit > 0.0);
        assert!(
            (opp.estimated_net_profit - (opp.estimated_gross_profit - 0.05)).abs() < 1e-9,
            "net = gross − gas"
        );
        assert_eq!(opp.pairs, vec![PairKey::new("WETH", "USDC")]);
    }

    #[tokio::test]
    async fn test_round_trip_fees_kill_thin_spread() {
        // Same 0.24% spread but 30 bps fees per leg: no opportunity.
        let det = CrossVenueDetector::new(
            DetectionConfig::default(),
            Arc::new(UsdReference::new(137, StaticPriceTable::default(), None)),
            vec![pool("v1", 0x10, 0.003), pool("v2", 0x11, 0.003)],
            137,
        );
        let snap = snapshot(vec![
            quote("v1", 3500.0, 1_000_000_000_000_000_000_000, 3_500_000_000_000),
            quote("v2", 3508.5, 1_000_000_000_000_000_000_000, 3_508_500_000_000),
        ]);
        assert!(det.scan(&snap, 100, 0.05, far_deadline()).await.is_empty());
    }

    #[tokio::test]
    async fn test_single_venue_pair_skipped() {
        let det = detector(0.1);
        let snap = snapshot(vec![quote(
            "v1",
            3500.0,
            1_000_000_000_000_000_000_000,
            3_500_000_000_000,
        )]);
        assert!(det.scan(&snap, 100, 0.05, far_deadline()).await.is_empty());
    }

    #[tokio::test]
    async fn test_zero_reserve_leg_yields_nothing() {
        let det = detector(0.1);
        let mut bad = quote("v1", 3500.0, 0, 3_500_000_000_000);
        bad.reserves = Some((U256::ZERO, U256::from(3_500_000_000_000u64)));
        let snap = snapshot(vec![
            bad,
            quote("v2", 3508.5, 1_000_000_000_000_000_000_000, 3_508_500_000_000),
        ]);
        assert!(det.scan(&snap, 100, 0.05, far_deadline()).await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_deadline_returns_partial() {
        let det = detector(0.1);
        let snap = snapshot(vec![
            quote("v1", 3500.0, 1_000_000_000_000_000_000_000, 3_500_000_000_000),
            quote("v2", 3508.5, 1_000_000_000_000_000_000_000, 3_508_500_000_000),
        ]);
        // Deadline already passed: the scan must bail out empty, not hang.
        let opps = det.scan(&snap, 100, 0.05, Instant::now()).await;
        assert!(opps.is_empty());
    }

    #[tokio::test]
    async fn test_min_profit_usd_enforced() {
        // Enormous USD floor: the same profitable spread is filtered.
        let det = detector(1_000_000.0);
        let snap = snapshot(vec![
            quote("v1", 3500.0, 1_000_000_000_000_000_000_000, 3_500_000_000_000),
            quote("v2", 3508.5, 1_000_000_000_000_000_000_000, 3_508_500_000_000),
        ]);
        assert!(det.scan(&snap, 100, 0.05, far_deadline()).await.is_empty());
    }
}
