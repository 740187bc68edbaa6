//! Stablecoin surveillance: depeg bands, stable-pair arbitrage, and
//! stable 3-cycles.
//!
//! Works over the chain's configured stable set. Depeg classification is
//! by deviation from parity in multiples of the configured band; a severe
//! depeg produces a non-trade alert for the webhook sink rather than an
//! opportunity. Arbitrage paths reuse the cross-venue machinery with
//! stable-specific liquidity and profit floors.

use crate::cache::QuoteKey;
use crate::config::DetectionConfig;
use crate::detectors::cross_venue::CrossVenueDetector;
use crate::fetcher::PriceSnapshot;
use crate::graph::PriceGraph;
use crate::oracle::UsdReference;
use crate::types::{
    Opportunity, OpportunityKind, OpportunitySource, PairKey, Pool, Token,
};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Deviation bands in multiples of `depeg_threshold`.
const MODERATE_MULTIPLE: f64 = 2.0;
const SEVERE_MULTIPLE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepegSeverity {
    Minor,
    Moderate,
    Severe,
}

/// Non-trade alert raised when a stable pair trades off parity.
#[derive(Debug, Clone)]
pub struct DepegAlert {
    pub pair: PairKey,
    pub venue: String,
    pub price: f64,
    pub severity: DepegSeverity,
    pub block_number: u64,
}

pub struct StablecoinDetector {
    cfg: DetectionConfig,
    cross: CrossVenueDetector,
    stable_symbols: Vec<String>,
    chain_id: u64,
}

impl StablecoinDetector {
    pub fn new(
        cfg: DetectionConfig,
        usd: Arc<UsdReference>,
        pools: Vec<Pool>,
        stable_tokens: &[Token],
        chain_id: u64,
    ) -> Self {
        let stable_symbols: Vec<String> =
            stable_tokens.iter().map(|t| t.symbol.clone()).collect();
        // Stable pools only, scanned with stable-specific floors.
        let stable_pools: Vec<Pool> = pools
            .into_iter()
            .filter(|p| {
                stable_symbols.contains(&p.token0.symbol)
                    && stable_symbols.contains(&p.token1.symbol)
            })
            .collect();
        let stable_cfg = DetectionConfig {
            min_profit_percent: cfg.stable_arbitrage_threshold * 100.0,
            ..cfg.clone()
        };
        Self {
            cross: CrossVenueDetector::new(stable_cfg, usd, stable_pools, chain_id),
            cfg,
            stable_symbols,
            chain_id,
        }
    }

    /// Full stable sweep for one block: depeg checks, cross-venue arb,
    /// 3-cycles. Returns opportunities and any depeg alerts.
    pub async fn scan(
        &self,
        snapshot: &PriceSnapshot,
        graph: &PriceGraph,
        block: u64,
        gas_cost_usd: f64,
        deadline: Instant,
    ) -> (Vec<Opportunity>, Vec<DepegAlert>) {
        let alerts = self.depeg_check(snapshot, block);

        let mut opportunities: Vec<Opportunity> = self
            .cross
            .scan(snapshot, block, gas_cost_usd, deadline)
            .await
            .into_iter()
            .map(|mut opp| {
                opp.kind = OpportunityKind::StableCrossVenue;
                opp
            })
            .filter(|opp| opp.min_liquidity_usd >= self.cfg.stable_min_liquidity_usd)
            .collect();

        opportunities.extend(self.stable_cycles(graph, block, gas_cost_usd));
        (opportunities, alerts)
    }

    /// Classify every stable-pair venue quote against the parity band.
    fn depeg_check(&self, snapshot: &PriceSnapshot, block: u64) -> Vec<DepegAlert> {
        let mut alerts = Vec::new();
        for (key, quote) in snapshot {
            if !self.is_stable_pair(&key.pair) {
                continue;
            }
            let deviation = (quote.price - 1.0).abs();
            if deviation <= self.cfg.depeg_threshold {
                continue;
            }
            let severity = if deviation >= SEVERE_MULTIPLE * self.cfg.depeg_threshold {
                DepegSeverity::Severe
            } else if deviation >= MODERATE_MULTIPLE * self.cfg.depeg_threshold {
                DepegSeverity::Moderate
            } else {
                DepegSeverity::Minor
            };
            if severity == DepegSeverity::Severe {
                warn!(
                    pair = %key.pair,
                    venue = %key.venue,
                    price = quote.price,
                    "severe stablecoin depeg"
                );
            }
            alerts.push(DepegAlert {
                pair: key.pair.clone(),
                venue: key.venue.clone(),
                price: quote.price,
                severity,
                block_number: block,
            });
        }
        alerts
    }

    fn is_stable_pair(&self, pair: &PairKey) -> bool {
        let mut parts = pair.as_str().split('/');
        match (parts.next(), parts.next()) {
            (Some(a), Some(b)) => {
                self.stable_symbols.iter().any(|s| s == a)
                    && self.stable_symbols.iter().any(|s| s == b)
            }
            _ => false,
        }
    }

    /// Enumerate all 3-cycles over the stable set using the best venue per
    /// edge. Small set, exhaustive enumeration is fine.
    fn stable_cycles(&self, graph: &PriceGraph, block: u64, gas_cost_usd: f64) -> Vec<Opportunity> {
        let mut out = Vec::new();
        let n = self.stable_symbols.len();
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    if i == j || j == k || i == k {
                        continue;
                    }
                    // Fix the rotation: the cycle starts at its smallest
                    // index so each triangle is scored once per direction.
                    if !(i < j && i < k) {
                        continue;
                    }
                    let (a, b, c) = (
                        &self.stable_symbols[i],
                        &self.stable_symbols[j],
                        &self.stable_symbols[k],
                    );
                    let Some(e1) = graph.best_edge(a, b) else { continue };
                    let Some(e2) = graph.best_edge(b, c) else { continue };
                    let Some(e3) = graph.best_edge(c, a) else { continue };

                    let product =
                        e1.effective_rate() * e2.effective_rate() * e3.effective_rate();
                    if product <= 1.0 + self.cfg.stable_arbitrage_threshold {
                        continue;
                    }

                    let min_liq = e1
                        .liquidity_usd
                        .min(e2.liquidity_usd)
                        .min(e3.liquidity_usd);
                    if min_liq < self.cfg.stable_min_liquidity_usd {
                        continue;
                    }
                    let notional = crate::detectors::probe_notional_usd(min_liq);
                    let gross_usd = (product - 1.0) * notional;
                    let net_usd = gross_usd - gas_cost_usd;
                    if net_usd <= self.cfg.min_profit_usd {
                        continue;
                    }

                    info!(
                        cycle = %format!("{a}->{b}->{c}->{a}"),
                        product,
                        net_usd,
                        "stable triangle"
                    );
                    out.push(Opportunity::new(
                        self.chain_id,
                        OpportunityKind::StableTriangular,
                        block,
                        Vec::new(),
                        gross_usd,
                        gas_cost_usd,
                        min_liq,
                        OpportunitySource::Block,
                        0.8,
                        vec![
                            PairKey::new(a, b),
                            PairKey::new(b, c),
                            PairKey::new(c, a),
                        ],
                    ));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::StaticPriceTable;
    use crate::types::{Quote, QuoteSource, TokenClass, VenueKind};
    use alloy::primitives::{Address, U256};
    use std::time::Duration;

    fn stable(symbol: &str, byte: u8) -> Token {
        Token {
            symbol: symbol.into(),
            address: Address::repeat_byte(byte),
            decimals: 6,
            class: TokenClass::Stable,
            usd_hint: None,
        }
    }

    fn stable_pool(venue: &str, addr: u8, t0: &Token, t1: &Token) -> Pool {
        Pool {
            address: Address::repeat_byte(addr),
            venue: venue.into(),
            kind: VenueKind::ConstantProduct,
            fee: 0.0001,
            token0: t0.clone(),
            token1: t1.clone(),
            pair: PairKey::new(&t0.symbol, &t1.symbol),
            chain_id: 137,
        }
    }

    fn quote(pair: &PairKey, venue: &str, price: f64, liq: f64) -> Quote {
        Quote {
            pair: pair.clone(),
            venue: venue.into(),
            price,
            reserves: Some((
                U256::from(500_000_000_000u64),
                U256::from((500_000_000_000f64 * price) as u64),
            )),
            liquidity_usd: liq,
            block_number: 100,
            observed_at: std::time::Instant::now(),
            source: QuoteSource::SyncEvent,
        }
    }

    fn detector() -> (StablecoinDetector, Vec<Token>, Vec<Pool>) {
        let usdc = stable("USDC", 0x01);
        let usdt = stable("USDT", 0x02);
        let dai = stable("DAI", 0x03);
        let pools = vec![
            stable_pool("curve", 0x10, &usdc, &usdt),
            stable_pool("quickswap", 0x11, &usdc, &usdt),
            stable_pool("curve", 0x12, &usdt, &dai),
            stable_pool("curve", 0x13, &dai, &usdc),
        ];
        let tokens = vec![usdc, usdt, dai];
        let cfg = DetectionConfig {
            min_profit_usd: 0.1,
            stable_min_liquidity_usd: 10_000.0,
            ..DetectionConfig::default()
        };
        let mut table = StaticPriceTable::default();
        for t in &tokens {
            table.insert(137, t.address, 1.0);
        }
        let det = StablecoinDetector::new(
            cfg,
            Arc::new(UsdReference::new(137, table, None)),
            pools.clone(),
            &tokens,
            137,
        );
        (det, tokens, pools)
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_depeg_severity_bands() {
        let (det, _, _) = detector();
        let pair = PairKey::new("USDC", "USDT");
        let mut snapshot = PriceSnapshot::new();
        // threshold 0.005: 0.6% minor, 1.2% moderate, 4% severe
        for (venue, price) in [("a", 0.994), ("b", 0.988), ("c", 0.96), ("d", 1.001)] {
            snapshot.insert(QuoteKey::new(pair.clone(), venue), quote(&pair, venue, price, 1e6));
        }

        let (_, alerts) = det
            .scan(&snapshot, &PriceGraph::new(), 100, 0.01, far_deadline())
            .await;
        assert_eq!(alerts.len(), 3, "the 1.001 quote is inside the band");
        let severity_of = |venue: &str| {
            alerts
                .iter()
                .find(|a| a.venue == venue)
                .map(|a| a.severity)
                .unwrap()
        };
        assert_eq!(severity_of("a"), DepegSeverity::Minor);
        assert_eq!(severity_of("b"), DepegSeverity::Moderate);
        assert_eq!(severity_of("c"), DepegSeverity::Severe);
    }

    #[tokio::test]
    async fn test_stable_cross_venue_rekinded() {
        let (det, _, _) = detector();
        let pair = PairKey::new("USDC", "USDT");
        let mut snapshot = PriceSnapshot::new();
        snapshot.insert(
            QuoteKey::new(pair.clone(), "curve"),
            quote(&pair, "curve", 0.9985, 5_000_000.0),
        );
        snapshot.insert(
            QuoteKey::new(pair.clone(), "quickswap"),
            quote(&pair, "quickswap", 1.0015, 5_000_000.0),
        );

        let (opps, _) = det
            .scan(&snapshot, &PriceGraph::new(), 100, 0.01, far_deadline())
            .await;
        assert!(!opps.is_empty());
        assert!(opps
            .iter()
            .all(|o| o.kind == OpportunityKind::StableCrossVenue));
    }

    #[tokio::test]
    async fn test_stable_triangle_over_best_edges() {
        let (det, tokens, pools) = detector();
        let mut graph = PriceGraph::new();
        // USDC→USDT cheap, USDT→DAI at parity, DAI→USDC slightly rich:
        // product ≈ 1.003 × 1.0 × 1.001 × (1−1bp)³ ≈ 1.0037
        graph.add_pool_quote(&pools[0], &quote(&pools[0].pair, "curve", 1.003, 1e6));
        graph.add_pool_quote(&pools[2], &quote(&pools[2].pair, "curve", 1.0, 1e6));
        graph.add_pool_quote(&pools[3], &quote(&pools[3].pair, "curve", 1.001, 1e6));

        let (opps, _) = det
            .scan(&PriceSnapshot::new(), &graph, 100, 0.01, far_deadline())
            .await;
        let triangle = opps
            .iter()
            .find(|o| o.kind == OpportunityKind::StableTriangular)
            .expect("stable triangle expected");
        assert_eq!(triangle.pairs.len(), 3);
        assert!(triangle.estimated_net_profit > 0.0);
        let _ = tokens;
    }

    #[tokio::test]
    async fn test_thin_stable_pool_filtered() {
        let (det, _, _) = detector();
        let pair = PairKey::new("USDC", "USDT");
        let mut snapshot = PriceSnapshot::new();
        // Wide spread but liquidity below the stable floor
        snapshot.insert(
            QuoteKey::new(pair.clone(), "curve"),
            quote(&pair, "curve", 0.997, 2_000.0),
        );
        snapshot.insert(
            QuoteKey::new(pair.clone(), "quickswap"),
            quote(&pair, "quickswap", 1.003, 2_000.0),
        );
        let (opps, _) = det
            .scan(&snapshot, &PriceGraph::new(), 100, 0.01, far_deadline())
            .await;
        assert!(opps.is_empty());
    }
}
