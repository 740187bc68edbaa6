//! Triangular / multi-hop cycle detection over the price graph.
//!
//! Iterative-deepening DFS from each base token, carrying the cumulative
//! product of fee-adjusted rates and the minimum liquidity along the path.
//! A cycle closing back at the base with product > 1 + threshold is a
//! candidate. Branches are pruned when the running product sinks below the
//! abandon floor, the explored-path budget runs out, or the block deadline
//! passes; whatever was found so far is still returned.

use crate::config::DetectionConfig;
use crate::detectors::{clears_thresholds, probe_notional_usd};
use crate::graph::{GraphEdge, PriceGraph};
use crate::oracle::UsdReference;
use crate::types::{
    Opportunity, OpportunityKind, OpportunityLeg, OpportunitySource, PairKey,
};
use alloy::primitives::U256;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Abandon a branch once its cumulative product sinks below this.
const PRODUCT_FLOOR: f64 = 0.9;

/// Minimum legs for a cycle; 2-edge cycles are cross-venue spreads and
/// belong to that detector.
const MIN_CYCLE_LEGS: usize = 3;

/// One discovered cycle, pre-scoring.
#[derive(Debug, Clone)]
struct CycleCandidate {
    path: Vec<String>,
    edges: Vec<GraphEdge>,
    product: f64,
    min_liquidity_usd: f64,
}

pub struct TriangularDetector {
    cfg: DetectionConfig,
    usd: Arc<UsdReference>,
    chain_id: u64,
}

struct DfsState<'a> {
    graph: &'a PriceGraph,
    base: &'a str,
    deadline: Instant,
    max_paths: usize,
    paths_explored: usize,
    budget_hit: bool,
    candidates: Vec<CycleCandidate>,
    min_product: f64,
    /// Current iterative-deepening level; cycles are recorded only at
    /// exactly this length so deeper passes do not re-find shallow ones.
    target_depth: usize,
}

impl TriangularDetector {
    pub fn new(cfg: DetectionConfig, usd: Arc<UsdReference>, chain_id: u64) -> Self {
        Self { cfg, usd, chain_id }
    }

    /// Scan for profitable cycles from every base token. Partial on
    /// budget or deadline expiry.
    pub async fn scan(
        &self,
        graph: &PriceGraph,
        base_tokens: &[String],
        block: u64,
        gas_cost_usd: f64,
        deadline: Instant,
    ) -> Vec<Opportunity> {
        let mut candidates: Vec<CycleCandidate> = Vec::new();
        let min_product = 1.0 + self.cfg.min_profit_percent / 100.0;

        for base in base_tokens {
            if !graph.contains(base) {
                continue;
            }
            let mut state = DfsState {
                graph,
                base,
                deadline,
                max_paths: self.cfg.max_paths,
                paths_explored: 0,
                budget_hit: false,
                candidates: Vec::new(),
                min_product,
                target_depth: 0,
            };
            // Iterative deepening: shallow cycles surface first even when
            // the path budget bites on dense graphs.
            for depth in MIN_CYCLE_LEGS..=self.cfg.max_depth {
                state.target_depth = depth;
                let mut path = vec![base.clone()];
                let mut edges = Vec::new();
                Self::dfs(&mut state, base, 1.0, f64::INFINITY, depth, &mut path, &mut edges);
                if state.budget_hit {
                    debug!(base, depth, "triangular scan budget exhausted");
                    break;
                }
            }
            candidates.append(&mut state.candidates);
        }

        // Rank: profit desc, then shorter path, then deeper liquidity.
        candidates.sort_by(|a, b| {
            b.product
                .partial_cmp(&a.product)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.path.len().cmp(&b.path.len()))
                .then(
                    b.min_liquidity_usd
                        .partial_cmp(&a.min_liquidity_usd)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
        });
        candidates.dedup_by(|a, b| a.path == b.path);
        candidates.truncate(self.cfg.top_k);

        let mut out = Vec::new();
        for cand in candidates {
            if let Some(opp) = self.to_opportunity(cand, block, gas_cost_usd).await {
                out.push(opp);
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    fn dfs(
        state: &mut DfsState<'_>,
        at: &str,
        product: f64,
        min_liquidity: f64,
        depth_left: usize,
        path: &mut Vec<String>,
        edges: &mut Vec<GraphEdge>,
    ) {
        if state.paths_explored >= state.max_paths || Instant::now() >= state.deadline {
            state.budget_hit = true;
            return;
        }
        state.paths_explored += 1;

        if product < PRODUCT_FLOOR {
            return;
        }

        let neighbors: Vec<(String, GraphEdge)> = state
            .graph
            .edges_from(at)
            .map(|(t, e)| (t.to_string(), e.clone()))
            .collect();

        for (next, edge) in neighbors {
            let new_product = product * edge.effective_rate();
            let new_min_liq = min_liquidity.min(edge.liquidity_usd);

            if next == state.base {
                if edges.len() + 1 == state.target_depth && new_product > state.min_product {
                    let mut cycle_path = path.clone();
                    cycle_path.push(next.clone());
                    let mut cycle_edges = edges.clone();
                    cycle_edges.push(edge.clone());
                    state.candidates.push(CycleCandidate {
                        path: cycle_path,
                        edges: cycle_edges,
                        product: new_product,
                        min_liquidity_usd: new_min_liq,
                    });
                }
                continue;
            }

            if depth_left <= 1 || path.iter().any(|p| p == &next) {
                continue;
            }

            path.push(next.clone());
            edges.push(edge);
            Self::dfs(state, &next, new_product, new_min_liq, depth_left - 1, path, edges);
            path.pop();
            edges.pop();

            if state.budget_hit {
                return;
            }
        }
    }

    async fn to_opportunity(
        &self,
        cand: CycleCandidate,
        block: u64,
        gas_cost_usd: f64,
    ) -> Option<Opportunity> {
        let profit_fraction = cand.product - 1.0;
        let notional_usd = probe_notional_usd(cand.min_liquidity_usd);
        let gross_usd = notional_usd * profit_fraction;
        let net_usd = gross_usd - gas_cost_usd;
        if !clears_thresholds(&self.cfg, profit_fraction, net_usd) {
            return None;
        }

        let legs = self.build_legs(&cand, notional_usd).await;
        let kind = if cand.edges.len() == 3 {
            OpportunityKind::Triangular
        } else {
            OpportunityKind::MultiHop
        };

        let pairs: Vec<PairKey> = cand
            .path
            .windows(2)
            .map(|w| PairKey::new(&w[0], &w[1]))
            .collect();

        info!(
            path = ?cand.path,
            profit_pct = profit_fraction * 100.0,
            net_usd,
            "cycle opportunity"
        );

        Some(Opportunity::new(
            self.chain_id,
            kind,
            block,
            legs,
            gross_usd,
            gas_cost_usd,
            cand.min_liquidity_usd,
            OpportunitySource::Block,
            (profit_fraction * 400.0).clamp(0.3, 0.95),
            pairs,
        ))
    }

    /// Walk the probe notional through the cycle to produce leg amounts in
    /// raw token units. Without a USD reference for the entry token the
    /// legs carry zero amounts (the envelope stays well-formed).
    async fn build_legs(&self, cand: &CycleCandidate, notional_usd: f64) -> Vec<OpportunityLeg> {
        let first = &cand.edges[0];
        let entry_usd = self.usd.price_usd(first.token_in).await;
        let mut units = match entry_usd {
            Some(p) if p > 0.0 => notional_usd / p,
            _ => 0.0,
        };

        let mut legs = Vec::with_capacity(cand.edges.len());
        for edge in &cand.edges {
            let raw_in = units * 10f64.powi(edge.decimals_in as i32);
            let out_units = units * edge.effective_rate();
            let raw_out = out_units * 10f64.powi(edge.decimals_out as i32);
            legs.push(OpportunityLeg {
                venue: edge.venue.clone(),
                pool: edge.pool,
                token_in: edge.token_in,
                token_out: edge.token_out,
                amount_in: f64_to_u256(raw_in),
                amount_out: f64_to_u256(raw_out),
                fee: edge.fee,
            });
            units = out_units;
        }
        legs
    }
}

fn f64_to_u256(v: f64) -> U256 {
    if !v.is_finite() || v <= 0.0 {
        return U256::ZERO;
    }
    // Reporting-boundary narrowing: u128 covers any realistic leg size.
    U256::from(v.min(u128::MAX as f64) as u128)
}
