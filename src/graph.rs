//! Price graph: tokens as nodes, venue quotes as parallel directed edges.
//!
//! Built per block from a finite cache snapshot and then read-only for the
//! detectors, so there is no interior locking. Every (pair, venue) quote
//! contributes two edges, one per direction; the best edge for a direction
//! is the one with the highest fee-adjusted rate (equivalently, the lowest
//! fee-adjusted cost of the output token).

use crate::cache::QuoteKey;
use crate::types::{Pool, Quote};
use alloy::primitives::{Address, U256};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// One tradable direction on one venue.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub venue: String,
    pub pool: Address,
    /// Output tokens per input token, decimal adjusted, before fees.
    pub rate: f64,
    /// Taker fee fraction.
    pub fee: f64,
    pub liquidity_usd: f64,
    /// (reserve_in, reserve_out) for constant-product legs, input side
    /// first; None for concentrated venues.
    pub reserves: Option<(U256, U256)>,
    pub fee_ppm: u32,
    pub token_in: Address,
    pub token_out: Address,
    pub decimals_in: u8,
    pub decimals_out: u8,
}

impl GraphEdge {
    /// Rate after the venue fee — the DFS product term.
    pub fn effective_rate(&self) -> f64 {
        self.rate * (1.0 - self.fee)
    }
}

/// Directed multigraph over token symbols.
pub struct PriceGraph {
    graph: DiGraph<String, GraphEdge>,
    nodes: HashMap<String, NodeIndex>,
}

impl PriceGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            nodes: HashMap::new(),
        }
    }

    /// Build from a pool registry plus the quotes currently known for
    /// them. Pools without a quote contribute nothing.
    pub fn from_snapshot<'a>(
        pools: impl IntoIterator<Item = &'a Pool>,
        quotes: &HashMap<QuoteKey, Quote>,
    ) -> Self {
        let mut graph = Self::new();
        for pool in pools {
            let key = QuoteKey::new(pool.pair.clone(), pool.venue.clone());
            if let Some(quote) = quotes.get(&key) {
                graph.add_pool_quote(pool, quote);
            }
        }
        graph
    }

    fn node(&mut self, symbol: &str) -> NodeIndex {
        if let Some(idx) = self.nodes.get(symbol) {
            return *idx;
        }
        let idx = self.graph.add_node(symbol.to_string());
        self.nodes.insert(symbol.to_string(), idx);
        idx
    }

    /// Insert both directions for one pool quote. `quote.price` is token1
    /// per token0, decimal adjusted.
    pub fn add_pool_quote(&mut self, pool: &Pool, quote: &Quote) {
        if quote.price <= 0.0 || !quote.price.is_finite() {
            return;
        }
        let n0 = self.node(&pool.token0.symbol);
        let n1 = self.node(&pool.token1.symbol);
        let fee_ppm = pool.fee_ppm();

        self.graph.add_edge(
            n0,
            n1,
            GraphEdge {
                venue: pool.venue.clone(),
                pool: pool.address,
                rate: quote.price,
                fee: pool.fee,
                liquidity_usd: quote.liquidity_usd,
                reserves: quote.reserves,
                fee_ppm,
                token_in: pool.token0.address,
                token_out: pool.token1.address,
                decimals_in: pool.token0.decimals,
                decimals_out: pool.token1.decimals,
            },
        );
        self.graph.add_edge(
            n1,
            n0,
            GraphEdge {
                venue: pool.venue.clone(),
                pool: pool.address,
                rate: 1.0 / quote.price,
                fee: pool.fee,
                liquidity_usd: quote.liquidity_usd,
                reserves: quote.reserves.map(|(r0, r1)| (r1, r0)),
                fee_ppm,
                token_in: pool.token1.address,
                token_out: pool.token0.address,
                decimals_in: pool.token1.decimals,
                decimals_out: pool.token0.decimals,
            },
        );
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.nodes.contains_key(symbol)
    }

    pub fn token_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|s| s.as_str())
    }

    /// All outgoing edges from a token: (neighbor symbol, edge).
    pub fn edges_from<'a>(
        &'a self,
        symbol: &str,
    ) -> Box<dyn Iterator<Item = (&'a str, &'a GraphEdge)> + 'a> {
        let Some(&idx) = self.nodes.get(symbol) else {
            return Box::new(std::iter::empty());
        };
        Box::new(
            self.graph
                .edges(idx)
                .map(|e| (self.graph[e.target()].as_str(), e.weight())),
        )
    }

    /// Best edge u→v across venues: maximum rate net of fee.
    pub fn best_edge(&self, from: &str, to: &str) -> Option<&GraphEdge> {
        self.edges_from(from)
            .filter(|(target, _)| *target == to)
            .map(|(_, edge)| edge)
            .max_by(|a, b| {
                a.effective_rate()
                    .partial_cmp(&b.effective_rate())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

impl Default for PriceGraph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PairKey, QuoteSource, Token, TokenClass, VenueKind};
    use std::time::Instant;

    fn token(symbol: &str, byte: u8) -> Token {
        Token {
            symbol: symbol.into(),
            address: Address::repeat_byte(byte),
            decimals: 18,
            class: TokenClass::Unknown,
            usd_hint: None,
        }
    }

    fn pool(venue: &str, addr: u8, t0: &str, b0: u8, t1: &str, b1: u8, fee: f64) -> Pool {
        Pool {
            address: Address::repeat_byte(addr),
            venue: venue.into(),
            kind: VenueKind::ConstantProduct,
            fee,
            token0: token(t0, b0),
            token1: token(t1, b1),
            pair: PairKey::new(t0, t1),
            chain_id: 56,
        }
    }

    fn quote(pair: &PairKey, venue: &str, price: f64) -> Quote {
        Quote {
            pair: pair.clone(),
            venue: venue.into(),
            price,
            reserves: Some((U256::from(1_000_000u64), U256::from(2_000_000u64))),
            liquidity_usd: 250_000.0,
            block_number: 10,
            observed_at: Instant::now(),
            source: QuoteSource::RpcFetch,
        }
    }

    #[test]
    fn test_both_directions_inserted() {
        let mut g = PriceGraph::new();
        let p = pool("pancake", 0x10, "WBNB", 1, "USDT", 2, 0.003);
        g.add_pool_quote(&p, &quote(&p.pair, "pancake", 600.0));

        assert_eq!(g.token_count(), 2);
        assert_eq!(g.edge_count(), 2);

        let fwd = g.best_edge("WBNB", "USDT").unwrap();
        assert_eq!(fwd.rate, 600.0);
        let rev = g.best_edge("USDT", "WBNB").unwrap();
        assert!((rev.rate - 1.0 / 600.0).abs() < 1e-12);
        // Reverse leg swaps the reserve orientation
        assert_eq!(rev.reserves, Some((U256::from(2_000_000u64), U256::from(1_000_000u64))));
    }

    #[test]
    fn test_parallel_venues_kept_and_best_selected() {
        let mut g = PriceGraph::new();
        let a = pool("pancake", 0x10, "WBNB", 1, "USDT", 2, 0.003);
        let b = pool("biswap", 0x11, "WBNB", 1, "USDT", 2, 0.001);
        g.add_pool_quote(&a, &quote(&a.pair, "pancake", 600.0));
        g.add_pool_quote(&b, &quote(&b.pair, "biswap", 599.0));

        assert_eq!(g.edge_count(), 4, "parallel edges are retained");

        // 599 × 0.999 > 600 × 0.997: the cheaper-fee venue wins
        let best = g.best_edge("WBNB", "USDT").unwrap();
        assert_eq!(best.venue, "biswap");
    }

    #[test]
    fn test_invalid_price_skipped() {
        let mut g = PriceGraph::new();
        let p = pool("pancake", 0x10, "WBNB", 1, "USDT", 2, 0.003);
        g.add_pool_quote(&p, &quote(&p.pair, "pancake", 0.0));
        g.add_pool_quote(&p, &quote(&p.pair, "pancake", f64::NAN));
        assert_eq!(g.edge_count(), 0);
    }

    #[test]
    fn test_edges_from_unknown_token_is_empty() {
        let g = PriceGraph::new();
        assert_eq!(g.edges_from("NOPE").count(), 0);
    }
}
