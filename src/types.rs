//! Core data model: tokens, venues, pools, quotes, opportunities.
//!
//! Tokens and pools are built once at startup from config and never mutated.
//! Quotes are produced continuously by the ingestor and fetcher and owned by
//! the price cache. Opportunities are transient: produced by detectors,
//! scored, optionally handed to the executor, then discarded after being
//! recorded in the dispatcher's bounded history.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// A token loaded from config. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub symbol: String,
    pub address: Address,
    /// Valid range 0..=30, enforced at config load.
    pub decimals: u8,
    /// Quality class used by the scorer (defaults to Unknown).
    #[serde(default)]
    pub class: TokenClass,
    /// Static USD reference for the fallback price table. Stables default
    /// to 1.0 at load; volatile tokens without a hint price as unknown.
    #[serde(default)]
    pub usd_hint: Option<f64>,
}

/// Token quality classes for scoring. The scorer takes the minimum
/// multiplier across all tokens touched by an opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum TokenClass {
    Stable,
    Native,
    BlueChip,
    Volatile,
    Meme,
    #[default]
    Unknown,
}

impl TokenClass {
    /// Quality multiplier applied by the scorer.
    pub fn quality_multiplier(&self) -> f64 {
        match self {
            TokenClass::Stable => 1.0,
            TokenClass::Native => 0.95,
            TokenClass::BlueChip => 0.85,
            TokenClass::Volatile => 0.70,
            TokenClass::Meme => 0.50,
            TokenClass::Unknown => 0.60,
        }
    }
}

/// AMM families the core understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VenueKind {
    /// x*y=k pools with 112-bit reserves (Uniswap V2 forks).
    ConstantProduct,
    /// Concentrated liquidity with sqrtPriceX96/tick (Uniswap V3 forks).
    Concentrated,
    /// Curve-style stableswap.
    Stableswap,
}

/// A DEX deployment on one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub name: String,
    pub kind: VenueKind,
    /// Protocol taker fee as a fraction of input (0.003 = 30 bps).
    pub fee: f64,
    pub chain_id: u64,
}

impl Venue {
    /// Fee in parts-per-million, for integer swap math.
    pub fn fee_ppm(&self) -> u32 {
        (self.fee * 1_000_000.0).round() as u32
    }
}

/// Ordered pair key "BASE/QUOTE" identifying a trading pair irrespective
/// of venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(base: &str, quote: &str) -> Self {
        Self(format!("{}/{}", base, quote))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PairKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Venue-specific pool state, refreshed by events or RPC reads.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolReserves {
    /// V2-style reserves. On-chain these are uint112; U256 here so swap
    /// math never widens mid-computation.
    ConstantProduct { reserve0: U256, reserve1: U256 },
    /// V3-style state snapshot.
    Concentrated {
        sqrt_price_x96: U256,
        liquidity: u128,
        tick: i32,
        fee_tier: u32,
    },
}

/// A pool contract holding one trading pair at one venue.
///
/// Constant-product pools sort tokens by address (token0 < token1); the
/// config loader verifies the invariant so reserve0/reserve1 always map to
/// token0/token1.
#[derive(Debug, Clone)]
pub struct Pool {
    pub address: Address,
    pub venue: String,
    pub kind: VenueKind,
    /// Taker fee fraction (tier fee for concentrated pools).
    pub fee: f64,
    pub token0: Token,
    pub token1: Token,
    pub pair: PairKey,
    pub chain_id: u64,
}

impl Pool {
    /// Fee in parts-per-million for integer swap math.
    pub fn fee_ppm(&self) -> u32 {
        (self.fee * 1_000_000.0).round() as u32
    }
}

/// Where a quote came from. Event-sourced quotes are fresher than RPC
/// fetches and win freshness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QuoteSource {
    SyncEvent,
    SwapEvent,
    RpcFetch,
}

/// Blocks within which an event-sourced quote counts as fresh.
pub const QUOTE_FRESH_BLOCKS: u64 = 2;

/// A single (price, liquidity, block, source) observation for a
/// (pair, venue) at a moment in time.
#[derive(Debug, Clone)]
pub struct Quote {
    pub pair: PairKey,
    pub venue: String,
    /// token1 per token0, decimal adjusted. Narrowed from raw reserves at
    /// the reporting boundary only.
    pub price: f64,
    /// Raw reserves for constant-product venues; None for concentrated.
    pub reserves: Option<(U256, U256)>,
    pub liquidity_usd: f64,
    pub block_number: u64,
    pub observed_at: Instant,
    pub source: QuoteSource,
}

impl Quote {
    /// Event-driven freshness: fresh for block B iff the quote came from an
    /// on-chain log and its block is within QUOTE_FRESH_BLOCKS of B.
    pub fn is_fresh_for(&self, block: u64) -> bool {
        matches!(self.source, QuoteSource::SyncEvent | QuoteSource::SwapEvent)
            && block.saturating_sub(self.block_number) <= QUOTE_FRESH_BLOCKS
    }

    /// Last-writer-wins ordering: a newer block always wins; within the
    /// same block the later observation wins.
    pub fn supersedes(&self, other: &Quote) -> bool {
        (self.block_number, self.observed_at) > (other.block_number, other.observed_at)
    }

    pub fn age(&self) -> std::time::Duration {
        self.observed_at.elapsed()
    }
}

/// Opportunity kinds. Serialized as the wire envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpportunityKind {
    CrossVenue,
    Triangular,
    MultiHop,
    Statistical,
    StableCrossVenue,
    StableTriangular,
    Differential,
    LiquidationBackrun,
    LiquidationBuyCollateral,
    AggregatorRoute,
    NewPair,
}

/// Which part of the pipeline produced the opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunitySource {
    Event,
    Block,
    Differential,
    Statistical,
    Liquidation,
}

fn serialize_u256_dec<S: Serializer>(v: &U256, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&v.to_string())
}

fn serialize_f64_dec<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:.6}", v))
}

/// One swap leg of an opportunity. Every leg references a (pool, direction)
/// that existed at detection time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityLeg {
    pub venue: String,
    pub pool: Address,
    pub token_in: Address,
    pub token_out: Address,
    #[serde(serialize_with = "serialize_u256_dec")]
    pub amount_in: U256,
    #[serde(serialize_with = "serialize_u256_dec")]
    pub amount_out: U256,
    pub fee: f64,
}

/// A detected, not-yet-executed arbitrage opportunity.
///
/// Invariant: `estimated_net_profit = estimated_gross_profit −
/// estimated_gas_cost_usd` (both USD). Enforced by the constructor; the
/// serialized envelope matches the emitted-opportunity wire format.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: Uuid,
    pub chain_id: u64,
    #[serde(rename = "type")]
    pub kind: OpportunityKind,
    pub block_number: u64,
    pub detected_at: DateTime<Utc>,
    pub legs: Vec<OpportunityLeg>,
    #[serde(serialize_with = "serialize_f64_dec")]
    pub estimated_gross_profit: f64,
    pub estimated_gas_cost_usd: f64,
    pub estimated_net_profit: f64,
    pub min_liquidity_usd: f64,
    pub source: OpportunitySource,
    /// Detector confidence in [0, 1].
    pub confidence: f64,
    /// Pairs touched, for prioritizer feedback. Not part of the envelope.
    #[serde(skip)]
    pub pairs: Vec<PairKey>,
}

impl Opportunity {
    /// Build an opportunity, deriving net profit from gross − gas.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u64,
        kind: OpportunityKind,
        block_number: u64,
        legs: Vec<OpportunityLeg>,
        gross_profit_usd: f64,
        gas_cost_usd: f64,
        min_liquidity_usd: f64,
        source: OpportunitySource,
        confidence: f64,
        pairs: Vec<PairKey>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            chain_id,
            kind,
            block_number,
            detected_at: Utc::now(),
            legs,
            estimated_gross_profit: gross_profit_usd,
            estimated_gas_cost_usd: gas_cost_usd,
            estimated_net_profit: gross_profit_usd - gas_cost_usd,
            min_liquidity_usd,
            source,
            confidence: confidence.clamp(0.0, 1.0),
            pairs,
        }
    }

    pub fn is_profitable(&self, min_profit_usd: f64) -> bool {
        self.estimated_net_profit > min_profit_usd
    }
}

/// Terminal states reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecutionStatus {
    Simulated,
    Submitted,
    Included,
    Reverted,
    TimedOut,
}

/// Result handed back by the executor. Timeout handling is the executor's
/// responsibility; the dispatcher imposes no additional wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub tx_hash: Option<B256>,
    pub actual_profit_usd: Option<f64>,
    pub gas_used: Option<u64>,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Simulated | ExecutionStatus::Submitted | ExecutionStatus::Included
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_format() {
        let key = PairKey::new("WETH", "USDC");
        assert_eq!(key.as_str(), "WETH/USDC");
        assert_eq!(key, PairKey::from("WETH/USDC"));
    }

    #[test]
    fn test_quote_freshness_by_source_and_age() {
        let mk = |source, block| Quote {
            pair: PairKey::new("WETH", "USDC"),
            venue: "univ2".into(),
            price: 3500.0,
            reserves: None,
            liquidity_usd: 100_000.0,
            block_number: block,
            observed_at: Instant::now(),
            source,
        };

        // Event-sourced within 2 blocks: fresh
        assert!(mk(QuoteSource::SyncEvent, 100).is_fresh_for(102));
        assert!(mk(QuoteSource::SwapEvent, 100).is_fresh_for(100));
        // Event-sourced but 3 blocks behind: stale
        assert!(!mk(QuoteSource::SyncEvent, 100).is_fresh_for(103));
        // RPC fetch is never "fresh" in the event-driven sense
        assert!(!mk(QuoteSource::RpcFetch, 102).is_fresh_for(102));
    }

    #[test]
    fn test_quote_lww_ordering() {
        let older = Quote {
            pair: PairKey::new("WETH", "USDC"),
            venue: "univ2".into(),
            price: 3500.0,
            reserves: None,
            liquidity_usd: 0.0,
            block_number: 100,
            observed_at: Instant::now(),
            source: QuoteSource::SyncEvent,
        };
        let mut newer_block = older.clone();
        newer_block.block_number = 101;
        assert!(newer_block.supersedes(&older));
        assert!(!older.supersedes(&newer_block));

        // Same block: later observation wins
        let mut later_obs = older.clone();
        later_obs.observed_at = Instant::now() + std::time::Duration::from_millis(5);
        assert!(later_obs.supersedes(&older));
    }

    #[test]
    fn test_opportunity_net_profit_invariant() {
        let opp = Opportunity::new(
            137,
            OpportunityKind::CrossVenue,
            1000,
            vec![],
            8.50,
            0.05,
            50_000.0,
            OpportunitySource::Block,
            0.9,
            vec![PairKey::new("WETH", "USDC")],
        );
        assert!((opp.estimated_net_profit - (8.50 - 0.05)).abs() < 1e-9);
    }

    #[test]
    fn test_opportunity_envelope_shape() {
        let leg = OpportunityLeg {
            venue: "quickswap".into(),
            pool: Address::ZERO,
            token_in: Address::ZERO,
            token_out: Address::ZERO,
            amount_in: U256::from(1_000_000u64),
            amount_out: U256::from(995_000u64),
            fee: 0.003,
        };
        let opp = Opportunity::new(
            137,
            OpportunityKind::Triangular,
            123,
            vec![leg],
            1.25,
            0.05,
            10_000.0,
            OpportunitySource::Event,
            0.8,
            vec![],
        );
        let json = serde_json::to_value(&opp).unwrap();
        assert_eq!(json["type"], "triangular");
        assert_eq!(json["chainId"], 137);
        assert_eq!(json["source"], "event");
        // Amounts serialize as decimal strings, not hex
        assert_eq!(json["legs"][0]["amountIn"], "1000000");
        assert_eq!(json["estimatedGrossProfit"], "1.250000");
        assert!(json["estimatedNetProfit"].is_number());
        // Internal feedback field must not leak into the envelope
        assert!(json.get("pairs").is_none());
    }

    #[test]
    fn test_token_class_multipliers() {
        assert_eq!(TokenClass::Stable.quality_multiplier(), 1.0);
        assert_eq!(TokenClass::Meme.quality_multiplier(), 0.50);
        assert_eq!(TokenClass::default(), TokenClass::Unknown);
    }

    #[test]
    fn test_venue_fee_ppm() {
        let venue = Venue {
            name: "quickswap".into(),
            kind: VenueKind::ConstantProduct,
            fee: 0.003,
            chain_id: 137,
        };
        assert_eq!(venue.fee_ppm(), 3000);
    }
}
