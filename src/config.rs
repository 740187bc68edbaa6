//! Typed configuration.
//!
//! The whole surface is explicit serde structs with defaults computed at
//! load time; unknown fields are rejected. Loaded from TOML with an
//! optional .env overlay for the config path itself. Validation runs once
//! at startup — any violation is a ConfigError and the process refuses to
//! start.

use crate::errors::{CoreError, CoreResult};
use crate::types::{PairKey, Pool, Token, TokenClass, Venue, VenueKind};
use alloy::primitives::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub prioritizer: PrioritizerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub flash_loan: FlashLoanConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub id: u64,
    pub name: String,
    pub native_token_symbol: String,
    /// Native token USD reference for gas conversion.
    pub native_usd: f64,
    pub expected_block_ms: u64,
    pub endpoints: Vec<EndpointConfig>,
    pub venues: Vec<VenueConfig>,
    pub tokens: Vec<Token>,
    /// Symbols used as cycle roots by the triangular detector.
    pub base_tokens: Vec<String>,
    /// Monitored pool registry.
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    /// Lending pool contracts watched for liquidation events.
    #[serde(default)]
    pub lending_pools: Vec<Address>,
    /// Chains are enabled by default; opt-out only.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointKind {
    Http,
    Ws,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    pub url: String,
    pub kind: EndpointKind,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VenueConfig {
    pub name: String,
    pub kind: VenueKind,
    /// Taker fee in basis points (30 = 0.30%).
    pub fee_bps: u32,
    pub factory_addr: Address,
    #[serde(default)]
    pub quoter_addr: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfig {
    pub address: Address,
    pub venue: String,
    /// Token symbols; must exist in the chain's token list.
    pub token0: String,
    pub token1: String,
    /// Overrides the venue fee (concentrated tier fee in bps).
    #[serde(default)]
    pub fee_bps: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DetectionConfig {
    /// Minimum executable spread, percent.
    pub min_profit_percent: f64,
    /// Minimum net profit, USD. Both thresholds are enforced unless
    /// `enforce_both_thresholds` relaxes to USD-only.
    pub min_profit_usd: f64,
    pub enforce_both_thresholds: bool,
    pub max_paths: usize,
    pub max_depth: usize,
    /// Top-K triangular candidates kept per scan.
    pub top_k: usize,
    pub z_threshold: f64,
    pub window_size: usize,
    pub min_samples: usize,
    /// Reserve-change magnitude that triggers differential lookups, percent.
    pub significant_change_percent: f64,
    /// Max age of a lagging venue's quote for differential comparison.
    pub max_history_age_ms: u64,
    /// Stablecoin depeg band half-width (0.005 = ±0.5%).
    pub depeg_threshold: f64,
    /// Product-above-one threshold for stable 3-cycles.
    pub stable_arbitrage_threshold: f64,
    pub stable_min_liquidity_usd: f64,
    pub min_liquidation_usd: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_profit_percent: 0.3,
            min_profit_usd: 1.0,
            enforce_both_thresholds: true,
            max_paths: 50_000,
            max_depth: 5,
            top_k: 10,
            z_threshold: 2.0,
            window_size: 100,
            min_samples: 20,
            significant_change_percent: 0.5,
            max_history_age_ms: 30_000,
            depeg_threshold: 0.005,
            stable_arbitrage_threshold: 0.001,
            stable_min_liquidity_usd: 50_000.0,
            min_liquidation_usd: 1_000.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PrioritizerConfig {
    pub high_volume_usd: f64,
    pub low_volume_usd: f64,
    pub low_liquidity_usd: f64,
    /// Interval between decay sweeps.
    pub decay_ms: u64,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        Self {
            high_volume_usd: 1_000_000.0,
            low_volume_usd: 10_000.0,
            low_liquidity_usd: 25_000.0,
            decay_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Detection,
    Simulation,
    Live,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub force_mev_protection: bool,
    /// Minimum composite score for dispatch.
    pub min_score: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Detection,
            force_mev_protection: false,
            min_score: 40.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct FlashLoanConfig {
    pub prefer_zero_fee: bool,
    pub allowed_providers: Vec<String>,
}

/// Composite score weights. Renormalized at load so they sum to 1.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScoringConfig {
    pub profit: f64,
    pub liquidity: f64,
    pub execution_prior: f64,
    pub freshness: f64,
    pub token_quality: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            profit: 0.40,
            liquidity: 0.25,
            execution_prior: 0.20,
            freshness: 0.10,
            token_quality: 0.05,
        }
    }
}

impl ScoringConfig {
    pub fn sum(&self) -> f64 {
        self.profit + self.liquidity + self.execution_prior + self.freshness + self.token_quality
    }

    /// Renormalize so weights sum to 1 ± 0.001. Negative or all-zero
    /// weights are a ConfigError.
    pub fn normalized(mut self) -> CoreResult<Self> {
        for (name, w) in [
            ("profit", self.profit),
            ("liquidity", self.liquidity),
            ("execution_prior", self.execution_prior),
            ("freshness", self.freshness),
            ("token_quality", self.token_quality),
        ] {
            if w < 0.0 || !w.is_finite() {
                return Err(CoreError::Config(format!(
                    "scoring weight {} must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        let sum = self.sum();
        if sum <= 0.0 {
            return Err(CoreError::Config("scoring weights sum to zero".into()));
        }
        if (sum - 1.0).abs() > 0.001 {
            self.profit /= sum;
            self.liquidity /= sum;
            self.execution_prior /= sum;
            self.freshness /= sum;
            self.token_quality /= sum;
        }
        Ok(self)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct AlertsConfig {
    /// Webhook for severe depeg alerts. None disables the sink.
    pub webhook_url: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> CoreResult<Self> {
        let mut cfg: AppConfig = toml::from_str(raw)
            .map_err(|e| CoreError::Config(format!("toml parse: {}", e)))?;
        cfg.scoring = cfg.scoring.clone().normalized()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml_path(path: impl AsRef<Path>) -> CoreResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Config(format!("read {}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn enabled_chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.iter().filter(|c| c.enabled)
    }

    fn validate(&self) -> CoreResult<()> {
        if self.chains.is_empty() {
            return Err(CoreError::Config("no chains configured".into()));
        }
        let mut chain_ids = HashSet::new();
        for chain in &self.chains {
            if !chain_ids.insert(chain.id) {
                return Err(CoreError::Config(format!("duplicate chain id {}", chain.id)));
            }
            chain.validate()?;
        }
        for (name, v) in [
            ("detection.min_profit_percent", self.detection.min_profit_percent),
            ("detection.min_profit_usd", self.detection.min_profit_usd),
            ("detection.z_threshold", self.detection.z_threshold),
            ("detection.depeg_threshold", self.detection.depeg_threshold),
        ] {
            if v <= 0.0 || !v.is_finite() {
                return Err(CoreError::Config(format!("{} must be > 0, got {}", name, v)));
            }
        }
        if self.detection.max_depth < 3 || self.detection.max_depth > 8 {
            return Err(CoreError::Config(format!(
                "detection.max_depth must be in 3..=8, got {}",
                self.detection.max_depth
            )));
        }
        if self.detection.min_samples > self.detection.window_size {
            return Err(CoreError::Config(
                "detection.min_samples exceeds window_size".into(),
            ));
        }
        Ok(())
    }
}

impl ChainConfig {
    fn validate(&self) -> CoreResult<()> {
        if self.enabled && self.endpoints.is_empty() {
            return Err(CoreError::Config(format!(
                "chain {} enabled with no endpoints",
                self.name
            )));
        }
        for ep in &self.endpoints {
            if ep.weight == 0 {
                return Err(CoreError::Config(format!(
                    "chain {}: endpoint {} has zero weight",
                    self.name, ep.url
                )));
            }
        }

        let mut venue_names = HashSet::new();
        for venue in &self.venues {
            if !venue_names.insert(venue.name.as_str()) {
                return Err(CoreError::Config(format!(
                    "chain {}: duplicate venue {}",
                    self.name, venue.name
                )));
            }
            if venue.fee_bps >= 10_000 {
                return Err(CoreError::Config(format!(
                    "chain {}: venue {} fee {} bps is not a taker fee",
                    self.name, venue.name, venue.fee_bps
                )));
            }
        }

        let mut symbols = HashSet::new();
        for token in &self.tokens {
            if token.decimals > 30 {
                return Err(CoreError::Config(format!(
                    "chain {}: token {} decimals {} out of range 0..=30",
                    self.name, token.symbol, token.decimals
                )));
            }
            if !symbols.insert(token.symbol.as_str()) {
                return Err(CoreError::Config(format!(
                    "chain {}: duplicate token symbol {}",
                    self.name, token.symbol
                )));
            }
        }
        for base in &self.base_tokens {
            if !symbols.contains(base.as_str()) {
                return Err(CoreError::Config(format!(
                    "chain {}: base token {} not in token list",
                    self.name, base
                )));
            }
        }
        for pool in &self.pools {
            if !venue_names.contains(pool.venue.as_str()) {
                return Err(CoreError::Config(format!(
                    "chain {}: pool {:?} references unknown venue {}",
                    self.name, pool.address, pool.venue
                )));
            }
            if !symbols.contains(pool.token0.as_str()) || !symbols.contains(pool.token1.as_str()) {
                return Err(CoreError::Config(format!(
                    "chain {}: pool {:?} references unknown token",
                    self.name, pool.address
                )));
            }
            if pool.token0 == pool.token1 {
                return Err(CoreError::Config(format!(
                    "chain {}: pool {:?} pairs a token with itself",
                    self.name, pool.address
                )));
            }
        }
        Ok(())
    }

    pub fn token(&self, symbol: &str) -> Option<&Token> {
        self.tokens.iter().find(|t| t.symbol == symbol)
    }

    pub fn venue(&self, name: &str) -> Option<Venue> {
        self.venues.iter().find(|v| v.name == name).map(|v| Venue {
            name: v.name.clone(),
            kind: v.kind,
            fee: v.fee_bps as f64 / 10_000.0,
            chain_id: self.id,
        })
    }

    /// Tokens classified stable — the depeg/stable-arb universe.
    pub fn stable_tokens(&self) -> Vec<&Token> {
        self.tokens
            .iter()
            .filter(|t| t.class == TokenClass::Stable)
            .collect()
    }

    /// Materialize the pool registry. Constant-product pools are
    /// canonicalized to token0 < token1 by address, mirroring on-chain
    /// ordering; the pair key follows the canonical order.
    pub fn build_pools(&self) -> CoreResult<Vec<Pool>> {
        let mut out = Vec::with_capacity(self.pools.len());
        for pc in &self.pools {
            let venue = self.venue(&pc.venue).ok_or_else(|| {
                CoreError::Config(format!("pool {:?}: unknown venue {}", pc.address, pc.venue))
            })?;
            let a = self
                .token(&pc.token0)
                .ok_or_else(|| CoreError::Config(format!("unknown token {}", pc.token0)))?
                .clone();
            let b = self
                .token(&pc.token1)
                .ok_or_else(|| CoreError::Config(format!("unknown token {}", pc.token1)))?
                .clone();

            let (token0, token1) = if a.address < b.address { (a, b) } else { (b, a) };
            let fee = pc
                .fee_bps
                .map(|bps| bps as f64 / 10_000.0)
                .unwrap_or(venue.fee);

            out.push(Pool {
                address: pc.address,
                venue: venue.name.clone(),
                kind: venue.kind,
                fee,
                pair: PairKey::new(&token0.symbol, &token1.symbol),
                token0,
                token1,
                chain_id: self.id,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [[chains]]
        id = 137
        name = "polygon"
        native_token_symbol = "MATIC"
        native_usd = 0.5
        expected_block_ms = 2000
        base_tokens = ["WETH"]

        [[chains.endpoints]]
        url = "wss://example.invalid/ws"
        kind = "ws"
        weight = 3

        [[chains.endpoints]]
        url = "https://example.invalid/rpc"
        kind = "http"

        [[chains.venues]]
        name = "quickswap"
        kind = "constantProduct"
        fee_bps = 30
        factory_addr = "0x5757371414417b8C6CAad45bAeF941aBc7d3Ab32"

        [[chains.venues]]
        name = "sushiswap"
        kind = "constantProduct"
        fee_bps = 30
        factory_addr = "0xc35DADB65012eC5796536bD9864eD8773aBc74C4"

        [[chains.tokens]]
        symbol = "WETH"
        address = "0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619"
        decimals = 18
        class = "blueChip"

        [[chains.tokens]]
        symbol = "USDC"
        address = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
        decimals = 6
        class = "stable"

        [[chains.pools]]
        address = "0x853Ee4b2A13f8a742d64C8F088bE7bA2131f670d"
        venue = "quickswap"
        token0 = "WETH"
        token1 = "USDC"
    "#;

    #[test]
    fn test_minimal_config_loads() {
        let cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(cfg.chains.len(), 1);
        assert!(cfg.chains[0].enabled, "chains are enabled by default");
        assert_eq!(cfg.detection.max_paths, 50_000);
        assert_eq!(cfg.execution.min_score, 40.0);
        assert!((cfg.scoring.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = format!("{}\nnot_a_field = 1\n", MINIMAL);
        assert!(AppConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn test_duplicate_venue_rejected() {
        let raw = MINIMAL.replace("name = \"sushiswap\"", "name = \"quickswap\"");
        let err = AppConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate venue"));
    }

    #[test]
    fn test_pool_canonical_token_order() {
        let cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        let pools = cfg.chains[0].build_pools().unwrap();
        assert_eq!(pools.len(), 1);
        // USDC (0x2791...) sorts below WETH (0x7ceB...)
        assert_eq!(pools[0].token0.symbol, "USDC");
        assert_eq!(pools[0].token1.symbol, "WETH");
        assert_eq!(pools[0].pair, PairKey::new("USDC", "WETH"));
        assert!((pools[0].fee - 0.003).abs() < 1e-12);
    }

    #[test]
    fn test_scoring_renormalization() {
        // Double every weight: still accepted, renormalized to sum 1.
        let raw = format!(
            "{}\n[scoring]\nprofit = 0.8\nliquidity = 0.5\nexecution_prior = 0.4\nfreshness = 0.2\ntoken_quality = 0.1\n",
            MINIMAL
        );
        let cfg = AppConfig::from_toml_str(&raw).unwrap();
        assert!((cfg.scoring.sum() - 1.0).abs() < 0.001);
        assert!((cfg.scoring.profit - 0.40).abs() < 1e-9);
    }

    #[test]
    fn test_nonsensical_threshold_rejected() {
        let raw = format!("{}\n[detection]\nmin_profit_percent = -1.0\n", MINIMAL);
        assert!(AppConfig::from_toml_str(&raw).is_err());
    }

    #[test]
    fn test_stable_token_set() {
        let cfg = AppConfig::from_toml_str(MINIMAL).unwrap();
        let stables = cfg.chains[0].stable_tokens();
        assert_eq!(stables.len(), 1);
        assert_eq!(stables[0].symbol, "USDC");
    }
}
