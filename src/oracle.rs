//! USD price references.
//!
//! Detectors convert token profits to USD through the `PriceOracle` port;
//! when no external oracle is wired in, a static table built from config
//! answers: stables at 1.0, the native token at its configured reference,
//! anything else from its explicit hint or not at all.

use crate::config::ChainConfig;
use crate::types::TokenClass;
use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// External price feed port. Optional; `None` answers are expected.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price_usd(&self, token: Address, chain_id: u64) -> Option<f64>;
}

/// Static per-chain USD references built at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticPriceTable {
    prices: HashMap<(u64, Address), f64>,
}

impl StaticPriceTable {
    pub fn from_chain(chain: &ChainConfig) -> Self {
        let mut prices = HashMap::new();
        for token in &chain.tokens {
            let usd = match (token.usd_hint, token.class) {
                (Some(hint), _) => Some(hint),
                (None, TokenClass::Stable) => Some(1.0),
                (None, _) if token.symbol == chain.native_token_symbol => Some(chain.native_usd),
                _ => None,
            };
            if let Some(usd) = usd {
                prices.insert((chain.id, token.address), usd);
            }
        }
        Self { prices }
    }

    pub fn insert(&mut self, chain_id: u64, token: Address, usd: f64) {
        self.prices.insert((chain_id, token), usd);
    }

    pub fn get(&self, chain_id: u64, token: Address) -> Option<f64> {
        self.prices.get(&(chain_id, token)).copied()
    }
}

#[async_trait]
impl PriceOracle for StaticPriceTable {
    async fn price_usd(&self, token: Address, chain_id: u64) -> Option<f64> {
        self.get(chain_id, token)
    }
}

/// Oracle-first lookup with static fallback. This is what detectors hold.
pub struct UsdReference {
    oracle: Option<Arc<dyn PriceOracle>>,
    table: StaticPriceTable,
    chain_id: u64,
}

impl UsdReference {
    pub fn new(chain_id: u64, table: StaticPriceTable, oracle: Option<Arc<dyn PriceOracle>>) -> Self {
        Self {
            oracle,
            table,
            chain_id,
        }
    }

    pub async fn price_usd(&self, token: Address) -> Option<f64> {
        if let Some(oracle) = &self.oracle {
            if let Some(price) = oracle.price_usd(token, self.chain_id).await {
                return Some(price);
            }
        }
        self.table.get(self.chain_id, token)
    }

    /// USD value of a raw token amount.
    pub async fn amount_usd(&self, token: Address, amount: U256, decimals: u8) -> Option<f64> {
        let price = self.price_usd(token).await?;
        Some(crate::math::u256_to_f64(amount) / 10f64.powi(decimals as i32) * price)
    }

    /// USD depth of a constant-product pool. With only one referencable
    /// side, assumes the usual balanced pool.
    pub async fn cp_liquidity_usd(&self, pool: &crate::types::Pool, reserve0: U256, reserve1: U256) -> f64 {
        let side0 = self
            .amount_usd(pool.token0.address, reserve0, pool.token0.decimals)
            .await;
        let side1 = self
            .amount_usd(pool.token1.address, reserve1, pool.token1.decimals)
            .await;
        match (side0, side1) {
            (Some(a), Some(b)) => a + b,
            (Some(a), None) => a * 2.0,
            (None, Some(b)) => b * 2.0,
            (None, None) => 0.0,
        }
    }

    /// USD depth of a concentrated pool from its virtual in-range
    /// amounts: amount0 = L / √P, amount1 = L · √P.
    pub async fn concentrated_liquidity_usd(
        &self,
        pool: &crate::types::Pool,
        sqrt_price_x96: U256,
        liquidity: u128,
    ) -> f64 {
        let sp = crate::math::u256_to_f64(sqrt_price_x96) / 2f64.powi(96);
        if sp <= 0.0 || !sp.is_finite() {
            return 0.0;
        }
        let amount0 = liquidity as f64 / sp;
        let amount1 = liquidity as f64 * sp;
        let usd0 = self
            .price_usd(pool.token0.address)
            .await
            .map(|p| amount0 / 10f64.powi(pool.token0.decimals as i32) * p);
        let usd1 = self
            .price_usd(pool.token1.address)
            .await
            .map(|p| amount1 / 10f64.powi(pool.token1.decimals as i32) * p);
        match (usd0, usd1) {
            (Some(a), Some(b)) => a + b,
            (Some(a), None) => a * 2.0,
            (None, Some(b)) => b * 2.0,
            (None, None) => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    const CFG: &str = r#"
        [[chains]]
        id = 137
        name = "polygon"
        native_token_symbol = "WMATIC"
        native_usd = 0.5
        expected_block_ms = 2000
        base_tokens = []

        [[chains.endpoints]]
        url = "wss://example.invalid/ws"
        kind = "ws"

        [[chains.tokens]]
        symbol = "USDC"
        address = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174"
        decimals = 6
        class = "stable"

        [[chains.tokens]]
        symbol = "WMATIC"
        address = "0x0d500B1d8E8eF31E21C99d1Db9A6444d3ADf1270"
        decimals = 18
        class = "native"

        [[chains.tokens]]
        symbol = "WETH"
        address = "0x7ceB23fD6bC0adD59E62ac25578270cFf1b9f619"
        decimals = 18
        class = "blueChip"
        usd_hint = 3500.0

        [[chains.tokens]]
        symbol = "SHIB"
        address = "0x6f8a06447Ff6FcF75d803135a7de15CE88C1d4ec"
        decimals = 18
        class = "meme"
    "#;

    fn table() -> (StaticPriceTable, AppConfig) {
        let cfg = AppConfig::from_toml_str(CFG).unwrap();
        (StaticPriceTable::from_chain(&cfg.chains[0]), cfg)
    }

    #[tokio::test]
    async fn test_static_table_defaults() {
        let (table, cfg) = table();
        let chain = &cfg.chains[0];
        let addr = |sym: &str| chain.token(sym).unwrap().address;

        assert_eq!(table.get(137, addr("USDC")), Some(1.0));
        assert_eq!(table.get(137, addr("WMATIC")), Some(0.5));
        assert_eq!(table.get(137, addr("WETH")), Some(3500.0));
        assert_eq!(table.get(137, addr("SHIB")), None, "no hint, no default");
    }

    #[tokio::test]
    async fn test_usd_reference_fallback_order() {
        struct FixedOracle;
        #[async_trait]
        impl PriceOracle for FixedOracle {
            async fn price_usd(&self, _token: Address, _chain_id: u64) -> Option<f64> {
                None // oracle knows nothing; table must answer
            }
        }

        let (table, cfg) = table();
        let weth = cfg.chains[0].token("WETH").unwrap().address;
        let reference = UsdReference::new(137, table, Some(Arc::new(FixedOracle)));
        assert_eq!(reference.price_usd(weth).await, Some(3500.0));
    }

    #[tokio::test]
    async fn test_amount_usd() {
        let (table, cfg) = table();
        let weth = cfg.chains[0].token("WETH").unwrap().address;
        let reference = UsdReference::new(137, table, None);

        // 0.5 WETH at $3500 = $1750
        let half_eth = U256::from(500_000_000_000_000_000u64);
        let usd = reference.amount_usd(weth, half_eth, 18).await.unwrap();
        assert!((usd - 1750.0).abs() < 1e-6);
    }
}
