//! Liquidation backrun detection.
//!
//! Consumes liquidation events from Aave-V3 / Compound-V3 style pools.
//! A liquidation dumps seized collateral onto the market; the predictable
//! price impact right after is the backrun edge. Profit is estimated as
//! collateral value times an impact fraction that scales with size and
//! saturates at 1%.

use crate::config::DetectionConfig;
use crate::ingest::LiquidationObserved;
use crate::oracle::UsdReference;
use crate::types::{Opportunity, OpportunityKind, OpportunitySource, Token};
use alloy::primitives::{Address, B256};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Repeat (txHash, user) events inside this window are duplicates.
const DEDUPE_WINDOW: Duration = Duration::from_secs(30);

/// Impact fraction saturates here.
const MAX_SLIPPAGE_FRACTION: f64 = 0.01;

/// Collateral USD that maps to the maximum impact fraction.
const SLIPPAGE_SCALE_USD: f64 = 100_000.0;

pub struct LiquidationDetector {
    cfg: DetectionConfig,
    usd: Arc<UsdReference>,
    tokens_by_address: HashMap<Address, Token>,
    seen: DashMap<(B256, Address), Instant>,
    chain_id: u64,
}

impl LiquidationDetector {
    pub fn new(
        cfg: DetectionConfig,
        usd: Arc<UsdReference>,
        tokens: Vec<Token>,
        chain_id: u64,
    ) -> Self {
        Self {
            cfg,
            usd,
            tokens_by_address: tokens.into_iter().map(|t| (t.address, t)).collect(),
            seen: DashMap::new(),
            chain_id,
        }
    }

    /// Consume one liquidation event.
    pub async fn on_liquidation(
        &self,
        evt: &LiquidationObserved,
        gas_cost_usd: f64,
    ) -> Option<Opportunity> {
        // Dedupe by (txHash, user) inside the window.
        let key = (evt.tx_hash, evt.user);
        let now = Instant::now();
        self.seen
            .retain(|_, at| now.duration_since(*at) < DEDUPE_WINDOW);
        if self.seen.insert(key, now).is_some() {
            debug!(tx = %evt.tx_hash, user = %evt.user, "duplicate liquidation dropped");
            return None;
        }

        let token = self.tokens_by_address.get(&evt.collateral_asset)?;
        let collateral_value_usd = self
            .usd
            .amount_usd(token.address, evt.collateral_amount, token.decimals)
            .await?;

        if collateral_value_usd < self.cfg.min_liquidation_usd {
            debug!(
                value = collateral_value_usd,
                "liquidation below size floor, ignored"
            );
            return None;
        }

        let slippage_fraction = (collateral_value_usd / SLIPPAGE_SCALE_USD
            * MAX_SLIPPAGE_FRACTION)
            .clamp(0.0, MAX_SLIPPAGE_FRACTION);
        let gross_usd = collateral_value_usd * slippage_fraction;
        let net_usd = gross_usd - gas_cost_usd;
        if net_usd <= self.cfg.min_profit_usd {
            return None;
        }

        info!(
            protocol = ?evt.protocol,
            collateral = %token.symbol,
            value_usd = collateral_value_usd,
            net_usd,
            "liquidation backrun candidate"
        );

        Some(Opportunity::new(
            self.chain_id,
            OpportunityKind::LiquidationBackrun,
            evt.block_number,
            Vec::new(),
            gross_usd,
            gas_cost_usd,
            collateral_value_usd,
            OpportunitySource::Liquidation,
            0.6,
            Vec::new(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::LendingProtocol;
    use crate::oracle::StaticPriceTable;
    use crate::types::TokenClass;
    use alloy::primitives::U256;

    fn weth() -> Token {
        Token {
            symbol: "WETH".into(),
            address: Address::repeat_byte(0x02),
            decimals: 18,
            class: TokenClass::BlueChip,
            usd_hint: Some(3500.0),
        }
    }

    fn detector() -> LiquidationDetector {
        let mut table = StaticPriceTable::default();
        table.insert(137, weth().address, 3500.0);
        LiquidationDetector::new(
            DetectionConfig::default(),
            Arc::new(UsdReference::new(137, table, None)),
            vec![weth()],
            137,
        )
    }

    fn event(tx: u8, user: u8, weth_amount_milli: u64) -> LiquidationObserved {
        LiquidationObserved {
            protocol: LendingProtocol::AaveV3,
            user: Address::repeat_byte(user),
            collateral_asset: Address::repeat_byte(0x02),
            debt_asset: Some(Address::repeat_byte(0x01)),
            collateral_amount: U256::from(weth_amount_milli) * U256::from(10u64).pow(U256::from(15)),
            debt_amount: U256::ZERO,
            block_number: 900,
            tx_hash: B256::repeat_byte(tx),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_large_liquidation_emits_backrun() {
        let det = detector();
        // 10 WETH ≈ $35k collateral
        let opp = det.on_liquidation(&event(0x01, 0xaa, 10_000), 0.05).await.unwrap();

        assert_eq!(opp.kind, OpportunityKind::LiquidationBackrun);
        assert_eq!(opp.source, OpportunitySource::Liquidation);
        // impact = 1% × 35000/100000 = 0.35% → gross = 35000 × 0.0035 = 122.5
        assert!((opp.estimated_gross_profit - 122.5).abs() < 0.5);
        assert!((opp.estimated_net_profit - (opp.estimated_gross_profit - 0.05)).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slippage_saturates_at_one_percent() {
        let det = detector();
        // 100 WETH ≈ $350k: fraction clamps at 1%
        let opp = det.on_liquidation(&event(0x01, 0xaa, 100_000), 0.05).await.unwrap();
        assert!((opp.estimated_gross_profit - 3500.0).abs() < 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_liquidation_dropped() {
        let det = detector();
        // 0.1 WETH ≈ $350 < $1000 floor
        assert!(det.on_liquidation(&event(0x01, 0xaa, 100), 0.05).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_dropped() {
        let det = detector();
        let evt = event(0x01, 0xaa, 10_000);
        assert!(det.on_liquidation(&evt, 0.05).await.is_some());
        assert!(det.on_liquidation(&evt, 0.05).await.is_none(), "same (tx, user)");

        // Same user, different tx: not a duplicate
        assert!(det.on_liquidation(&event(0x02, 0xaa, 10_000), 0.05).await.is_some());

        // Past the window the same key is fresh again
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(det.on_liquidation(&evt, 0.05).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_collateral_ignored() {
        let det = detector();
        let mut evt = event(0x01, 0xaa, 10_000);
        evt.collateral_asset = Address::repeat_byte(0x99);
        assert!(det.on_liquidation(&evt, 0.05).await.is_none());
    }
}
