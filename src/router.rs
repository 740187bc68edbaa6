//! Multi-chain supervision and cross-chain routing.
//!
//! The router owns one coordinator per enabled chain plus a map of bridge
//! adapters keyed by (from, to). Dual-chain execution runs two
//! independent chain-local legs and aggregates the outcome; there is no
//! atomicity across chains — a partial result is a real, reportable state,
//! and the failed leg's gas is charged against the net.

use crate::coordinator::{ChainCoordinator, ChainStatus};
use crate::dispatch::DispatchDecision;
use crate::errors::RpcError;
use crate::types::Opportunity;
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Bridge quote for moving `amount` of a token across chains.
#[derive(Debug, Clone)]
pub struct BridgeQuote {
    pub out_amount: U256,
    pub fee_usd: f64,
    pub eta: Duration,
}

#[derive(Debug, Clone)]
pub struct BridgeParams {
    pub token: Address,
    pub amount: U256,
    pub from_chain: u64,
    pub to_chain: u64,
    pub recipient: Address,
}

#[derive(Debug, Clone)]
pub struct BridgeResult {
    pub tx_hash: B256,
    pub expected_arrival_ts: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStatus {
    Pending,
    Completed,
    Failed,
}

/// Bridge transport port, implemented per bridge deployment outside the
/// core.
#[async_trait]
pub trait BridgeAdapter: Send + Sync {
    async fn quote(
        &self,
        token: Address,
        amount: U256,
        from_chain: u64,
        to_chain: u64,
    ) -> Result<BridgeQuote, RpcError>;

    async fn execute(&self, params: BridgeParams) -> Result<BridgeResult, RpcError>;

    async fn status(&self, tx_hash: B256) -> Result<BridgeStatus, RpcError>;
}

/// Aggregate outcome of two independent chain-local legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualChainState {
    FullSuccess,
    PartialSuccess,
    FullFailure,
}

#[derive(Debug, Clone)]
pub struct DualChainOutcome {
    pub state: DualChainState,
    /// Realized (or estimated) profit minus gas burned on failed legs.
    pub net_profit_usd: f64,
    pub legs: Vec<(u64, DispatchDecision)>,
}

/// Owns the per-chain coordinators and the bridge table.
pub struct CrossChainRouter {
    coordinators: HashMap<u64, Arc<ChainCoordinator>>,
    bridges: HashMap<(u64, u64), Arc<dyn BridgeAdapter>>,
}

impl CrossChainRouter {
    pub fn new(coordinators: Vec<Arc<ChainCoordinator>>) -> Self {
        Self {
            coordinators: coordinators
                .into_iter()
                .map(|c| (c.chain_id(), c))
                .collect(),
            bridges: HashMap::new(),
        }
    }

    pub fn register_bridge(
        &mut self,
        from_chain: u64,
        to_chain: u64,
        adapter: Arc<dyn BridgeAdapter>,
    ) {
        self.bridges.insert((from_chain, to_chain), adapter);
    }

    pub fn bridge(&self, from_chain: u64, to_chain: u64) -> Option<&Arc<dyn BridgeAdapter>> {
        self.bridges.get(&(from_chain, to_chain))
    }

    pub fn coordinator(&self, chain_id: u64) -> Option<&Arc<ChainCoordinator>> {
        self.coordinators.get(&chain_id)
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.coordinators.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn start_all(&self) {
        for coordinator in self.coordinators.values() {
            coordinator.start();
        }
    }

    pub async fn stop_all(&self) {
        for coordinator in self.coordinators.values() {
            coordinator.stop().await;
        }
    }

    pub fn status_all(&self) -> Vec<ChainStatus> {
        let mut statuses: Vec<ChainStatus> =
            self.coordinators.values().map(|c| c.status()).collect();
        statuses.sort_by_key(|s| s.chain_id);
        statuses
    }

    /// Execute two chain-local opportunities as one logical cross-chain
    /// trade. The legs run concurrently and independently; the aggregate
    /// never claims atomicity.
    pub async fn execute_dual_chain(
        &self,
        leg_a: Opportunity,
        leg_b: Opportunity,
    ) -> DualChainOutcome {
        let chain_a = leg_a.chain_id;
        let chain_b = leg_b.chain_id;
        let (coord_a, coord_b) = match (
            self.coordinators.get(&chain_a),
            self.coordinators.get(&chain_b),
        ) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                warn!(chain_a, chain_b, "dual-chain legs reference unknown chains");
                return DualChainOutcome {
                    state: DualChainState::FullFailure,
                    net_profit_usd: 0.0,
                    legs: Vec::new(),
                };
            }
        };

        let est_a = (leg_a.estimated_net_profit, leg_a.estimated_gas_cost_usd);
        let est_b = (leg_b.estimated_net_profit, leg_b.estimated_gas_cost_usd);

        let (decision_a, decision_b) =
            tokio::join!(coord_a.execute_direct(leg_a), coord_b.execute_direct(leg_b));

        let leg_net = |decision: &DispatchDecision, (est_net, est_gas): (f64, f64)| -> (bool, f64) {
            match decision {
                DispatchDecision::Executed(result) if result.succeeded() => {
                    (true, result.actual_profit_usd.unwrap_or(est_net))
                }
                DispatchDecision::Executed(_) => {
                    // Landed on-chain and reverted: the gas is gone.
                    (false, -est_gas)
                }
                // Never reached the chain: nothing gained, nothing burned.
                _ => (false, 0.0),
            }
        };

        let (ok_a, net_a) = leg_net(&decision_a, est_a);
        let (ok_b, net_b) = leg_net(&decision_b, est_b);
        let state = match (ok_a, ok_b) {
            (true, true) => DualChainState::FullSuccess,
            (false, false) => DualChainState::FullFailure,
            _ => DualChainState::PartialSuccess,
        };
        let net_profit_usd = net_a + net_b;

        info!(
            chain_a,
            chain_b,
            ?state,
            net_profit_usd,
            "dual-chain execution settled"
        );

        DualChainOutcome {
            state,
            net_profit_usd,
            legs: vec![(chain_a, decision_a), (chain_b, decision_b)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedBridge {
        fee_usd: f64,
    }

    #[async_trait]
    impl BridgeAdapter for FixedBridge {
        async fn quote(
            &self,
            _token: Address,
            amount: U256,
            _from_chain: u64,
            _to_chain: u64,
        ) -> Result<BridgeQuote, RpcError> {
            Ok(BridgeQuote {
                out_amount: amount - U256::from(1u64),
                fee_usd: self.fee_usd,
                eta: Duration::from_secs(120),
            })
        }

        async fn execute(&self, _params: BridgeParams) -> Result<BridgeResult, RpcError> {
            Ok(BridgeResult {
                tx_hash: B256::repeat_byte(0x42),
                expected_arrival_ts: 1_700_000_000,
            })
        }

        async fn status(&self, _tx_hash: B256) -> Result<BridgeStatus, RpcError> {
            Ok(BridgeStatus::Completed)
        }
    }

    #[tokio::test]
    async fn test_bridge_registry_lookup() {
        let mut router = CrossChainRouter::new(vec![]);
        router.register_bridge(137, 8453, Arc::new(FixedBridge { fee_usd: 0.8 }));

        assert!(router.bridge(137, 8453).is_some());
        assert!(router.bridge(8453, 137).is_none(), "directional keys");

        let quote = router
            .bridge(137, 8453)
            .unwrap()
            .quote(Address::ZERO, U256::from(100u64), 137, 8453)
            .await
            .unwrap();
        assert_eq!(quote.out_amount, U256::from(99u64));
    }

    #[tokio::test]
    async fn test_unknown_chain_is_full_failure() {
        let router = CrossChainRouter::new(vec![]);
        let opp = crate::types::Opportunity::new(
            1,
            crate::types::OpportunityKind::CrossVenue,
            1,
            vec![],
            5.0,
            0.1,
            10_000.0,
            crate::types::OpportunitySource::Block,
            0.9,
            vec![],
        );
        let outcome = router.execute_dual_chain(opp.clone(), opp).await;
        assert_eq!(outcome.state, DualChainState::FullFailure);
        assert_eq!(outcome.net_profit_usd, 0.0);
    }
}
