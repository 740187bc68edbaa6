//! Composite opportunity scoring.
//!
//! Five weighted components on a 0–100 scale: profit, liquidity depth, a
//! per-type execution prior damped by slippage and gas share, freshness,
//! and token quality. Weights come from config, renormalized at load.

use crate::config::ScoringConfig;
use crate::types::{Opportunity, OpportunityKind, Token, TokenClass};
use alloy::primitives::Address;
use chrono::Utc;
use std::collections::HashMap;

/// Liquidity breakpoints (USD → score).
const LIQUIDITY_POINTS: [(f64, f64); 5] = [
    (5_000.0, 20.0),
    (10_000.0, 40.0),
    (50_000.0, 60.0),
    (100_000.0, 80.0),
    (500_000.0, 100.0),
];

/// Freshness horizon: score reaches zero here.
const FRESHNESS_MAX_AGE_S: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    Excellent,
    Good,
    Acceptable,
    Marginal,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    ExecuteImmediately,
    Execute,
    ExecuteIfIdle,
    Monitor,
    Skip,
}

/// Score plus its components, for logging and dispatch decisions.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub composite: f64,
    pub profit: f64,
    pub liquidity: f64,
    pub execution_prior: f64,
    pub freshness: f64,
    pub token_quality: f64,
    pub tier: ScoreTier,
    pub recommendation: Recommendation,
}

pub struct OpportunityScorer {
    weights: ScoringConfig,
    tokens_by_address: HashMap<Address, Token>,
}

impl OpportunityScorer {
    pub fn new(weights: ScoringConfig, tokens: Vec<Token>) -> Self {
        Self {
            weights,
            tokens_by_address: tokens.into_iter().map(|t| (t.address, t)).collect(),
        }
    }

    pub fn score(&self, opp: &Opportunity) -> ScoreBreakdown {
        let profit = profit_score(opp.estimated_net_profit);
        let liquidity = liquidity_score(opp.min_liquidity_usd);
        let execution_prior = self.execution_prior_score(opp);
        let freshness = freshness_score(opp);
        let token_quality = self.token_quality_score(opp);

        let composite = profit * self.weights.profit
            + liquidity * self.weights.liquidity
            + execution_prior * self.weights.execution_prior
            + freshness * self.weights.freshness
            + token_quality * self.weights.token_quality;

        let tier = tier_for(composite);
        ScoreBreakdown {
            composite,
            profit,
            liquidity,
            execution_prior,
            freshness,
            token_quality,
            tier,
            recommendation: recommendation_for(tier),
        }
    }

    /// Per-type base prior, multiplicatively damped by the gas share of
    /// gross profit and by trade size relative to pool depth.
    fn execution_prior_score(&self, opp: &Opportunity) -> f64 {
        let base = match opp.kind {
            OpportunityKind::Triangular => 0.90,
            OpportunityKind::StableTriangular => 0.85,
            OpportunityKind::StableCrossVenue => 0.80,
            OpportunityKind::CrossVenue => 0.75,
            OpportunityKind::MultiHop => 0.70,
            OpportunityKind::Differential => 0.65,
            OpportunityKind::LiquidationBackrun => 0.60,
            OpportunityKind::LiquidationBuyCollateral => 0.55,
            OpportunityKind::Statistical => 0.50,
            OpportunityKind::AggregatorRoute => 0.50,
            OpportunityKind::NewPair => 0.30,
        };

        let gross = opp.estimated_gross_profit.max(1e-9);
        let gas_share = (opp.estimated_gas_cost_usd / gross).min(1.0);
        let gas_damp = 1.0 - 0.5 * gas_share;

        // Larger takes against thinner pools slip more.
        let size_ratio = gross / opp.min_liquidity_usd.max(1.0);
        let slippage_damp = 1.0 - (size_ratio * 10.0).min(0.5);

        base * gas_damp * slippage_damp * 100.0
    }

    /// Minimum quality multiplier across every token the legs touch.
    fn token_quality_score(&self, opp: &Opportunity) -> f64 {
        let mut min_multiplier: f64 = 1.0;
        let mut any = false;
        for leg in &opp.legs {
            for addr in [leg.token_in, leg.token_out] {
                let class = self
                    .tokens_by_address
                    .get(&addr)
                    .map(|t| t.class)
                    .unwrap_or(TokenClass::Unknown);
                min_multiplier = min_multiplier.min(class.quality_multiplier());
                any = true;
            }
        }
        if !any {
            // Leg-less opportunities (statistical, liquidation) score as
            // unknown quality.
            min_multiplier = TokenClass::Unknown.quality_multiplier();
        }
        min_multiplier * 100.0
    }
}

fn profit_score(net_usd: f64) -> f64 {
    ((net_usd + 1.0).max(1e-9).log10() * 40.0).clamp(0.0, 100.0)
}

fn liquidity_score(liquidity_usd: f64) -> f64 {
    let (first_x, first_y) = LIQUIDITY_POINTS[0];
    if liquidity_usd <= 0.0 {
        return 0.0;
    }
    if liquidity_usd < first_x {
        return liquidity_usd / first_x * first_y;
    }
    for window in LIQUIDITY_POINTS.windows(2) {
        let (x0, y0) = window[0];
        let (x1, y1) = window[1];
        if liquidity_usd <= x1 {
            return y0 + (liquidity_usd - x0) / (x1 - x0) * (y1 - y0);
        }
    }
    100.0
}

fn freshness_score(opp: &Opportunity) -> f64 {
    let age_s = (Utc::now() - opp.detected_at)
        .num_milliseconds()
        .max(0) as f64
        / 1000.0;
    if age_s < 1.0 {
        // 100 at zero age, 90 at one second.
        100.0 - 10.0 * age_s
    } else if age_s < FRESHNESS_MAX_AGE_S {
        90.0 * (1.0 - (age_s - 1.0) / (FRESHNESS_MAX_AGE_S - 1.0))
    } else {
        0.0
    }
}

fn tier_for(composite: f64) -> ScoreTier {
    if composite >= 80.0 {
        ScoreTier::Excellent
    } else if composite >= 60.0 {
        ScoreTier::Good
    } else if composite >= 40.0 {
        ScoreTier::Acceptable
    } else if composite >= 20.0 {
        ScoreTier::Marginal
    } else {
        ScoreTier::Poor
    }
}

fn recommendation_for(tier: ScoreTier) -> Recommendation {
    match tier {
        ScoreTier::Excellent => Recommendation::ExecuteImmediately,
        ScoreTier::Good => Recommendation::Execute,
        ScoreTier::Acceptable => Recommendation::ExecuteIfIdle,
        ScoreTier::Marginal => Recommendation::Monitor,
        ScoreTier::Poor => Recommendation::Skip,
    }
}
