//! Detector family.
//!
//! Block-driven detectors (cross-venue, triangular, stablecoin) scan the
//! per-block price snapshot; event-driven detectors (differential,
//! statistical, liquidation) consume ingestor streams. None of them
//! propagate errors — every scan returns whatever opportunities it managed
//! to compute before a failure or the block budget cut it off.

pub mod cross_venue;
pub mod differential;
pub mod liquidation;
pub mod stablecoin;
pub mod statistical;
pub mod triangular;

pub use cross_venue::CrossVenueDetector;
pub use differential::DifferentialDetector;
pub use liquidation::LiquidationDetector;
pub use stablecoin::{DepegAlert, DepegSeverity, StablecoinDetector};
pub use statistical::StatisticalDetector;
pub use triangular::TriangularDetector;

use crate::config::DetectionConfig;

/// Both profit thresholds are orthogonal; unless relaxed by config, an
/// opportunity must clear percent AND absolute USD.
pub fn clears_thresholds(cfg: &DetectionConfig, spread_fraction: f64, net_usd: f64) -> bool {
    let usd_ok = net_usd > cfg.min_profit_usd;
    if !cfg.enforce_both_thresholds {
        return usd_ok;
    }
    usd_ok && spread_fraction * 100.0 >= cfg.min_profit_percent
}

/// Notional used for USD profit estimates when sizing cannot run on raw
/// reserves: 1% of the thinnest pool involved, floored at zero.
pub(crate) fn probe_notional_usd(min_liquidity_usd: f64) -> f64 {
    (min_liquidity_usd * 0.01).max(0.0)
}
