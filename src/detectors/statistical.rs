//! Statistical mean-reversion over rolling spread windows.
//!
//! One window per (pair, venueA, venueB) triple, fed single-writer from
//! the swap/price stream consumer. Each observation is scored against the
//! mean and standard deviation of the samples accumulated so far; a
//! z-score past the threshold signals an abnormally wide spread expected
//! to revert.

use crate::config::DetectionConfig;
use crate::detectors::{clears_thresholds, probe_notional_usd};
use crate::types::{Opportunity, OpportunityKind, OpportunitySource, PairKey, Quote};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Samples older than this are evicted.
const SAMPLE_MAX_AGE: Duration = Duration::from_secs(60);

/// Rolling spread window with running sums for O(1) mean/σ.
struct SpreadWindow {
    samples: VecDeque<(f64, Instant)>,
    sum: f64,
    sum_sq: f64,
    capacity: usize,
}

impl SpreadWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            sum: 0.0,
            sum_sq: 0.0,
            capacity,
        }
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((value, at)) = self.samples.front().copied() {
            if now.duration_since(at) <= SAMPLE_MAX_AGE {
                break;
            }
            self.samples.pop_front();
            self.sum -= value;
            self.sum_sq -= value * value;
        }
    }

    fn push(&mut self, value: f64, now: Instant) {
        if self.samples.len() == self.capacity {
            if let Some((old, _)) = self.samples.pop_front() {
                self.sum -= old;
                self.sum_sq -= old * old;
            }
        }
        self.samples.push_back((value, now));
        self.sum += value;
        self.sum_sq += value * value;
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    /// Population mean and standard deviation of the current window.
    fn stats(&self) -> (f64, f64) {
        let n = self.samples.len() as f64;
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = self.sum / n;
        let variance = (self.sum_sq / n - mean * mean).max(0.0);
        (mean, variance.sqrt())
    }
}

pub struct StatisticalDetector {
    cfg: DetectionConfig,
    windows: DashMap<(PairKey, String, String), SpreadWindow>,
    chain_id: u64,
}

impl StatisticalDetector {
    pub fn new(cfg: DetectionConfig, chain_id: u64) -> Self {
        Self {
            cfg,
            windows: DashMap::new(),
            chain_id,
        }
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Observe the current quotes of two venues for one pair. The sample
    /// is scored against the pre-existing window, then appended.
    pub fn observe(&self, a: &Quote, b: &Quote, gas_cost_usd: f64) -> Option<Opportunity> {
        if a.price <= 0.0 || b.price <= 0.0 {
            return None;
        }
        // Canonical venue order so (a, b) and (b, a) share one window.
        let (first, second) = if a.venue <= b.venue { (a, b) } else { (b, a) };
        let spread = (first.price - second.price) / second.price;

        let key = (
            first.pair.clone(),
            first.venue.clone(),
            second.venue.clone(),
        );
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(key)
            .or_insert_with(|| SpreadWindow::new(self.cfg.window_size));
        window.evict_expired(now);

        let result = if window.len() >= self.cfg.min_samples {
            let (mean, std_dev) = window.stats();
            if std_dev > 0.0 {
                let z = (spread - mean) / std_dev;
                if z.abs() >= self.cfg.z_threshold {
                    Some((z, mean, std_dev))
                } else {
                    None
                }
            } else {
                None
            }
        } else {
            None
        };
        window.push(spread, now);
        drop(window);

        let (z, mean, _std_dev) = result?;
        let deviation = (spread - mean).abs();
        let min_liq = first.liquidity_usd.min(second.liquidity_usd);
        let notional = probe_notional_usd(min_liq);
        let gross_usd = deviation * notional;
        let net_usd = gross_usd - gas_cost_usd;
        if !clears_thresholds(&self.cfg, deviation, net_usd) {
            debug!(pair = %first.pair, z, "z-score hit but below profit thresholds");
            return None;
        }

        let confidence = (z.abs() / 3.0).min(1.0);
        info!(
            pair = %first.pair,
            venue_a = %first.venue,
            venue_b = %second.venue,
            z,
            // Positive z: spread abnormally wide → expect it to narrow.
            direction = if z > 0.0 { "short-spread" } else { "long-spread" },
            strength = if z.abs() >= 3.0 { "strong" } else { "moderate" },
            "statistical reversion signal"
        );

        Some(Opportunity::new(
            self.chain_id,
            OpportunityKind::Statistical,
            first.block_number.max(second.block_number),
            Vec::new(),
            gross_usd,
            gas_cost_usd,
            min_liq,
            OpportunitySource::Statistical,
            confidence,
            vec![first.pair.clone()],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QuoteSource;

    fn quote(venue: &str, price: f64) -> Quote {
        Quote {
            pair: PairKey::new("WETH", "USDC"),
            venue: venue.into(),
            price,
            reserves: None,
            liquidity_usd: 1_000_000.0,
            block_number: 100,
            observed_at: std::time::Instant::now(),
            source: QuoteSource::SwapEvent,
        }
    }

    fn detector() -> StatisticalDetector {
        let cfg = DetectionConfig {
            min_profit_percent: 0.01,
            min_profit_usd: 0.5,
            ..DetectionConfig::default()
        };
        StatisticalDetector::new(cfg, 137)
    }

    /// Feed alternating spreads of 0.0001 and 0.0003 → mean 0.0002,
    /// population σ = 0.0001.
    fn feed_baseline(det: &StatisticalDetector, n: usize) {
        for i in 0..n {
            let spread = if i % 2 == 0 { 0.0001 } else { 0.0003 };
            let a = quote("v1", 3500.0 * (1.0 + spread));
            let b = quote("v2", 3500.0);
            assert!(det.observe(&a, &b, 0.01).is_none(), "baseline must not signal");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_z_score_four_sigma_signals_strong() {
        let det = detector();
        feed_baseline(&det, 100);

        // Spread 0.0006: z = (0.0006 − 0.0002) / 0.0001 = 4.0
        let a = quote("v1", 3500.0 * 1.0006);
        let b = quote("v2", 3500.0);
        let opp = det.observe(&a, &b, 0.01).expect("4σ must signal");

        assert_eq!(opp.kind, OpportunityKind::Statistical);
        assert_eq!(opp.source, OpportunitySource::Statistical);
        assert!((opp.confidence - 1.0).abs() < 1e-9, "min(1, 4/3) = 1.0");
        assert!(opp.estimated_gross_profit > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_signal_before_min_samples() {
        let det = detector();
        feed_baseline(&det, 10); // below min_samples = 20

        let a = quote("v1", 3500.0 * 1.01); // wildly wide spread
        let b = quote("v2", 3500.0);
        assert!(det.observe(&a, &b, 0.01).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_within_band_stays_quiet() {
        let det = detector();
        feed_baseline(&det, 100);

        // z = 1.0 — well under the 2.0 threshold
        let a = quote("v1", 3500.0 * 1.0003);
        let b = quote("v2", 3500.0);
        assert!(det.observe(&a, &b, 0.01).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_spread_never_divides_by_zero() {
        let det = detector();
        for _ in 0..50 {
            let a = quote("v1", 3500.35);
            let b = quote("v2", 3500.0);
            assert!(det.observe(&a, &b, 0.01).is_none(), "σ = 0 must not signal");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_samples_evicted() {
        let det = detector();
        feed_baseline(&det, 100);

        // All baseline samples age out of the 60s window
        tokio::time::advance(Duration::from_secs(61)).await;

        let a = quote("v1", 3500.0 * 1.0006);
        let b = quote("v2", 3500.0);
        assert!(
            det.observe(&a, &b, 0.01).is_none(),
            "empty window after eviction: below min samples"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_venue_order_is_canonical() {
        let det = detector();
        feed_baseline(&det, 100);
        assert_eq!(det.window_count(), 1);

        // Swapped argument order must land in the same window
        let a = quote("v1", 3500.0 * 1.0006);
        let b = quote("v2", 3500.0);
        assert!(det.observe(&b, &a, 0.01).is_some());
        assert_eq!(det.window_count(), 1);
    }
}
