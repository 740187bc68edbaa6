//! Adaptive pair prioritizer: HOT/WARM/NORMAL/COLD monitoring tiers.
//!
//! Tier controls how often a pair is refreshed over RPC (sampling period
//! in blocks). Opportunities force a pair HOT; idleness decays it one step
//! at a time back toward COLD. Decay is monotone — a pair never improves
//! from decay alone.

use crate::config::PrioritizerConfig;
use crate::types::PairKey;
use dashmap::DashMap;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tracing::debug;

/// Monitoring tiers, HOT = 1 to COLD = 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Hot = 1,
    Warm = 2,
    Normal = 3,
    Cold = 4,
}

impl Tier {
    /// Blocks between forced refreshes at this tier.
    pub fn sampling_period_blocks(&self) -> u64 {
        match self {
            Tier::Hot => 1,
            Tier::Warm => 2,
            Tier::Normal => 3,
            Tier::Cold => 5,
        }
    }

    /// Idle time before demotion; None = never demoted further by idleness.
    pub fn max_idle(&self) -> Option<Duration> {
        match self {
            Tier::Hot => Some(Duration::from_millis(300_000)),
            Tier::Warm => Some(Duration::from_millis(1_800_000)),
            Tier::Normal | Tier::Cold => None,
        }
    }

    /// One step toward COLD.
    pub fn demoted(&self) -> Tier {
        match self {
            Tier::Hot => Tier::Warm,
            Tier::Warm => Tier::Normal,
            Tier::Normal => Tier::Cold,
            Tier::Cold => Tier::Cold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierChangeReason {
    Opportunity,
    Decay,
    Manual,
    Volume,
}

#[derive(Debug, Clone)]
pub struct TierChange {
    pub pair: PairKey,
    pub from: Tier,
    pub to: Tier,
    pub reason: TierChangeReason,
}

/// Per-pair scheduling state. Lives for the process lifetime once created.
#[derive(Debug, Clone)]
pub struct PairPriority {
    pub tier: Tier,
    pub last_opportunity: Option<Instant>,
    pub last_checked: Option<Instant>,
    pub opportunity_count: u64,
    pub volume_score: f64,
    pub liquidity_usd: f64,
    registered_at: Instant,
}

impl PairPriority {
    /// Idle clock: time since the last opportunity, or since registration
    /// when none has ever fired.
    fn idle(&self, now: Instant) -> Duration {
        now.duration_since(self.last_opportunity.unwrap_or(self.registered_at))
    }
}

/// Tiered scheduler shared by fetcher and dispatcher.
pub struct AdaptivePrioritizer {
    pairs: DashMap<PairKey, PairPriority>,
    config: PrioritizerConfig,
    events: broadcast::Sender<TierChange>,
}

impl AdaptivePrioritizer {
    pub fn new(config: PrioritizerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            pairs: DashMap::new(),
            config,
            events,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<TierChange> {
        self.events.subscribe()
    }

    fn initial_tier(&self, volume_usd: f64, liquidity_usd: f64) -> Tier {
        if liquidity_usd < self.config.low_liquidity_usd {
            Tier::Cold
        } else if volume_usd >= self.config.high_volume_usd {
            Tier::Warm
        } else {
            Tier::Normal
        }
    }

    /// Register a pair with its startup volume/liquidity stats. Idempotent
    /// — an existing entry keeps its state.
    pub fn register_pair(&self, key: PairKey, volume_usd: f64, liquidity_usd: f64) {
        self.pairs.entry(key).or_insert_with(|| PairPriority {
            tier: self.initial_tier(volume_usd, liquidity_usd),
            last_opportunity: None,
            last_checked: None,
            opportunity_count: 0,
            volume_score: volume_usd,
            liquidity_usd,
            registered_at: Instant::now(),
        });
    }

    fn change_tier(&self, key: &PairKey, entry: &mut PairPriority, to: Tier, reason: TierChangeReason) {
        if entry.tier == to {
            return;
        }
        let from = entry.tier;
        entry.tier = to;
        debug!(pair = %key, ?from, ?to, ?reason, "tier change");
        let _ = self.events.send(TierChange {
            pair: key.clone(),
            from,
            to,
            reason,
        });
    }

    /// An opportunity on this pair forces HOT, whatever the prior tier.
    pub fn record_opportunity(&self, key: &PairKey) {
        let mut entry = self.pairs.entry(key.clone()).or_insert_with(|| PairPriority {
            tier: Tier::Normal,
            last_opportunity: None,
            last_checked: None,
            opportunity_count: 0,
            volume_score: 0.0,
            liquidity_usd: 0.0,
            registered_at: Instant::now(),
        });
        entry.opportunity_count += 1;
        entry.last_opportunity = Some(Instant::now());
        let (key, entry) = entry.pair_mut();
        self.change_tier(key, entry, Tier::Hot, TierChangeReason::Opportunity);
    }

    /// Volume-driven promotion (e.g. whale activity): NORMAL/COLD pairs
    /// with sustained high volume move up to WARM.
    pub fn update_volume(&self, key: &PairKey, volume_usd: f64) {
        if let Some(mut entry) = self.pairs.get_mut(key) {
            entry.volume_score = volume_usd;
            if volume_usd >= self.config.high_volume_usd && entry.tier > Tier::Warm {
                let (key, entry) = entry.pair_mut();
                self.change_tier(key, entry, Tier::Warm, TierChangeReason::Volume);
            }
        }
    }

    /// Manual override.
    pub fn set_tier(&self, key: &PairKey, tier: Tier) {
        if let Some(mut entry) = self.pairs.get_mut(key) {
            let (key, entry) = entry.pair_mut();
            self.change_tier(key, entry, tier, TierChangeReason::Manual);
        }
    }

    /// Whether block `block_number` is a sampling block for this pair.
    /// Unknown pairs are created at NORMAL on first mention.
    pub fn should_check(&self, key: &PairKey, block_number: u64) -> bool {
        let mut entry = self.pairs.entry(key.clone()).or_insert_with(|| PairPriority {
            tier: Tier::Normal,
            last_opportunity: None,
            last_checked: None,
            opportunity_count: 0,
            volume_score: 0.0,
            liquidity_usd: 0.0,
            registered_at: Instant::now(),
        });
        let due = block_number % entry.tier.sampling_period_blocks() == 0;
        if due {
            entry.last_checked = Some(Instant::now());
        }
        due
    }

    /// One decay sweep: every pair idle past its tier's max idle demotes
    /// one step. Monotone — never promotes.
    pub fn decay(&self) {
        let now = Instant::now();
        for mut entry in self.pairs.iter_mut() {
            let Some(max_idle) = entry.tier.max_idle() else {
                continue;
            };
            if entry.idle(now) > max_idle {
                let demoted = entry.tier.demoted();
                let (key, value) = entry.pair_mut();
                self.change_tier(key, value, demoted, TierChangeReason::Decay);
            }
        }
    }

    pub fn get(&self, key: &PairKey) -> Option<PairPriority> {
        self.pairs.get(key).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Pairs per tier, for status reporting.
    pub fn tier_counts(&self) -> [(Tier, usize); 4] {
        let mut counts = [
            (Tier::Hot, 0),
            (Tier::Warm, 0),
            (Tier::Normal, 0),
            (Tier::Cold, 0),
        ];
        for entry in self.pairs.iter() {
            let idx = entry.tier as usize - 1;
            counts[idx].1 += 1;
        }
        counts
    }

    /// Periodic decay loop; runs until shutdown.
    pub async fn run_decay_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.decay_ms.max(1000)));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => self.decay(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prioritizer() -> AdaptivePrioritizer {
        AdaptivePrioritizer::new(PrioritizerConfig::default())
    }

    fn pair() -> PairKey {
        PairKey::new("WETH", "USDC")
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_tier_rules() {
        let p = prioritizer();
        p.register_pair(PairKey::new("A", "B"), 2_000_000.0, 500_000.0);
        p.register_pair(PairKey::new("C", "D"), 50_000.0, 500_000.0);
        p.register_pair(PairKey::new("E", "F"), 2_000_000.0, 1_000.0);

        assert_eq!(p.get(&PairKey::new("A", "B")).unwrap().tier, Tier::Warm);
        assert_eq!(p.get(&PairKey::new("C", "D")).unwrap().tier, Tier::Normal);
        // Low liquidity dominates even with high volume
        assert_eq!(p.get(&PairKey::new("E", "F")).unwrap().tier, Tier::Cold);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opportunity_forces_hot() {
        let p = prioritizer();
        p.register_pair(pair(), 0.0, 100_000.0);
        let mut events = p.events();

        p.record_opportunity(&pair());
        let state = p.get(&pair()).unwrap();
        assert_eq!(state.tier, Tier::Hot);
        assert_eq!(state.opportunity_count, 1);

        let evt = events.try_recv().unwrap();
        assert_eq!(evt.to, Tier::Hot);
        assert_eq!(evt.reason, TierChangeReason::Opportunity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_check_follows_sampling_period() {
        let p = prioritizer();
        p.register_pair(pair(), 0.0, 100_000.0); // NORMAL: period 3

        let due: Vec<u64> = (0..12).filter(|b| p.should_check(&pair(), *b)).collect();
        assert_eq!(due, vec![0, 3, 6, 9]);
        assert!(due.iter().all(|b| b % 3 == 0), "period divides every due block");

        p.record_opportunity(&pair()); // HOT: period 1
        assert!((0..5).all(|b| p.should_check(&pair(), b)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pair_created_on_first_mention() {
        let p = prioritizer();
        assert!(p.should_check(&pair(), 3));
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_scenario_hot_to_warm_to_normal() {
        let p = prioritizer();
        p.register_pair(pair(), 0.0, 100_000.0);
        p.record_opportunity(&pair());
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Hot);

        // 6 minutes idle: HOT exceeds its 5-minute max idle → WARM
        tokio::time::advance(Duration::from_secs(360)).await;
        p.decay();
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Warm);

        // +25 minutes: 31 total > WARM's 30-minute max idle → NORMAL
        tokio::time::advance(Duration::from_secs(25 * 60)).await;
        p.decay();
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Normal);

        // NORMAL has no idle limit: further decay is a no-op
        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        p.decay();
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decay_is_monotone() {
        let p = prioritizer();
        p.register_pair(pair(), 0.0, 100_000.0);
        let before = p.get(&pair()).unwrap().tier;
        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(3600)).await;
            p.decay();
            let after = p.get(&pair()).unwrap().tier;
            assert!(after >= before, "decay must never promote");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_volume_promotion() {
        let p = prioritizer();
        p.register_pair(pair(), 0.0, 100_000.0);
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Normal);

        p.update_volume(&pair(), 5_000_000.0);
        let state = p.get(&pair()).unwrap();
        assert_eq!(state.tier, Tier::Warm);
        assert_eq!(state.volume_score, 5_000_000.0);

        // Volume never promotes past WARM, and never demotes HOT
        p.record_opportunity(&pair());
        p.update_volume(&pair(), 9_000_000.0);
        assert_eq!(p.get(&pair()).unwrap().tier, Tier::Hot);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tier_counts() {
        let p = prioritizer();
        p.register_pair(PairKey::new("A", "B"), 2_000_000.0, 500_000.0);
        p.register_pair(PairKey::new("C", "D"), 0.0, 500_000.0);
        p.record_opportunity(&PairKey::new("C", "D"));

        let counts = p.tier_counts();
        assert_eq!(counts[0], (Tier::Hot, 1));
        assert_eq!(counts[1], (Tier::Warm, 1));
    }
}
