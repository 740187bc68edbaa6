//! Concurrent price cache with last-writer-wins semantics.
//!
//! Keyed by (pair, venue). Writers race freely: a newer block always wins,
//! within one block the later observation wins, so duplicate delivery
//! after a WS failover is absorbed here. Entries past the block age limit
//! are purged lazily on access and eagerly by a periodic sweep.

use crate::types::{PairKey, Quote};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Entries older than this many blocks are never reported.
pub const MAX_AGE_BLOCKS: u64 = 128;

/// Eager sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Cache key: one quote per (pair, venue).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    pub pair: PairKey,
    pub venue: String,
}

impl QuoteKey {
    pub fn new(pair: PairKey, venue: impl Into<String>) -> Self {
        Self {
            pair,
            venue: venue.into(),
        }
    }
}

/// Shared quote store. Owns all Quote records; readers get clones.
pub struct PriceCache {
    quotes: DashMap<QuoteKey, Quote>,
    /// Reverse index: pair → venues ever observed for it.
    venues: DashMap<PairKey, HashSet<String>>,
    /// Highest block seen on any put; the lazy purge reference point.
    head: AtomicU64,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            quotes: DashMap::new(),
            venues: DashMap::new(),
            head: AtomicU64::new(0),
        }
    }

    /// Insert or update under last-writer-wins. Re-applying an identical
    /// quote is a no-op.
    pub fn put(&self, quote: Quote) {
        self.head.fetch_max(quote.block_number, Ordering::Relaxed);
        self.venues
            .entry(quote.pair.clone())
            .or_default()
            .insert(quote.venue.clone());

        let key = QuoteKey::new(quote.pair.clone(), quote.venue.clone());
        match self.quotes.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if quote.supersedes(slot.get()) {
                    slot.insert(quote);
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(quote);
            }
        }
    }

    fn expired(&self, quote: &Quote) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        head.saturating_sub(quote.block_number) > MAX_AGE_BLOCKS
    }

    /// Read one quote; expired entries are purged on the way out.
    pub fn get(&self, key: &QuoteKey) -> Option<Quote> {
        let quote = self.quotes.get(key).map(|q| q.clone())?;
        if self.expired(&quote) {
            self.quotes.remove(key);
            return None;
        }
        Some(quote)
    }

    /// All non-expired venue quotes for a pair.
    pub fn get_pair(&self, pair: &PairKey) -> HashMap<String, Quote> {
        let Some(venues) = self.venues.get(pair).map(|v| v.clone()) else {
            return HashMap::new();
        };
        let mut out = HashMap::new();
        for venue in venues {
            let key = QuoteKey::new(pair.clone(), venue.clone());
            if let Some(quote) = self.get(&key) {
                out.insert(venue, quote);
            }
        }
        out
    }

    /// Event-driven freshness check for the fetcher.
    pub fn fresh_for_block(&self, key: &QuoteKey, block: u64) -> bool {
        self.get(key).is_some_and(|q| q.is_fresh_for(block))
    }

    /// Drop everything older than `max_age` blocks behind `block`.
    pub fn invalidate_older_than(&self, block: u64, max_age: u64) -> usize {
        let before = self.quotes.len();
        self.quotes
            .retain(|_, q| block.saturating_sub(q.block_number) <= max_age);
        before - self.quotes.len()
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }

    /// Periodic eager sweep; runs until shutdown.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = tick.tick() => {
                    let head = self.head.load(Ordering::Relaxed);
                    let removed = self.invalidate_older_than(head, MAX_AGE_BLOCKS);
                    if removed > 0 {
                        debug!(removed, head, "price cache sweep");
                    }
                }
            }
        }
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}
