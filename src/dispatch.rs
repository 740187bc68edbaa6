//! Opportunity dispatch: score gate, per-chain execution slot, outcome
//! history, prioritizer feedback.
//!
//! Executions are serialized per chain through a single-slot try-lock.
//! Opportunities arriving while the slot is busy are dropped, not queued —
//! they stale within seconds and a queue would just execute against dead
//! prices. Every execution, successful or not, feeds the pair back to the
//! prioritizer so the pair gets watched harder.

use crate::prioritizer::AdaptivePrioritizer;
use crate::scoring::ScoreBreakdown;
use crate::types::{ExecutionResult, Opportunity, OpportunityKind};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded outcome history.
const HISTORY_CAP: usize = 1_000;

/// Execution transport port. Must be safe to invoke once at a time per
/// chain — the dispatcher guarantees it never overlaps calls. Timeouts
/// are the executor's own responsibility.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, opportunity: Opportunity) -> ExecutionResult;
}

/// What happened to a dispatched opportunity.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchDecision {
    Executed(ExecutionResult),
    SkippedLowScore,
    DroppedBusy,
}

/// One completed execution, kept in the ring buffer.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub opportunity_id: Uuid,
    pub kind: OpportunityKind,
    pub score: f64,
    pub result: ExecutionResult,
    pub completed_at: DateTime<Utc>,
}

pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    prioritizer: Arc<AdaptivePrioritizer>,
    min_score: f64,
    /// The per-chain execution slot. try-lock only: busy means drop.
    slot: AsyncMutex<()>,
    history: Mutex<VecDeque<ExecutionOutcome>>,
    realized_usd: Mutex<Decimal>,
    executed: AtomicU64,
    dropped_busy: AtomicU64,
    skipped_low_score: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn Executor>,
        prioritizer: Arc<AdaptivePrioritizer>,
        min_score: f64,
    ) -> Self {
        Self {
            executor,
            prioritizer,
            min_score,
            slot: AsyncMutex::new(()),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_CAP)),
            realized_usd: Mutex::new(Decimal::ZERO),
            executed: AtomicU64::new(0),
            dropped_busy: AtomicU64::new(0),
            skipped_low_score: AtomicU64::new(0),
        }
    }

    /// Route one scored opportunity.
    pub async fn dispatch(&self, opp: Opportunity, score: &ScoreBreakdown) -> DispatchDecision {
        if score.composite < self.min_score {
            self.skipped_low_score.fetch_add(1, Ordering::Relaxed);
            debug!(
                id = %opp.id,
                score = score.composite,
                min = self.min_score,
                "opportunity below dispatch score"
            );
            return DispatchDecision::SkippedLowScore;
        }

        // Single-slot serialization: never two concurrent executions per
        // chain, and no queueing — a stale opportunity is worthless.
        let Ok(guard) = self.slot.try_lock() else {
            self.dropped_busy.fetch_add(1, Ordering::Relaxed);
            debug!(id = %opp.id, "executor busy, opportunity dropped");
            return DispatchDecision::DroppedBusy;
        };

        let id = opp.id;
        let kind = opp.kind;
        let pairs = opp.pairs.clone();
        info!(
            %id,
            ?kind,
            score = score.composite,
            net_usd = opp.estimated_net_profit,
            "dispatching opportunity"
        );

        let result = self.executor.execute(opp).await;
        drop(guard);
        self.executed.fetch_add(1, Ordering::Relaxed);

        // Feedback fires regardless of outcome: activity on the pair means
        // it deserves HOT monitoring either way.
        for pair in &pairs {
            self.prioritizer.record_opportunity(pair);
        }

        if let Some(profit) = result.actual_profit_usd {
            if let Some(delta) = Decimal::from_f64(profit) {
                *self.realized_usd.lock().unwrap() += delta;
            }
        }
        if !result.succeeded() {
            warn!(%id, status = ?result.status, "execution did not land");
        }

        self.record_outcome(ExecutionOutcome {
            opportunity_id: id,
            kind,
            score: score.composite,
            result: result.clone(),
            completed_at: Utc::now(),
        });

        DispatchDecision::Executed(result)
    }

    fn record_outcome(&self, outcome: ExecutionOutcome) {
        let mut history = self.history.lock().unwrap();
        if history.len() == HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(outcome);
    }

    /// Most recent outcomes, newest last.
    pub fn recent_outcomes(&self, n: usize) -> Vec<ExecutionOutcome> {
        let history = self.history.lock().unwrap();
        history.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn realized_usd(&self) -> Decimal {
        *self.realized_usd.lock().unwrap()
    }

    pub fn executed_count(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn dropped_busy_count(&self) -> u64 {
        self.dropped_busy.load(Ordering::Relaxed)
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped_low_score.load(Ordering::Relaxed)
    }

    /// Wait for any in-flight execution to finish, bounded by `timeout`.
    /// Used by graceful stop.
    pub async fn drain(&self, timeout: std::time::Duration) -> bool {
        tokio::time::timeout(timeout, self.slot.lock()).await.is_ok()
    }
}
