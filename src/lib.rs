//! Multi-chain DEX arbitrage detection and coordination core.
//!
//! Watches pool events and block heads across EVM chains, keeps a
//! freshness-aware price cache, runs a family of detectors over it, and
//! hands scored opportunities to a pluggable executor. Trade execution,
//! key custody and durable storage stay outside this crate.

pub mod alerts;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod detectors;
pub mod dispatch;
pub mod errors;
pub mod fetcher;
pub mod graph;
pub mod ingest;
pub mod math;
pub mod monitor;
pub mod oracle;
pub mod prioritizer;
pub mod router;
pub mod rpc;
pub mod scoring;
pub mod types;
pub mod whale;

// Re-export the types embedders touch most.
pub use config::AppConfig;
pub use coordinator::{ChainCoordinator, ChainStatus};
pub use dispatch::{DispatchDecision, Dispatcher, Executor};
pub use router::{BridgeAdapter, CrossChainRouter};
pub use types::{ExecutionResult, Opportunity, OpportunityKind, PairKey, Quote};
