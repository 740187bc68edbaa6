//! The abstract chain client consumed by every upstream component.
//!
//! Concrete RPC bindings (alloy providers, IPC, test doubles) live outside
//! the core: they implement `ChainClient` and are handed to the `RpcPool`,
//! which itself implements the same trait with health-based failover on top.

use crate::errors::RpcError;
use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// A decoded-enough log: topics and data stay raw, the ingestor decodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

/// eth_subscribe("logs") style filter: up to 4 topic positions, each
/// position matching any of its listed values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub address: Vec<Address>,
    pub topics: Vec<Vec<B256>>,
}

/// A new chain head notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub number: u64,
    pub timestamp: u64,
}

pub type LogStream = Pin<Box<dyn Stream<Item = Log> + Send>>;
pub type BlockStream = Pin<Box<dyn Stream<Item = BlockHead> + Send>>;

/// Abstract JSON-RPC-shaped chain access.
///
/// `call` carries method + params as JSON values; the fetcher uses it for
/// batched pool reads (multicall), the gas cache for gas price. All
/// methods may suspend on I/O and must be safe to invoke from any task.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError>;

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream, RpcError>;

    async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError>;

    async fn get_gas_price(&self) -> Result<U256, RpcError>;

    async fn get_block_number(&self) -> Result<u64, RpcError>;
}
