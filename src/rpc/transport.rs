//! Reference alloy-backed transport.
//!
//! Binds one endpoint URL to the `ChainClient` trait. The core never
//! depends on this module directly — the binary wires it into the RPC
//! pool; embedders are free to substitute their own bindings.
//!
//! The `multicall` pseudo-method is served with plain `eth_call` reads
//! using hard-coded selectors (getReserves / slot0 / liquidity), so no
//! on-chain aggregator contract is required.

use crate::config::{EndpointConfig, EndpointKind};
use crate::errors::RpcError;
use crate::rpc::client::{BlockHead, BlockStream, ChainClient, Log, LogFilter, LogStream};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::borrow::Cow;
use tracing::{debug, warn};

/// getReserves() selector.
const SEL_GET_RESERVES: &str = "0x0902f1ac";
/// slot0() selector.
const SEL_SLOT0: &str = "0x3850c7bd";
/// liquidity() selector.
const SEL_LIQUIDITY: &str = "0x1a686502";

pub struct AlloyTransport {
    provider: DynProvider,
    url: String,
}

impl AlloyTransport {
    /// Connect one configured endpoint. WS endpoints get a pubsub-capable
    /// provider; HTTP endpoints cannot serve subscriptions and will
    /// answer those calls with an error.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self, RpcError> {
        let provider = match endpoint.kind {
            EndpointKind::Ws => ProviderBuilder::new()
                .connect_ws(WsConnect::new(endpoint.url.clone()))
                .await
                .map_err(|e| RpcError::Transient(format!("ws connect {}: {e}", endpoint.url)))?
                .erased(),
            EndpointKind::Http => {
                let url = endpoint
                    .url
                    .parse()
                    .map_err(|e| RpcError::Permanent(format!("bad url {}: {e}", endpoint.url)))?;
                ProviderBuilder::new().connect_http(url).erased()
            }
        };
        Ok(Self {
            provider,
            url: endpoint.url.clone(),
        })
    }

    fn classify(err: impl std::fmt::Display) -> RpcError {
        let text = err.to_string();
        if text.contains("revert") || text.contains("execution reverted") {
            RpcError::Permanent(text)
        } else {
            RpcError::Transient(text)
        }
    }

    async fn eth_call(&self, to: Address, selector: &str) -> Result<Vec<u8>, RpcError> {
        let params = json!([{ "to": to, "data": selector }, "latest"]);
        let raw: String = self
            .provider
            .raw_request(Cow::Borrowed("eth_call"), params)
            .await
            .map_err(Self::classify)?;
        let hex = raw.strip_prefix("0x").unwrap_or(&raw);
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&hex[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| RpcError::Permanent(format!("bad eth_call hex: {e}")))?;
        Ok(bytes)
    }

    fn word(data: &[u8], index: usize) -> Option<U256> {
        data.get(index * 32..(index + 1) * 32).map(U256::from_be_slice)
    }

    /// One pool read for the fetcher's multicall contract.
    async fn pool_read(&self, read: &serde_json::Value) -> serde_json::Value {
        let Some(pool) = read
            .get("pool")
            .and_then(|p| serde_json::from_value::<Address>(p.clone()).ok())
        else {
            return serde_json::Value::Null;
        };
        let kind = read.get("kind").and_then(|k| k.as_str()).unwrap_or("reserves");

        let result = if kind == "slot0" {
            let slot0 = self.eth_call(pool, SEL_SLOT0).await;
            let liquidity = self.eth_call(pool, SEL_LIQUIDITY).await;
            match (slot0, liquidity) {
                (Ok(s), Ok(l)) => {
                    let sqrt_price = Self::word(&s, 0);
                    let tick = Self::word(&s, 1)
                        .map(|t| t.as_limbs()[0] as i64 as i32);
                    let liq = Self::word(&l, 0);
                    match (sqrt_price, tick, liq) {
                        (Some(sp), Some(tick), Some(liq)) => Some(json!({
                            "sqrtPriceX96": sp.to_string(),
                            "liquidity": liq.to_string(),
                            "tick": tick,
                        })),
                        _ => None,
                    }
                }
                _ => None,
            }
        } else {
            match self.eth_call(pool, SEL_GET_RESERVES).await {
                Ok(data) => match (Self::word(&data, 0), Self::word(&data, 1)) {
                    (Some(r0), Some(r1)) => Some(json!({
                        "reserve0": r0.to_string(),
                        "reserve1": r1.to_string(),
                    })),
                    _ => None,
                },
                Err(err) => {
                    debug!(%pool, %err, "pool read failed");
                    None
                }
            }
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

#[async_trait]
impl ChainClient for AlloyTransport {
    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        if method == "multicall" {
            let reads = params
                .get("reads")
                .and_then(|r| r.as_array())
                .cloned()
                .unwrap_or_default();
            let mut out = Vec::with_capacity(reads.len());
            for read in &reads {
                out.push(self.pool_read(read).await);
            }
            return Ok(serde_json::Value::Array(out));
        }

        self.provider
            .raw_request(Cow::Owned(method.to_string()), params)
            .await
            .map_err(Self::classify)
    }

    async fn subscribe_logs(&self, filter: LogFilter) -> Result<LogStream, RpcError> {
        let mut rpc_filter = Filter::new();
        if !filter.address.is_empty() {
            rpc_filter = rpc_filter.address(filter.address.clone());
        }
        if let Some(topic0) = filter.topics.first() {
            rpc_filter = rpc_filter.event_signature(topic0.clone());
        }

        let subscription = self
            .provider
            .subscribe_logs(&rpc_filter)
            .await
            .map_err(|e| {
                warn!(url = %self.url, %e, "log subscription failed");
                Self::classify(e)
            })?;

        let stream = subscription.into_stream().filter_map(|log| async move {
            let block_number = log.block_number?;
            let tx_hash = log.transaction_hash.unwrap_or(B256::ZERO);
            let log_index = log.log_index.unwrap_or(0);
            Some(Log {
                address: log.inner.address,
                topics: log.inner.data.topics().to_vec(),
                data: Bytes::from(log.inner.data.data.clone()),
                block_number,
                tx_hash,
                log_index,
            })
        });
        Ok(Box::pin(stream))
    }

    async fn subscribe_blocks(&self) -> Result<BlockStream, RpcError> {
        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(Self::classify)?;
        let stream = subscription.into_stream().map(|header| BlockHead {
            number: header.number,
            timestamp: header.timestamp,
        });
        Ok(Box::pin(stream))
    }

    async fn get_gas_price(&self) -> Result<U256, RpcError> {
        self.provider
            .get_gas_price()
            .await
            .map(U256::from)
            .map_err(Self::classify)
    }

    async fn get_block_number(&self) -> Result<u64, RpcError> {
        self.provider
            .get_block_number()
            .await
            .map_err(Self::classify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_extraction() {
        let mut data = vec![0u8; 64];
        data[31] = 0x2a; // word 0 = 42
        data[63] = 0x07; // word 1 = 7
        assert_eq!(AlloyTransport::word(&data, 0), Some(U256::from(42u64)));
        assert_eq!(AlloyTransport::word(&data, 1), Some(U256::from(7u64)));
        assert_eq!(AlloyTransport::word(&data, 2), None);
    }

    #[test]
    fn test_error_classification() {
        assert!(matches!(
            AlloyTransport::classify("execution reverted: K"),
            RpcError::Permanent(_)
        ));
        assert!(matches!(
            AlloyTransport::classify("connection reset by peer"),
            RpcError::Transient(_)
        ));
    }
}
