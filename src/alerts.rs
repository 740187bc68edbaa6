//! Webhook alert sink.
//!
//! Fire-and-forget JSON POSTs for the conditions worth a human ping —
//! currently severe stablecoin depegs. Sends happen on a detached task so
//! the detection path never blocks on HTTP; failures are logged and
//! dropped.

use crate::detectors::{DepegAlert, DepegSeverity};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AlertSink {
    webhook_url: Option<String>,
    client: reqwest::Client,
    chain_name: String,
}

impl AlertSink {
    pub fn new(webhook_url: Option<String>, chain_name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            webhook_url,
            client: reqwest::Client::new(),
            chain_name: chain_name.into(),
        })
    }

    pub fn enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Post a severe depeg. Lesser severities are log-only.
    pub fn notify_depeg(self: &Arc<Self>, alert: &DepegAlert) {
        if alert.severity != DepegSeverity::Severe {
            return;
        }
        let Some(url) = self.webhook_url.clone() else {
            debug!(pair = %alert.pair, "no webhook configured, severe depeg logged only");
            return;
        };

        let payload = json!({
            "content": format!(
                "🚨 severe depeg: {} on {} at {:.4} (chain {}, block {})",
                alert.pair, alert.venue, alert.price, self.chain_name, alert.block_number
            ),
        });
        let client = self.client.clone();
        tokio::spawn(async move {
            let sent = client
                .post(&url)
                .timeout(SEND_TIMEOUT)
                .json(&payload)
                .send()
                .await;
            match sent {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => warn!(status = %resp.status(), "depeg webhook rejected"),
                Err(err) => warn!(%err, "depeg webhook send failed"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PairKey;

    fn alert(severity: DepegSeverity) -> DepegAlert {
        DepegAlert {
            pair: PairKey::new("USDC", "USDT"),
            venue: "curve".into(),
            price: 0.95,
            severity,
            block_number: 100,
        }
    }

    #[tokio::test]
    async fn test_disabled_sink_is_noop() {
        let sink = AlertSink::new(None, "polygon");
        assert!(!sink.enabled());
        // Must not panic or spawn anything that outlives the test
        sink.notify_depeg(&alert(DepegSeverity::Severe));
    }

    #[tokio::test]
    async fn test_non_severe_never_sends() {
        // Even with a (bogus) webhook configured, minor/moderate stay local.
        let sink = AlertSink::new(Some("http://127.0.0.1:9/unroutable".into()), "polygon");
        sink.notify_depeg(&alert(DepegSeverity::Minor));
        sink.notify_depeg(&alert(DepegSeverity::Moderate));
    }
}
