use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{error, info};

use crate::error::{ReconcileError, ReconcileResult};
use crate::monitor::TransferEvent;

/// Body POSTed to the configured webhook for each accepted transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferWebhookPayload {
    pub event: &'static str,
    pub tx_hash: String,
    pub from_address: String,
    pub amount: u64,
    pub block_height: u64,
    pub refund_success: bool,
    pub refund_tx_hash: Option<String>,
    pub already_refunded: bool,
    pub refund_error: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl From<&TransferEvent> for TransferWebhookPayload {
    fn from(event: &TransferEvent) -> Self {
        Self {
            event: "transfer.accepted",
            tx_hash: event.transfer.tx_hash.clone(),
            from_address: event.transfer.from_address.clone(),
            amount: event.transfer.amount,
            block_height: event.transfer.block_height,
            refund_success: event.refund.success,
            refund_tx_hash: event.refund.tx_hash.clone(),
            already_refunded: event.refund.already_processed,
            refund_error: event.refund.error.clone(),
            observed_at: event.observed_at,
        }
    }
}

/// Transfer listener that forwards events to an HTTP endpoint.
///
/// Delivery runs on a spawned task, so the monitor tick never waits on the
/// receiving end. Delivery failures are logged and not retried.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> ReconcileResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReconcileError::Fatal(format!("Failed to build webhook client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue delivery of one event. Fails only when no Tokio runtime is available.
    pub fn dispatch(&self, event: &TransferEvent) -> anyhow::Result<()> {
        let handle = Handle::try_current().context("no Tokio runtime for webhook delivery")?;
        let payload = TransferWebhookPayload::from(event);
        let client = self.client.clone();
        let url = self.url.clone();

        handle.spawn(async move {
            let tx_hash = payload.tx_hash.clone();
            match deliver(&client, &url, &payload).await {
                Ok(()) => info!("📨 Webhook delivered for {}", tx_hash),
                Err(e) => error!("❌ Webhook delivery failed for {}: {:#}", tx_hash, e),
            }
        });

        Ok(())
    }

    /// Adapt into a listener for [`crate::monitor::DepositMonitor::register_listener`]
    pub fn into_listener(self) -> impl Fn(&TransferEvent) -> anyhow::Result<()> + Send + Sync + 'static {
        move |event| self.dispatch(event)
    }
}

async fn deliver(client: &Client, url: &str, payload: &TransferWebhookPayload) -> anyhow::Result<()> {
    let response = client
        .post(url)
        .json(payload)
        .send()
        .await
        .context("webhook request failed")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("webhook returned {}", status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit::RefundOutcome;
    use crate::test_utils::{address, sample_transfer};

    fn event() -> TransferEvent {
        TransferEvent {
            transfer: sample_transfer("w1", &address("alice"), 2_500_000),
            refund: RefundOutcome::issued("refund-1".to_string()),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_carries_transfer_and_refund() {
        let payload = TransferWebhookPayload::from(&event());
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["event"], "transfer.accepted");
        assert_eq!(json["amount"], 2_500_000);
        assert_eq!(json["from_address"], address("alice"));
        assert_eq!(json["refund_tx_hash"], "refund-1");
        assert_eq!(json["already_refunded"], false);
    }

    #[test]
    fn test_dispatch_without_runtime_fails() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_secs(1)).unwrap();
        assert!(notifier.dispatch(&event()).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_for_delivery() {
        // Nothing listens on the discard port; the failure is only logged
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        let listener = notifier.into_listener();
        assert!(listener(&event()).is_ok());
    }
}
