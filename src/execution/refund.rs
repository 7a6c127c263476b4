use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::{ReconcileError, ReconcileResult};

/// Transaction submission collaborator
///
/// SECURITY: transaction building and signing live behind this trait, in a
/// separate wallet service; this process never holds spending keys.
#[async_trait]
pub trait RefundSubmitter: Send + Sync {
    /// Submit a refund and wait until the network accepted it for inclusion.
    /// Returns the refund transaction hash.
    ///
    /// INVARIANTS:
    /// - Never retried by callers: a transient error after the request left the
    ///   process may still have produced a transaction
    async fn submit_refund(&self, to_address: &str, amount: u64) -> ReconcileResult<String>;
}

#[derive(Debug, Clone)]
pub struct RefundServiceConfig {
    pub base_url: String,
    pub api_token: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    to_address: &'a str,
    amount: u64,
}

#[derive(Debug, Deserialize)]
struct RefundResponse {
    tx_hash: String,
}

/// Submits refunds through the wallet service's HTTP API (`POST /refunds`)
pub struct HttpRefundSubmitter {
    config: RefundServiceConfig,
    client: Client,
}

impl HttpRefundSubmitter {
    pub fn new(config: RefundServiceConfig) -> ReconcileResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ReconcileError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }
}

fn map_submit_status(status: StatusCode, body: &str) -> ReconcileError {
    let detail = format!("Refund service {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::CONFLICT => ReconcileError::Conflict(detail),
        StatusCode::PAYMENT_REQUIRED => ReconcileError::QuotaExceeded(detail),
        StatusCode::TOO_MANY_REQUESTS => ReconcileError::Transient(detail),
        s if s.is_server_error() => ReconcileError::Transient(detail),
        s if s.is_client_error() => ReconcileError::Rejected(detail),
        _ => ReconcileError::Fatal(detail),
    }
}

#[async_trait]
impl RefundSubmitter for HttpRefundSubmitter {
    #[instrument(skip(self), fields(service = %self.config.base_url))]
    async fn submit_refund(&self, to_address: &str, amount: u64) -> ReconcileResult<String> {
        let url = format!("{}/refunds", self.config.base_url.trim_end_matches('/'));
        let mut request = self
            .client
            .post(&url)
            .json(&RefundRequest { to_address, amount });

        if let Some(token) = &self.config.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(map_submit_status(status, &error_text));
        }

        let result: RefundResponse = response.json().await?;
        info!("💸 Refund submitted to {}: {}", to_address, result.tx_hash);
        Ok(result.tx_hash)
    }
}
