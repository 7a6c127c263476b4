use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::LedgerQueryClient;
use crate::error::{ReconcileError, ReconcileResult};
use crate::ledger::models::{TxSummary, UtxoDetail};

/// Blockfrost caps page size at 100
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct BlockfrostConfig {
    /// e.g. https://cardano-mainnet.blockfrost.io/api/v0
    pub base_url: String,
    pub project_id: String,
    pub request_timeout: Duration,
}

impl Default for BlockfrostConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cardano-mainnet.blockfrost.io/api/v0".to_string(),
            project_id: String::new(),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Explorer client for Blockfrost-compatible Cardano APIs
pub struct BlockfrostClient {
    config: BlockfrostConfig,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct LatestBlock {
    height: Option<u64>,
}

impl BlockfrostClient {
    pub fn new(config: BlockfrostConfig) -> ReconcileResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ReconcileError::Fatal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str) -> ReconcileResult<reqwest::Response> {
        debug!("🔎 Explorer GET {}", path);
        let response = self
            .client
            .get(self.url(path))
            .header("project_id", &self.config.project_id)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(map_status(status, &body))
    }
}

/// Map a non-success explorer status into the closed error set.
///
/// 402 is Blockfrost's "daily request limit exceeded" and 418 its auto-ban
/// after ignoring 429s; both stop polling until the cooldown elapses.
pub fn map_status(status: StatusCode, body: &str) -> ReconcileError {
    let detail = format!("{} {}", status.as_u16(), body.trim());
    match status {
        StatusCode::PAYMENT_REQUIRED | StatusCode::IM_A_TEAPOT => {
            ReconcileError::QuotaExceeded(detail)
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            ReconcileError::Transient(detail)
        }
        StatusCode::NOT_FOUND => ReconcileError::Rejected(detail),
        s if s.is_server_error() => ReconcileError::Transient(detail),
        _ => ReconcileError::Fatal(detail),
    }
}

fn validate_tx_hash(tx_hash: &str) -> ReconcileResult<()> {
    match hex::decode(tx_hash) {
        Ok(bytes) if bytes.len() == 32 => Ok(()),
        _ => Err(ReconcileError::Rejected(format!(
            "Invalid transaction hash: {}",
            tx_hash
        ))),
    }
}

#[async_trait]
impl LedgerQueryClient for BlockfrostClient {
    async fn list_recent_transactions(
        &self,
        address: &str,
        count: usize,
    ) -> ReconcileResult<Vec<TxSummary>> {
        let count = count.clamp(1, MAX_PAGE_SIZE);
        let path = format!("/addresses/{}/transactions?count={}&order=desc", address, count);

        match self.get(&path).await {
            Ok(response) => Ok(response.json::<Vec<TxSummary>>().await?),
            // Blockfrost answers 404 for addresses that have never appeared on chain
            Err(ReconcileError::Rejected(detail)) => {
                debug!("Address {} has no history yet ({})", address, detail);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_utxo_detail(&self, tx_hash: &str) -> ReconcileResult<UtxoDetail> {
        validate_tx_hash(tx_hash)?;
        let response = self.get(&format!("/txs/{}/utxos", tx_hash)).await?;
        Ok(response.json::<UtxoDetail>().await?)
    }

    async fn latest_block_height(&self) -> ReconcileResult<u64> {
        let block: LatestBlock = self.get("/blocks/latest").await?.json().await?;
        block.height.ok_or_else(|| {
            warn!("⚠️ Explorer returned a tip without height");
            ReconcileError::Transient("Latest block has no height".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::PAYMENT_REQUIRED, "Usage is over limit"),
            ReconcileError::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_status(StatusCode::IM_A_TEAPOT, "banned"),
            ReconcileError::QuotaExceeded(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ReconcileError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, ""),
            ReconcileError::Transient(_)
        ));
        assert!(matches!(
            map_status(StatusCode::NOT_FOUND, ""),
            ReconcileError::Rejected(_)
        ));
        assert!(matches!(
            map_status(StatusCode::FORBIDDEN, "invalid project token"),
            ReconcileError::Fatal(_)
        ));
    }

    #[test]
    fn test_tx_hash_validation() {
        assert!(validate_tx_hash(&"0f".repeat(32)).is_ok());
        assert!(validate_tx_hash("0f0f").is_err());
        assert!(validate_tx_hash(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_parse_address_transactions() {
        let body = r#"[
            {"tx_hash": "8788591983aa73981fc92d6cddbbe643959f5a784e84b8bee0db15823f575a5b", "tx_index": 6, "block_height": 69, "block_time": 1635505891},
            {"tx_hash": "52e748c4dec58b687b90b0b40d383b9fe1f24c1a833b7395cdf07dd67859f46f", "tx_index": 9, "block_height": 4547, "block_time": 1635505987}
        ]"#;

        let parsed: Vec<TxSummary> = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].block_height, 69);
        assert_eq!(parsed[1].block_time, 1635505987);
    }

    #[test]
    fn test_parse_utxos() {
        let body = r#"{
            "hash": "1e043f100dce12d107f679685acd2fc0610e10f72a92d412794c9773d11d8477",
            "inputs": [
                {"address": "addr1q9ld26v2lv8wvrxxmvg90pn8n8n5k6tdst06q2s856rwmvnueldzuuqmnsye359fqrk8hwvenjnqultn7djtrlft7jnq7dy7wv",
                 "amount": [{"unit": "lovelace", "quantity": "42000000"}],
                 "tx_hash": "1a0570af966fb355a7160e4f82d5a80b8681b7955f5d44bec0dce628516157f0",
                 "output_index": 0, "collateral": false}
            ],
            "outputs": [
                {"address": "addr1q9ld26v2lv8wvrxxmvg90pn8n8n5k6tdst06q2s856rwmvnueldzuuqmnsye359fqrk8hwvenjnqultn7djtrlft7jnq7dy7wv",
                 "amount": [{"unit": "lovelace", "quantity": "2000000"}],
                 "output_index": 0}
            ]
        }"#;

        let parsed: UtxoDetail = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.inputs.len(), 1);
        assert!(parsed.sender().unwrap().starts_with("addr1q9ld"));
        assert_eq!(parsed.amount_paid_to(&parsed.outputs[0].address.clone()), 2_000_000);
    }
}
