//! Esplora REST adapter for certificate anchoring and verification.
//!
//! Connects the issuance pipeline to any Esplora-compatible block explorer
//! (Blockstream, mempool.space, a self-hosted electrs).
//!
//! ## Endpoints
//! 1. `GET /fee-estimates` for the anchor fee rate (cached)
//! 2. `POST /tx` to broadcast the signed anchor transaction
//! 3. `GET /tx/:txid/status` and `GET /tx/:txid/hex` for verification
//! 4. `GET /blocks/tip/height` for confirmation depth
//! 5. `GET /address/:address/utxo` for wallet funding

pub mod api;
pub mod wallet;

pub use wallet::EsploraWallet;

use api::TxStatus;
use async_trait::async_trait;
use blockcert_core::{BroadcastError, Broadcaster, ChainDataSource, ChainError, ChainKind, ChainTransaction};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum EsploraError {
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Configuration for an Esplora endpoint.
#[derive(Debug, Clone)]
pub struct EsploraConfig {
    /// API root, e.g. `https://blockstream.info/testnet/api`
    pub base_url: String,
    /// Per-request timeout (seconds)
    pub timeout_secs: u64,
    /// Blocks within which the anchor should confirm
    pub confirmation_target: u16,
    /// How long a fee estimate is reused (seconds)
    pub fee_cache_secs: u64,
}

impl EsploraConfig {
    /// Public endpoint for `chain`; regtest assumes a local electrs.
    pub fn for_chain(chain: ChainKind) -> Self {
        let base_url = match chain {
            ChainKind::Bitcoin => "https://blockstream.info/api",
            ChainKind::Testnet => "https://blockstream.info/testnet/api",
            ChainKind::Signet => "https://mempool.space/signet/api",
            ChainKind::Regtest => "http://127.0.0.1:3002",
        };
        Self {
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }
}

impl Default for EsploraConfig {
    fn default() -> Self {
        Self {
            base_url: "https://blockstream.info/testnet/api".to_string(),
            timeout_secs: 30,
            confirmation_target: 6,
            fee_cache_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedFee {
    sat_per_vb: f64,
    fetched_at: DateTime<Utc>,
}

/// Esplora-backed [`Broadcaster`] and [`ChainDataSource`].
pub struct EsploraClient {
    config: EsploraConfig,
    http: reqwest::Client,
    fee_cache: Arc<RwLock<Option<CachedFee>>>,
}

impl EsploraClient {
    pub fn new(config: EsploraConfig) -> Result<Self, EsploraError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config,
            http,
            fee_cache: Arc::new(RwLock::new(None)),
        })
    }

    pub fn config(&self) -> &EsploraConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.config.base_url, path)
    }

    /// GET returning the body, or `None` on 404.
    async fn get_text(&self, path: &str) -> Result<Option<String>, ChainError> {
        let url = self.url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ChainError::Unavailable(format!("GET {url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .text()
                .await
                .map(Some)
                .map_err(|e| ChainError::Unavailable(format!("GET {url}: {e}"))),
            status => Err(ChainError::Unavailable(format!("GET {url}: HTTP {status}"))),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ChainError> {
        match self.get_text(path).await? {
            Some(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| ChainError::Malformed(format!("{path}: {e}"))),
            None => Ok(None),
        }
    }

    async fn tip_height(&self) -> Result<u64, ChainError> {
        let body = self
            .get_text("blocks/tip/height")
            .await?
            .ok_or_else(|| ChainError::Unavailable("tip height not available".into()))?;
        api::parse_height(&body)
    }

    async fn fetch_fee_rate(&self) -> Result<f64, ChainError> {
        let estimates: HashMap<String, f64> = self
            .get_json("fee-estimates")
            .await?
            .ok_or_else(|| ChainError::Unavailable("fee estimates not available".into()))?;
        api::select_fee_rate(&estimates, self.config.confirmation_target)
            .ok_or_else(|| ChainError::Malformed("no usable fee estimate".into()))
    }

    /// UTXOs paying to `address`.
    pub async fn address_utxos(&self, address: &str) -> Result<Vec<api::AddressUtxo>, ChainError> {
        Ok(self
            .get_json(&format!("address/{address}/utxo"))
            .await?
            .unwrap_or_default())
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn fee_rate(&self) -> Result<f64, ChainError> {
        {
            let cache = self.fee_cache.read().await;
            if let Some(cached) = *cache {
                let age = Utc::now() - cached.fetched_at;
                if age.num_seconds() < self.config.fee_cache_secs as i64 {
                    tracing::debug!(fee_rate = cached.sat_per_vb, "Fee estimate cache still valid");
                    return Ok(cached.sat_per_vb);
                }
            }
        }

        let sat_per_vb = self.fetch_fee_rate().await?;
        tracing::debug!(fee_rate = sat_per_vb, target = self.config.confirmation_target, "Fetched fee estimate");
        *self.fee_cache.write().await = Some(CachedFee {
            sat_per_vb,
            fetched_at: Utc::now(),
        });
        Ok(sat_per_vb)
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> Result<String, BroadcastError> {
        let url = self.url("tx");
        let response = self
            .http
            .post(&url)
            .body(hex::encode(raw_tx))
            .send()
            .await
            .map_err(|e| BroadcastError::Transient(format!("POST {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BroadcastError::Transient(format!("POST {url}: {e}")))?;

        let outcome = api::broadcast_outcome(status, &body, raw_tx);
        match &outcome {
            Ok(txid) => tracing::info!(txid = %txid, status = %status, "Esplora accepted transaction"),
            Err(e) => tracing::warn!(status = %status, error = %e, "Esplora refused transaction"),
        }
        outcome
    }
}

#[async_trait]
impl ChainDataSource for EsploraClient {
    async fn get_transaction(&self, txid: &str) -> Result<Option<ChainTransaction>, ChainError> {
        let Some(status) = self.get_json::<TxStatus>(&format!("tx/{txid}/status")).await? else {
            return Ok(None);
        };
        let Some(raw_hex) = self.get_text(&format!("tx/{txid}/hex")).await? else {
            return Ok(None);
        };

        Ok(Some(ChainTransaction {
            txid: txid.to_string(),
            confirmed: status.confirmed,
            block_height: status.block_height,
            embedded_data: api::embedded_data(&raw_hex)?,
        }))
    }

    async fn get_confirmation_count(&self, txid: &str) -> Result<u64, ChainError> {
        let Some(status) = self.get_json::<TxStatus>(&format!("tx/{txid}/status")).await? else {
            return Ok(0);
        };
        if !status.confirmed {
            return Ok(0);
        }
        Ok(api::confirmations(&status, self.tip_height().await?))
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://blockstream.info/api/", "/tx/abc/status"),
            "https://blockstream.info/api/tx/abc/status"
        );
        assert_eq!(join_url("http://127.0.0.1:3002", "fee-estimates"), "http://127.0.0.1:3002/fee-estimates");
    }

    #[test]
    fn test_config_for_chain() {
        assert_eq!(
            EsploraConfig::for_chain(ChainKind::Bitcoin).base_url,
            "https://blockstream.info/api"
        );
        assert_eq!(EsploraConfig::for_chain(ChainKind::Signet).timeout_secs, 30);
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = EsploraClient::new(EsploraConfig::default()).unwrap();
        assert_eq!(client.config().confirmation_target, 6);
        assert_eq!(client.url("tx"), "https://blockstream.info/testnet/api/tx");
    }

    #[tokio::test]
    async fn test_cached_fee_rate_skips_network() {
        let client = EsploraClient::new(EsploraConfig {
            base_url: "http://127.0.0.1:9".into(),
            ..EsploraConfig::default()
        })
        .unwrap();
        *client.fee_cache.write().await = Some(CachedFee {
            sat_per_vb: 7.5,
            fetched_at: Utc::now(),
        });
        assert_eq!(client.fee_rate().await.unwrap(), 7.5);
    }
}
