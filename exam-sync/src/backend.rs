//! Delivery contract with the exam backend

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::record::{idempotency_key, Collection, Record, RecordPayload};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A record as submitted to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub idempotency_key: String,
    pub node_id: Uuid,
    pub collection: Collection,
    pub local_id: i64,
    pub saved_at: DateTime<Utc>,
    /// 1-based attempt number of this submission
    pub attempt: u32,
    pub payload: RecordPayload,
    pub blob: Option<Vec<u8>>,
}

impl OutboundRecord {
    pub fn from_record(node_id: Uuid, record: &Record, attempt: u32) -> Self {
        Self {
            idempotency_key: idempotency_key(node_id, record.collection, record.local_id),
            node_id,
            collection: record.collection,
            local_id: record.local_id,
            saved_at: record.saved_at,
            attempt,
            payload: record.payload.clone(),
            blob: record.blob.clone(),
        }
    }
}

/// Backend answer for one submission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub accepted: bool,
    #[serde(default)]
    pub server_id: Option<String>,
    /// The backend already held a record with this idempotency key.
    #[serde(default)]
    pub duplicate: bool,
}

impl DeliveryAck {
    pub fn accepted(server_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            server_id: Some(server_id.into()),
            duplicate: false,
        }
    }

    pub fn duplicate() -> Self {
        Self {
            accepted: true,
            server_id: None,
            duplicate: true,
        }
    }
}

/// Exam backend submission endpoint.
///
/// Implementations must not retry internally; the sync engine owns retries
/// and timeouts.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    async fn deliver(&self, collection: Collection, record: &OutboundRecord) -> SyncResult<DeliveryAck>;
}

#[derive(Serialize)]
struct DeliveryBody<'a> {
    node_id: Uuid,
    local_id: i64,
    saved_at: DateTime<Utc>,
    attempt: u32,
    payload: &'a RecordPayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    blob_base64: Option<String>,
}

/// HTTP backend: `POST {server_url}/exam-sync/{collection}`
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<SecretString>,
}

impl HttpBackend {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            auth_token: config
                .auth_token
                .as_ref()
                .map(|token| SecretString::new(token.expose_secret().clone())),
        })
    }

    fn endpoint(&self, collection: Collection) -> String {
        format!("{}/exam-sync/{}", self.base_url, collection.as_str())
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn deliver(&self, collection: Collection, record: &OutboundRecord) -> SyncResult<DeliveryAck> {
        let body = DeliveryBody {
            node_id: record.node_id,
            local_id: record.local_id,
            saved_at: record.saved_at,
            attempt: record.attempt,
            payload: &record.payload,
            blob_base64: record.blob.as_ref().map(|blob| STANDARD.encode(blob)),
        };

        let mut req = self
            .client
            .post(self.endpoint(collection))
            .header("Idempotency-Key", &record.idempotency_key)
            .json(&body);

        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token.expose_secret());
        }

        let response = req.send().await?;
        let status = response.status();

        if status == reqwest::StatusCode::CONFLICT {
            tracing::debug!(
                key = %record.idempotency_key,
                "Backend already holds record"
            );
            return Ok(DeliveryAck::duplicate());
        }

        if !status.is_success() {
            return Err(SyncError::Delivery(format!(
                "{} rejected with status {}",
                collection, status
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(DeliveryAck {
                accepted: true,
                ..DeliveryAck::default()
            });
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}
