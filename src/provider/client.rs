use crate::http::Relay;
use crate::models::TrackingCandidate;
use crate::provider::config::{BUY_URL, SEARCH_URL};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("API key is missing in settings")]
    MissingCredential,
    #[error("{0}")]
    Rejected(String),
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Buy API Error: {0}")]
    Purchase(String),
}

/// Body of one provider search, serialized verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub searchby: &'static str,
    pub zip: String,
    #[serde(rename = "shipped_from")]
    pub shipped_from: String,
    #[serde(rename = "shipped_to")]
    pub shipped_to: String,
    pub show_preshipment: u8,
    pub limit: u32,
}

impl SearchQuery {
    pub fn by_zip(zip: &str, shipped_from: String, shipped_to: String, limit: u32) -> Self {
        Self {
            searchby: "zip_code",
            zip: zip.to_string(),
            shipped_from,
            shipped_to,
            show_preshipment: 1,
            limit,
        }
    }
}

/// The shipment-tracking provider: candidate search and full-number purchase.
pub trait TrackingProvider: Send + Sync {
    fn search(
        &self,
        query: &SearchQuery,
    ) -> impl Future<Output = Result<Vec<TrackingCandidate>, ProviderError>> + Send;

    /// Buys the unmasked tracking number behind `hash_id`.
    fn purchase(&self, hash_id: &str)
    -> impl Future<Output = Result<String, ProviderError>> + Send;
}

#[derive(Debug, Clone)]
pub struct TrackingClient {
    http: Client,
    api_key: String,
    relay: Relay,
}

impl TrackingClient {
    pub fn new(http: Client, api_key: impl Into<String>, relay: Relay) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            relay,
        }
    }

    fn credential(&self) -> Result<&str, ProviderError> {
        let key = self.api_key.trim();
        if key.is_empty() {
            return Err(ProviderError::MissingCredential);
        }
        Ok(key)
    }
}

#[derive(Debug, Default, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    data: Option<SearchData>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    data: Option<Vec<TrackingCandidate>>,
}

#[derive(Debug, Deserialize)]
struct PurchaseResponse {
    #[serde(default)]
    success: Value,
    #[serde(default)]
    message: Option<String>,
}

impl PurchaseResponse {
    fn succeeded(&self) -> bool {
        match &self.success {
            Value::Bool(flag) => *flag,
            Value::String(text) => text.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }
}

impl TrackingProvider for TrackingClient {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<TrackingCandidate>, ProviderError> {
        let key = self.credential()?;
        let response = self
            .http
            .post(self.relay.wrap(SEARCH_URL.as_str()))
            .bearer_auth(key)
            .header("accept", "application/json")
            .json(query)
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected(if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body
            }));
        }

        let payload: SearchResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;
        let candidates = payload.data.and_then(|d| d.data).unwrap_or_default();
        debug!(
            target = "trackmaster.provider",
            zip = %query.zip,
            candidates = candidates.len(),
            "search_complete"
        );
        Ok(candidates)
    }

    async fn purchase(&self, hash_id: &str) -> Result<String, ProviderError> {
        let key = self
            .credential()
            .map_err(|err| ProviderError::Purchase(err.to_string()))?;
        let response = self
            .http
            .post(self.relay.wrap(BUY_URL.as_str()))
            .bearer_auth(key)
            .header("accept", "application/json")
            .json(&serde_json::json!({ "hashid": hash_id }))
            .send()
            .await
            .map_err(|err| ProviderError::Purchase(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Purchase(if body.trim().is_empty() {
                format!("HTTP {status}")
            } else {
                body
            }));
        }

        let payload: PurchaseResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Purchase(err.to_string()))?;
        if payload.succeeded() {
            return payload
                .message
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty())
                .ok_or_else(|| ProviderError::Purchase("empty tracking number".into()));
        }
        Err(ProviderError::Purchase(payload.message.unwrap_or_else(|| {
            "Unknown error purchasing tracking".to_string()
        })))
    }
}
