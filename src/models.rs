use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

pub const COLUMN_NAME: &str = "Name";
pub const COLUMN_ZIP: &str = "Shipping Zip";
pub const COLUMN_CREATED_AT: &str = "Created at";
pub const COLUMN_ID: &str = "Id";

/// One storefront export row. Unknown columns are kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderRow {
    pub order_number: String,
    pub shipping_zip: String,
    pub created_at: String,
    pub storefront_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl OrderRow {
    pub fn from_fields(mut fields: BTreeMap<String, String>) -> Self {
        let order_number = fields.remove(COLUMN_NAME).unwrap_or_default();
        let shipping_zip = fields.remove(COLUMN_ZIP).unwrap_or_default();
        let created_at = fields.remove(COLUMN_CREATED_AT).unwrap_or_default();
        let storefront_id = fields
            .remove(COLUMN_ID)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        Self {
            order_number: order_number.trim().to_string(),
            shipping_zip,
            created_at,
            storefront_id,
            extra: fields,
        }
    }

    /// The `YYYY-MM-DD` prefix of the creation timestamp.
    pub fn order_date_str(&self) -> &str {
        let raw = self.created_at.trim();
        raw.get(..10).unwrap_or(raw)
    }
}

/// A shipment record as returned by the provider search endpoint.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingCandidate {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub expected_delivery: Option<String>,
    #[serde(default)]
    pub tracking_number: Option<String>,
    #[serde(default)]
    pub shipped_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub weight: Option<String>,
    #[serde(default)]
    pub hash_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrackStatus {
    Queued,
    Processed,
    Skipped,
    Error,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingResult {
    pub order_number: String,
    pub storefront_id: Option<String>,
    pub zip: String,
    pub order_date: String,
    pub tracking_number: Option<String>,
    pub hash_id: Option<String>,
    pub tracking_url: Option<String>,
    pub expected_delivery: Option<String>,
    pub weight: Option<String>,
    pub status: TrackStatus,
    pub note: Option<String>,
    pub is_7_days_future: bool,
    pub processed_at: DateTime<Utc>,
    pub diagnostics: Option<Value>,
}

impl TrackingResult {
    /// A result with no tracking data attached yet.
    pub fn bare(row: &OrderRow, zip: &str, order_date: &str, status: TrackStatus) -> Self {
        Self {
            order_number: row.order_number.clone(),
            storefront_id: row.storefront_id.clone(),
            zip: zip.to_string(),
            order_date: order_date.to_string(),
            tracking_number: None,
            hash_id: None,
            tracking_url: None,
            expected_delivery: None,
            weight: None,
            status,
            note: None,
            is_7_days_future: false,
            processed_at: Utc::now(),
            diagnostics: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn has_full_tracking(&self) -> bool {
        self.tracking_number
            .as_deref()
            .is_some_and(|n| !n.trim().is_empty() && !is_masked(n))
    }

    /// Queue entry for a held result; `None` unless both URL and delivery are known.
    pub fn queue_item(&self, added_at: DateTime<Utc>) -> Option<QueueItem> {
        if self.status != TrackStatus::Queued {
            return None;
        }
        Some(QueueItem {
            order_number: self.order_number.clone(),
            tracking_url: self.tracking_url.clone()?,
            expected_delivery: self.expected_delivery.clone()?,
            added_at,
        })
    }
}

pub const MASK_CHAR: char = '*';

pub fn is_masked(tracking_number: &str) -> bool {
    tracking_number.contains(MASK_CHAR)
}

pub fn tracking_url(tracking_number: &str) -> String {
    format!("https://www.ups.com/track?tracknum={tracking_number}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub order_number: String,
    pub tracking_url: String,
    pub expected_delivery: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchasedItem {
    pub order_number: String,
    pub tracking_number: String,
    pub tracking_url: String,
    pub expected_delivery: Option<String>,
    pub zip: String,
    pub purchased_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureAction {
    Process,
    Buy,
    Fulfill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedItem {
    pub order_number: String,
    pub action: FailureAction,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedItem {
    pub fn new(order_number: &str, action: FailureAction, reason: impl Into<String>) -> Self {
        Self {
            order_number: order_number.to_string(),
            action,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Operator settings persisted alongside the ledgers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub shopify_domain: String,
    #[serde(default)]
    pub shopify_token: String,
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default)]
    pub relay_key: Option<String>,
    #[serde(default = "default_days_for_queue")]
    pub days_for_queue: u32,
    #[serde(default = "default_days_for_warning")]
    pub days_for_warning: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            shopify_domain: String::new(),
            shopify_token: String::new(),
            relay_url: None,
            relay_key: None,
            days_for_queue: default_days_for_queue(),
            days_for_warning: default_days_for_warning(),
            limit: default_limit(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: std::env::var("TRACKING_API_KEY").unwrap_or_default(),
            shopify_domain: std::env::var("SHOPIFY_DOMAIN").unwrap_or_default(),
            shopify_token: std::env::var("SHOPIFY_TOKEN").unwrap_or_default(),
            relay_url: env_non_empty("RELAY_URL"),
            relay_key: env_non_empty("RELAY_KEY"),
            days_for_queue: env_u32("DAYS_FOR_QUEUE").unwrap_or(defaults.days_for_queue),
            days_for_warning: env_u32("DAYS_FOR_WARNING").unwrap_or(defaults.days_for_warning),
            limit: env_u32("API_LIMIT")
                .filter(|v| *v > 0)
                .unwrap_or(defaults.limit),
        }
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            days_for_queue: self.days_for_queue,
            days_for_warning: self.days_for_warning,
        }
    }

    /// Incoming settings where any secret still equal to the preview of the
    /// stored one is replaced by the stored value.
    pub fn keep_secrets_from(self, stored: &Settings) -> Self {
        let keep = |incoming: String, current: &str| {
            if !current.is_empty() && incoming == preview_secret(current) {
                current.to_string()
            } else {
                incoming
            }
        };
        Self {
            api_key: keep(self.api_key, &stored.api_key),
            shopify_token: keep(self.shopify_token, &stored.shopify_token),
            relay_key: match (self.relay_key, stored.relay_key.as_deref()) {
                (Some(incoming), Some(current)) => Some(keep(incoming, current)),
                (incoming, _) => incoming,
            },
            ..self
        }
    }

    /// Copy safe to hand back to a client: secrets reduced to a short preview.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: preview_secret(&self.api_key),
            shopify_token: preview_secret(&self.shopify_token),
            relay_key: self.relay_key.as_deref().map(preview_secret),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub days_for_queue: u32,
    pub days_for_warning: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            days_for_queue: default_days_for_queue(),
            days_for_warning: default_days_for_warning(),
        }
    }
}

fn default_days_for_queue() -> u32 {
    4
}

fn default_days_for_warning() -> u32 {
    7
}

fn default_limit() -> u32 {
    3000
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn preview_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let head: String = secret.chars().take(4).collect();
    format!("{head}…")
}

// Providers send weight as either a number or a string.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
