use crate::http::Relay;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use thiserror::Error;
use tracing::debug;

pub const API_VERSION: &str = "2023-10";
pub const CARRIER: &str = "UPS";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShopifyError {
    #[error("Shopify credentials missing in settings")]
    MissingCredentials,
    #[error("Failed to get fulfillment order: {0}")]
    Lookup(String),
    #[error("{0}")]
    Rejected(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Storefront side of fulfillment: resolve the fulfillment order, then fulfill it.
pub trait Storefront: Send + Sync {
    /// First fulfillment-order id for the storefront order, if any.
    fn fulfillment_order_id(
        &self,
        order_id: &str,
    ) -> impl Future<Output = Result<Option<u64>, ShopifyError>> + Send;

    fn create_fulfillment(
        &self,
        fulfillment_order_id: u64,
        tracking_number: &str,
    ) -> impl Future<Output = Result<(), ShopifyError>> + Send;
}

#[derive(Debug, Clone)]
pub struct ShopifyClient {
    http: Client,
    domain: String,
    token: String,
    relay: Relay,
}

impl ShopifyClient {
    pub fn new(http: Client, domain: &str, token: &str, relay: Relay) -> Result<Self, ShopifyError> {
        let domain = clean_domain(domain);
        let token = token.trim().to_string();
        if domain.is_empty() || token.is_empty() {
            return Err(ShopifyError::MissingCredentials);
        }
        Ok(Self {
            http,
            domain,
            token,
            relay,
        })
    }

    fn admin_url(&self, path: &str) -> String {
        self.relay.wrap(&format!(
            "https://{}/admin/api/{API_VERSION}/{path}",
            self.domain
        ))
    }
}

pub fn clean_domain(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

#[derive(Debug, Deserialize)]
struct FulfillmentOrdersResponse {
    #[serde(default)]
    fulfillment_orders: Vec<FulfillmentOrder>,
}

#[derive(Debug, Deserialize)]
struct FulfillmentOrder {
    id: u64,
}

#[derive(Debug, Serialize)]
struct CreateFulfillmentRequest<'a> {
    fulfillment: FulfillmentPayload<'a>,
}

#[derive(Debug, Serialize)]
struct FulfillmentPayload<'a> {
    line_items_by_fulfillment_order: Vec<FulfillmentOrderRef>,
    tracking_info: TrackingInfo<'a>,
    notify_customer: bool,
}

#[derive(Debug, Serialize)]
struct FulfillmentOrderRef {
    fulfillment_order_id: u64,
}

#[derive(Debug, Serialize)]
struct TrackingInfo<'a> {
    number: &'a str,
    company: &'static str,
}

fn fulfillment_request(fulfillment_order_id: u64, tracking_number: &str) -> CreateFulfillmentRequest<'_> {
    CreateFulfillmentRequest {
        fulfillment: FulfillmentPayload {
            line_items_by_fulfillment_order: vec![FulfillmentOrderRef {
                fulfillment_order_id,
            }],
            tracking_info: TrackingInfo {
                number: tracking_number,
                company: CARRIER,
            },
            notify_customer: true,
        },
    }
}

impl Storefront for ShopifyClient {
    async fn fulfillment_order_id(&self, order_id: &str) -> Result<Option<u64>, ShopifyError> {
        let url = self.admin_url(&format!("orders/{order_id}/fulfillment_orders.json"));
        let response = self
            .http
            .get(url)
            .header("X-Shopify-Access-Token", &self.token)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|err| ShopifyError::Lookup(err.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShopifyError::Lookup(body));
        }

        let payload: FulfillmentOrdersResponse = response
            .json()
            .await
            .map_err(|err| ShopifyError::Lookup(err.to_string()))?;
        Ok(payload.fulfillment_orders.first().map(|fo| fo.id))
    }

    async fn create_fulfillment(
        &self,
        fulfillment_order_id: u64,
        tracking_number: &str,
    ) -> Result<(), ShopifyError> {
        let body = fulfillment_request(fulfillment_order_id, tracking_number);
        let response = self
            .http
            .post(self.admin_url("fulfillments.json"))
            .header("X-Shopify-Access-Token", &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|err| ShopifyError::Request(err.to_string()))?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .map_err(|err| ShopifyError::Request(format!("HTTP {status}: {err}")))?;
        // `errors` can arrive with a 2xx status.
        if let Some(errors) = payload.get("errors").filter(|e| !e.is_null()) {
            return Err(ShopifyError::Rejected(errors.to_string()));
        }
        if !status.is_success() {
            return Err(ShopifyError::Rejected(format!("HTTP {status}: {payload}")));
        }
        debug!(
            target = "trackmaster.shopify",
            fulfillment_order_id, "fulfillment_created"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn domain_is_normalized() {
        assert_eq!(clean_domain("https://shop.myshopify.com/"), "shop.myshopify.com");
        assert_eq!(clean_domain(" http://shop.myshopify.com"), "shop.myshopify.com");
        assert_eq!(clean_domain("shop.myshopify.com"), "shop.myshopify.com");
    }

    #[test]
    fn client_requires_domain_and_token() {
        let err = ShopifyClient::new(Client::new(), "https://", "tok", Relay::direct())
            .expect_err("empty domain");
        assert_eq!(err, ShopifyError::MissingCredentials);
        assert!(ShopifyClient::new(Client::new(), "shop.myshopify.com", "", Relay::direct()).is_err());
    }

    #[test]
    fn admin_urls_carry_api_version() {
        let client =
            ShopifyClient::new(Client::new(), "https://shop.myshopify.com/", "tok", Relay::direct())
                .unwrap();
        assert_eq!(
            client.admin_url("orders/42/fulfillment_orders.json"),
            "https://shop.myshopify.com/admin/api/2023-10/orders/42/fulfillment_orders.json"
        );
    }

    #[test]
    fn fulfillment_body_shape() {
        let body = serde_json::to_value(fulfillment_request(77, "1Z999")).unwrap();
        assert_eq!(
            body,
            json!({
                "fulfillment": {
                    "line_items_by_fulfillment_order": [{ "fulfillment_order_id": 77 }],
                    "tracking_info": { "number": "1Z999", "company": "UPS" },
                    "notify_customer": true,
                }
            })
        );
    }
}
