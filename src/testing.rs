//! In-process stand-ins for the provider and storefront.

use crate::models::{OrderRow, Settings, TrackingCandidate};
use crate::pipeline::{Connect, PipelineError};
use crate::provider::{ProviderError, SearchQuery, TrackingProvider};
use crate::shopify::{ShopifyError, Storefront};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct FakeProvider {
    searches: HashMap<String, Result<Vec<TrackingCandidate>, ProviderError>>,
    purchases: HashMap<String, Result<String, ProviderError>>,
    pub queries: Mutex<Vec<SearchQuery>>,
    pub bought: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn with_search(
        mut self,
        zip: &str,
        result: Result<Vec<TrackingCandidate>, ProviderError>,
    ) -> Self {
        self.searches.insert(zip.to_string(), result);
        self
    }

    pub fn with_purchase(mut self, hash_id: &str, result: Result<String, ProviderError>) -> Self {
        self.purchases.insert(hash_id.to_string(), result);
        self
    }

    pub fn searched_zips(&self) -> Vec<String> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .map(|q| q.zip.clone())
            .collect()
    }
}

impl TrackingProvider for FakeProvider {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<TrackingCandidate>, ProviderError> {
        self.queries.lock().unwrap().push(query.clone());
        self.searches
            .get(&query.zip)
            .cloned()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn purchase(&self, hash_id: &str) -> Result<String, ProviderError> {
        self.bought.lock().unwrap().push(hash_id.to_string());
        self.purchases
            .get(hash_id)
            .cloned()
            .unwrap_or_else(|| Err(ProviderError::Purchase("unknown hash".into())))
    }
}

#[derive(Default)]
pub struct FakeStorefront {
    fulfillment_orders: HashMap<String, Result<Option<u64>, ShopifyError>>,
    rejections: HashMap<u64, ShopifyError>,
    pub lookups: Mutex<Vec<String>>,
    pub fulfilled: Mutex<Vec<(u64, String)>>,
}

impl FakeStorefront {
    pub fn with_order(mut self, order_id: &str, result: Result<Option<u64>, ShopifyError>) -> Self {
        self.fulfillment_orders.insert(order_id.to_string(), result);
        self
    }

    pub fn rejecting(mut self, fulfillment_order_id: u64, err: ShopifyError) -> Self {
        self.rejections.insert(fulfillment_order_id, err);
        self
    }
}

impl Storefront for FakeStorefront {
    async fn fulfillment_order_id(&self, order_id: &str) -> Result<Option<u64>, ShopifyError> {
        self.lookups.lock().unwrap().push(order_id.to_string());
        self.fulfillment_orders
            .get(order_id)
            .cloned()
            .unwrap_or(Ok(None))
    }

    async fn create_fulfillment(
        &self,
        fulfillment_order_id: u64,
        tracking_number: &str,
    ) -> Result<(), ShopifyError> {
        if let Some(err) = self.rejections.get(&fulfillment_order_id) {
            return Err(err.clone());
        }
        self.fulfilled
            .lock()
            .unwrap()
            .push((fulfillment_order_id, tracking_number.to_string()));
        Ok(())
    }
}

/// Hands the same fakes to every job so tests can inspect calls across runs.
#[derive(Clone, Default)]
pub struct FakeConnect {
    pub provider: Arc<FakeProvider>,
    pub storefront: Arc<FakeStorefront>,
}

impl FakeConnect {
    pub fn new(provider: FakeProvider, storefront: FakeStorefront) -> Self {
        Self {
            provider: Arc::new(provider),
            storefront: Arc::new(storefront),
        }
    }
}

impl Connect for FakeConnect {
    type Provider = Arc<FakeProvider>;
    type Storefront = Arc<FakeStorefront>;

    fn provider(&self, _settings: &Settings) -> Arc<FakeProvider> {
        self.provider.clone()
    }

    fn storefront(&self, _settings: &Settings) -> Result<Arc<FakeStorefront>, PipelineError> {
        Ok(self.storefront.clone())
    }
}

impl TrackingProvider for Arc<FakeProvider> {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<TrackingCandidate>, ProviderError> {
        <FakeProvider as TrackingProvider>::search(self, query).await
    }

    async fn purchase(&self, hash_id: &str) -> Result<String, ProviderError> {
        <FakeProvider as TrackingProvider>::purchase(self, hash_id).await
    }
}

impl Storefront for Arc<FakeStorefront> {
    async fn fulfillment_order_id(&self, order_id: &str) -> Result<Option<u64>, ShopifyError> {
        <FakeStorefront as Storefront>::fulfillment_order_id(self, order_id).await
    }

    async fn create_fulfillment(
        &self,
        fulfillment_order_id: u64,
        tracking_number: &str,
    ) -> Result<(), ShopifyError> {
        <FakeStorefront as Storefront>::create_fulfillment(self, fulfillment_order_id, tracking_number)
            .await
    }
}

pub fn candidate(status: &str, expected_delivery: &str, tracking_number: &str) -> TrackingCandidate {
    TrackingCandidate {
        status: Some(status.to_string()),
        expected_delivery: Some(expected_delivery.to_string()),
        tracking_number: Some(tracking_number.to_string()),
        ..TrackingCandidate::default()
    }
}

pub fn order(name: &str, zip: &str, created_at: &str) -> OrderRow {
    OrderRow {
        order_number: name.to_string(),
        shipping_zip: zip.to_string(),
        created_at: created_at.to_string(),
        storefront_id: Some(format!("{}00", name.trim_start_matches('#'))),
        ..OrderRow::default()
    }
}
