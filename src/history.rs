use crate::models::{OrderRow, PurchasedItem, TrackStatus, TrackingResult};
use serde_json::json;
use std::collections::HashMap;

pub const HISTORY_NOTE: &str = "Loaded from Purchased History";

/// Where an order's result comes from, decided before any resolution work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution<'a> {
    FromLedger(&'a PurchasedItem),
    FromProvider,
}

/// Purchase ledger keyed by order number. The earliest entry for an order wins.
#[derive(Debug, Default)]
pub struct HistoryIndex {
    by_order: HashMap<String, PurchasedItem>,
}

impl HistoryIndex {
    pub fn new(items: impl IntoIterator<Item = PurchasedItem>) -> Self {
        let mut by_order = HashMap::new();
        for item in items {
            by_order.entry(item.order_number.clone()).or_insert(item);
        }
        Self { by_order }
    }

    pub fn resolve(&self, order_number: &str) -> Resolution<'_> {
        match self.by_order.get(order_number) {
            Some(item) => Resolution::FromLedger(item),
            None => Resolution::FromProvider,
        }
    }

    pub fn len(&self) -> usize {
        self.by_order.len()
    }
}

/// A `PROCESSED` result rebuilt from a previous purchase.
pub fn from_ledger(row: &OrderRow, item: &PurchasedItem) -> TrackingResult {
    let mut result =
        TrackingResult::bare(row, &item.zip, row.order_date_str(), TrackStatus::Processed)
            .with_note(HISTORY_NOTE);
    result.tracking_number = Some(item.tracking_number.clone());
    result.tracking_url = Some(item.tracking_url.clone());
    result.expected_delivery = item.expected_delivery.clone();
    result.is_7_days_future = true;
    result.diagnostics = Some(json!({
        "source": "purchased_history",
        "purchased_at": item.purchased_at,
    }));
    result
}
