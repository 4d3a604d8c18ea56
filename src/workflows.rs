//! Operator-triggered purchase and fulfillment runs.
//!
//! Both walk the selection strictly in order, one remote call at a time, with a
//! fixed pause between tasks. A failing order is recorded and the run moves on.

use crate::models::{
    FailedItem, FailureAction, PurchasedItem, TrackStatus, TrackingResult, is_masked, tracking_url,
};
use crate::provider::TrackingProvider;
use crate::shopify::Storefront;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

pub const PURCHASED_NOTE: &str = "Purchased Successfully";
pub const NO_HASH_REASON: &str = "No Hash ID available";
pub const MISSING_STOREFRONT_ID_REASON: &str = "Missing Shopify ID in CSV";
pub const INVALID_TRACKING_REASON: &str = "Invalid tracking number";
pub const NO_FULFILLMENT_ORDER_REASON: &str = "No fulfillment orders found for this order.";

/// Sequential task iterator with a fixed delay before every task but the first.
pub struct Paced<I> {
    tasks: I,
    delay: Duration,
    started: bool,
}

impl<I: Iterator> Paced<I> {
    pub fn new(tasks: I, delay: Duration) -> Self {
        Self {
            tasks,
            delay,
            started: false,
        }
    }

    pub async fn next(&mut self) -> Option<I::Item> {
        let task = self.tasks.next()?;
        if self.started && !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.started = true;
        Some(task)
    }
}

#[derive(Debug, Default, Serialize)]
pub struct PurchaseOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(skip)]
    pub purchased: Vec<PurchasedItem>,
    pub failures: Vec<FailedItem>,
}

/// Buy full tracking numbers for the selected orders, updating `results` in place.
///
/// Orders missing from `results` are ignored. Orders that already carry a full
/// number are skipped without a ledger entry.
pub async fn purchase<P: TrackingProvider>(
    provider: &P,
    results: &mut [TrackingResult],
    selected: &[String],
    delay: Duration,
) -> PurchaseOutcome {
    let mut outcome = PurchaseOutcome::default();
    let mut tasks = Paced::new(selected.iter(), delay);

    while let Some(order_number) = tasks.next().await {
        let Some(result) = results.iter_mut().find(|r| &r.order_number == order_number) else {
            continue;
        };
        let Some(hash_id) = result.hash_id.clone().filter(|h| !h.trim().is_empty()) else {
            warn!(target = "trackmaster.purchase", order = %order_number, "missing_hash_id");
            outcome
                .failures
                .push(FailedItem::new(order_number, FailureAction::Buy, NO_HASH_REASON));
            outcome.failed += 1;
            continue;
        };
        if result.has_full_tracking() {
            info!(target = "trackmaster.purchase", order = %order_number, "already_full_tracking");
            outcome.skipped += 1;
            continue;
        }

        match provider.purchase(&hash_id).await {
            Ok(full_number) => {
                let url = tracking_url(&full_number);
                result.tracking_number = Some(full_number.clone());
                result.tracking_url = Some(url.clone());
                result.status = TrackStatus::Processed;
                result.note = Some(PURCHASED_NOTE.to_string());
                outcome.purchased.push(PurchasedItem {
                    order_number: order_number.clone(),
                    tracking_number: full_number,
                    tracking_url: url,
                    expected_delivery: result.expected_delivery.clone(),
                    zip: result.zip.clone(),
                    purchased_at: Utc::now(),
                });
                info!(target = "trackmaster.purchase", order = %order_number, "purchased");
                outcome.succeeded += 1;
            }
            Err(err) => {
                warn!(target = "trackmaster.purchase", order = %order_number, error = %err, "purchase_failed");
                outcome
                    .failures
                    .push(FailedItem::new(order_number, FailureAction::Buy, err.to_string()));
                outcome.failed += 1;
            }
        }
    }
    outcome
}

#[derive(Debug, Default, Serialize)]
pub struct FulfillOutcome {
    pub succeeded: usize,
    pub failed: usize,
    pub fulfilled: Vec<String>,
    pub failures: Vec<FailedItem>,
}

impl FulfillOutcome {
    fn reject(&mut self, order_number: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(target = "trackmaster.fulfill", order = %order_number, reason = %reason, "fulfillment_failed");
        self.failures
            .push(FailedItem::new(order_number, FailureAction::Fulfill, reason));
        self.failed += 1;
    }
}

/// Mark the selected orders fulfilled on the storefront.
pub async fn fulfill<S: Storefront>(
    storefront: &S,
    results: &[TrackingResult],
    selected: &[String],
    delay: Duration,
) -> FulfillOutcome {
    let mut outcome = FulfillOutcome::default();
    let mut tasks = Paced::new(selected.iter(), delay);

    while let Some(order_number) = tasks.next().await {
        let Some(result) = results.iter().find(|r| &r.order_number == order_number) else {
            continue;
        };
        let Some(storefront_id) = result.storefront_id.as_deref() else {
            outcome.reject(order_number, MISSING_STOREFRONT_ID_REASON);
            continue;
        };
        let Some(tracking_number) = result
            .tracking_number
            .as_deref()
            .filter(|n| !n.trim().is_empty() && !is_masked(n))
        else {
            outcome.reject(order_number, INVALID_TRACKING_REASON);
            continue;
        };

        let fulfillment_order_id = match storefront.fulfillment_order_id(storefront_id).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                outcome.reject(order_number, NO_FULFILLMENT_ORDER_REASON);
                continue;
            }
            Err(err) => {
                outcome.reject(order_number, err.to_string());
                continue;
            }
        };

        match storefront
            .create_fulfillment(fulfillment_order_id, tracking_number)
            .await
        {
            Ok(()) => {
                info!(target = "trackmaster.fulfill", order = %order_number, "fulfilled");
                outcome.fulfilled.push(order_number.clone());
                outcome.succeeded += 1;
            }
            Err(err) => outcome.reject(order_number, err.to_string()),
        }
    }
    outcome
}
