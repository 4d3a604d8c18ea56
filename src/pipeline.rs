use crate::history::{self, HistoryIndex, Resolution};
use crate::http::{Relay, build_client};
use crate::ledger::{LedgerStore, StoreError};
use crate::models::{
    FailedItem, FailureAction, OrderRow, QueueItem, Settings, TrackStatus, TrackingResult,
};
use crate::normalize::dedupe_orders;
use crate::provider::{TrackingClient, TrackingProvider};
use crate::resolver::{MISSING_ZIP_NOTE, ResolveParams, resolve_order};
use crate::shopify::{ShopifyClient, Storefront};
use crate::workflows::{self, FulfillOutcome, PurchaseOutcome};
use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use serde::Serialize;
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{Duration, sleep};
use tracing::{error, info};

pub const CHUNK_SIZE: usize = 5;

/// Deliberate pauses between units of remote work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub chunk: Duration,
    pub purchase: Duration,
    pub fulfill: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            chunk: Duration::from_millis(100),
            purchase: Duration::from_millis(200),
            fulfill: Duration::from_millis(500),
        }
    }
}

impl Pacing {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            chunk: env_millis("CHUNK_PAUSE_MS").unwrap_or(defaults.chunk),
            purchase: env_millis("PURCHASE_PAUSE_MS").unwrap_or(defaults.purchase),
            fulfill: env_millis("FULFILL_PAUSE_MS").unwrap_or(defaults.fulfill),
        }
    }

    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            chunk: Duration::ZERO,
            purchase: Duration::ZERO,
            fulfill: Duration::ZERO,
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Snapshot handed to the progress observer after each chunk.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub percent: u8,
    pub chunk: Vec<TrackingResult>,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<TrackingResult>,
    pub queued: Vec<QueueItem>,
    pub failures: Vec<FailedItem>,
}

pub fn progress_percent(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((completed.min(total) as f64 / total as f64) * 100.0).round() as u8
}

/// Resolve deduplicated orders in chunks of [`CHUNK_SIZE`].
///
/// Orders inside a chunk run concurrently; chunks run one after another and the
/// observer sees each chunk only once it is complete.
pub async fn run_batch<P, F, Fut>(
    provider: &P,
    rows: &[OrderRow],
    history: &HistoryIndex,
    params: &ResolveParams,
    chunk_pause: Duration,
    mut on_chunk: F,
) -> BatchOutcome
where
    P: TrackingProvider,
    F: FnMut(BatchProgress) -> Fut,
    Fut: Future<Output = ()>,
{
    let total = rows.len();
    let mut outcome = BatchOutcome {
        results: Vec::with_capacity(total),
        ..BatchOutcome::default()
    };

    for chunk in rows.chunks(CHUNK_SIZE) {
        let started = Instant::now();
        let now = Utc::now();
        let chunk_results = join_all(chunk.iter().map(|row| async move {
            match history.resolve(&row.order_number) {
                Resolution::FromLedger(item) => history::from_ledger(row, item),
                Resolution::FromProvider => resolve_order(provider, row, params, now).await,
            }
        }))
        .await;

        for result in &chunk_results {
            log_result(result);
            if let Some(item) = result.queue_item(Utc::now()) {
                outcome.queued.push(item);
            }
            if let Some(failure) = resolution_failure(result) {
                outcome.failures.push(failure);
            }
        }
        outcome.results.extend(chunk_results.iter().cloned());
        crate::metrics::chunk_elapsed(chunk.len(), started.elapsed().as_millis());

        let completed = outcome.results.len();
        on_chunk(BatchProgress {
            completed,
            total,
            percent: progress_percent(completed, total),
            chunk: chunk_results,
        })
        .await;

        if !chunk_pause.is_zero() {
            sleep(chunk_pause).await;
        }
    }
    outcome
}

fn resolution_failure(result: &TrackingResult) -> Option<FailedItem> {
    let note = result.note.as_deref().unwrap_or_default();
    let failed = match result.status {
        TrackStatus::Error => true,
        TrackStatus::Skipped => note == MISSING_ZIP_NOTE,
        _ => false,
    };
    failed.then(|| FailedItem::new(&result.order_number, FailureAction::Process, note))
}

fn log_result(result: &TrackingResult) {
    let note = result.note.as_deref().unwrap_or("");
    match result.status {
        TrackStatus::Queued => {
            info!(target = "trackmaster.pipeline", order = %result.order_number, note, "queued")
        }
        TrackStatus::Processed if !result.is_7_days_future => {
            info!(target = "trackmaster.pipeline", order = %result.order_number, note, "processed_with_warning")
        }
        TrackStatus::Processed => {
            info!(target = "trackmaster.pipeline", order = %result.order_number, "processed")
        }
        TrackStatus::Skipped => {
            info!(target = "trackmaster.pipeline", order = %result.order_number, note, "skipped")
        }
        TrackStatus::Error => {
            tracing::warn!(target = "trackmaster.pipeline", order = %result.order_number, note, "resolution_error")
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub raw_rows: usize,
    pub unique_orders: usize,
    pub processed: usize,
    pub queued: usize,
    pub skipped: usize,
    pub errors: usize,
    pub from_history: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Builds the remote collaborators for one job from the current settings.
pub trait Connect: Clone + Send + Sync + 'static {
    type Provider: TrackingProvider;
    type Storefront: Storefront;

    fn provider(&self, settings: &Settings) -> Self::Provider;

    fn storefront(&self, settings: &Settings) -> Result<Self::Storefront, PipelineError>;
}

/// Live provider and Shopify clients sharing one HTTP client.
#[derive(Clone)]
pub struct HttpConnect {
    http: Client,
}

impl Connect for HttpConnect {
    type Provider = TrackingClient;
    type Storefront = ShopifyClient;

    fn provider(&self, settings: &Settings) -> TrackingClient {
        TrackingClient::new(
            self.http.clone(),
            settings.api_key.clone(),
            Relay::from_settings(settings),
        )
    }

    fn storefront(&self, settings: &Settings) -> Result<ShopifyClient, PipelineError> {
        ShopifyClient::new(
            self.http.clone(),
            &settings.shopify_domain,
            &settings.shopify_token,
            Relay::from_settings(settings),
        )
        .map_err(|err| PipelineError::invalid_input("settings", err.to_string()))
    }
}

/// Owns the ledgers, the session's results and the remote connectors.
///
/// Workflows run on a copy of the session; the lock is only taken to read or
/// replace it, never across remote calls.
#[derive(Clone)]
pub struct Engine<C = HttpConnect> {
    store: Arc<LedgerStore>,
    session: Arc<Mutex<Vec<TrackingResult>>>,
    connect: C,
    pacing: Pacing,
}

impl Engine {
    pub fn new(store: Arc<LedgerStore>, pacing: Pacing) -> Self {
        Self::with_connect(store, pacing, HttpConnect { http: build_client() })
    }
}

impl<C: Connect> Engine<C> {
    pub fn with_connect(store: Arc<LedgerStore>, pacing: Pacing, connect: C) -> Self {
        Self {
            store,
            session: Arc::new(Mutex::new(Vec::new())),
            connect,
            pacing,
        }
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub async fn results(&self) -> Vec<TrackingResult> {
        self.session.lock().await.clone()
    }

    async fn settings(&self) -> Result<Settings, PipelineError> {
        self.store
            .settings()
            .await
            .map_err(|err| PipelineError::storage("settings", err))
    }

    async fn provider_settings(&self) -> Result<Settings, PipelineError> {
        let settings = self.settings().await?;
        if settings.api_key.trim().is_empty() {
            return Err(PipelineError::invalid_input(
                "settings",
                "API key is missing in settings",
            ));
        }
        Ok(settings)
    }

    /// Dedupe, resolve and persist one uploaded batch. Replaces the session results.
    pub async fn run_batch<F, Fut>(
        &self,
        raw_rows: Vec<OrderRow>,
        on_chunk: F,
    ) -> Result<BatchSummary, PipelineError>
    where
        F: FnMut(BatchProgress) -> Fut,
        Fut: Future<Output = ()>,
    {
        let settings = self.provider_settings().await?;
        let raw_count = raw_rows.len();
        let rows = dedupe_orders(raw_rows);

        let history = HistoryIndex::new(
            self.store
                .purchased()
                .await
                .map_err(|err| PipelineError::storage("history", err))?,
        );
        info!(
            target = "trackmaster.pipeline",
            unique = rows.len(),
            raw = raw_count,
            purchased = history.len(),
            "batch_started"
        );
        let provider = self.connect.provider(&settings);
        let params = ResolveParams {
            limit: settings.limit,
            thresholds: settings.thresholds(),
        };

        let outcome = run_batch(
            &provider,
            &rows,
            &history,
            &params,
            self.pacing.chunk,
            on_chunk,
        )
        .await;

        let count = |status: TrackStatus| outcome.results.iter().filter(|r| r.status == status).count();
        let summary = BatchSummary {
            raw_rows: raw_count,
            unique_orders: rows.len(),
            processed: count(TrackStatus::Processed),
            queued: count(TrackStatus::Queued),
            skipped: count(TrackStatus::Skipped),
            errors: count(TrackStatus::Error),
            from_history: rows
                .iter()
                .filter(|r| matches!(history.resolve(&r.order_number), Resolution::FromLedger(_)))
                .count(),
        };
        *self.session.lock().await = outcome.results;

        // Queue entries are written once, after the whole batch.
        let mut writes = LedgerWrites::default();
        writes.record("queue", self.store.append_queue(&outcome.queued).await);
        writes.record("failed", self.store.append_failed(&outcome.failures).await);
        writes.finish("batch", format!("{summary:?}"))?;

        info!(target = "trackmaster.pipeline", ?summary, "batch_finished");
        Ok(summary)
    }

    pub async fn purchase(&self, selected: &[String]) -> Result<WorkflowSummary, PipelineError> {
        let settings = self.provider_settings().await?;
        let provider = self.connect.provider(&settings);

        info!(target = "trackmaster.purchase", selected = selected.len(), "purchase_started");
        let mut results = self.results().await;
        let outcome: PurchaseOutcome =
            workflows::purchase(&provider, &mut results, selected, self.pacing.purchase).await;
        *self.session.lock().await = results;

        let summary = WorkflowSummary {
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            skipped: outcome.skipped,
        };
        let mut writes = LedgerWrites::default();
        if !writes.record("purchased", self.store.append_purchased(&outcome.purchased).await) {
            for item in &outcome.purchased {
                error!(
                    target = "trackmaster.ledger",
                    order = %item.order_number,
                    tracking_number = %item.tracking_number,
                    "purchase_not_persisted"
                );
            }
        }
        writes.record("failed", self.store.append_failed(&outcome.failures).await);
        crate::metrics::workflow_outcome("purchase", outcome.succeeded, outcome.failed);
        writes.finish("purchase", format!("{summary:?}"))?;

        info!(
            target = "trackmaster.purchase",
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "purchase_finished"
        );
        Ok(summary)
    }

    pub async fn fulfill(&self, selected: &[String]) -> Result<WorkflowSummary, PipelineError> {
        let settings = self.settings().await?;
        let storefront = self.connect.storefront(&settings)?;

        info!(target = "trackmaster.fulfill", selected = selected.len(), "fulfillment_started");
        let results = self.results().await;
        let outcome: FulfillOutcome =
            workflows::fulfill(&storefront, &results, selected, self.pacing.fulfill).await;

        let summary = WorkflowSummary {
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            skipped: 0,
        };
        let mut writes = LedgerWrites::default();
        writes.record("failed", self.store.append_failed(&outcome.failures).await);
        crate::metrics::workflow_outcome("fulfill", outcome.succeeded, outcome.failed);
        writes.finish("fulfill", format!("{summary:?}"))?;

        info!(
            target = "trackmaster.fulfill",
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "fulfillment_finished"
        );
        Ok(summary)
    }
}

/// Every ledger write of a run is attempted; failures are reported together.
#[derive(Default)]
struct LedgerWrites {
    errors: Vec<String>,
}

impl LedgerWrites {
    fn record(&mut self, ledger: &'static str, result: Result<(), StoreError>) -> bool {
        match result {
            Ok(()) => true,
            Err(err) => {
                error!(target = "trackmaster.ledger", ledger, error = %err, "ledger_write_failed");
                self.errors.push(format!("{ledger}: {err}"));
                false
            }
        }
    }

    fn finish(self, stage: &'static str, completed: String) -> Result<(), PipelineError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(PipelineError::internal(
            stage,
            format!("{} (run completed: {completed})", self.errors.join("; ")),
        ))
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::InvalidInput,
        }
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::NotFound,
        }
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind: PipelineErrorKind::Internal,
        }
    }

    pub fn storage(stage: &'static str, err: StoreError) -> Self {
        Self::internal(stage, err.to_string())
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}
