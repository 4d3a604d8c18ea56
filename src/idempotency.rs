use axum::http::HeaderMap;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Maps `Idempotency-Key` values to the job they first created, so a retried
/// purchase or fulfillment submission never enqueues a second run.
#[derive(Clone, Default)]
pub struct IdempotencyCache {
    jobs: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl IdempotencyCache {
    pub fn key_from(headers: &HeaderMap) -> Option<String> {
        headers
            .get("Idempotency-Key")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Return the job already recorded for `key`, or run `enqueue` and record its job.
    pub async fn get_or_enqueue<F, Fut, E>(&self, key: Option<String>, enqueue: F) -> Result<Uuid, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Uuid, E>>,
    {
        let Some(key) = key else {
            return enqueue().await;
        };
        let mut guard = self.jobs.lock().await;
        if let Some(existing) = guard.get(&key) {
            return Ok(*existing);
        }
        let id = enqueue().await?;
        guard.insert(key, id);
        Ok(id)
    }
}
