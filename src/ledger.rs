use crate::models::{FailedItem, PurchasedItem, QueueItem, Settings};
use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, sync::Mutex};
use tracing::info;

const QUEUE_FILE: &str = "queue.json";
const PURCHASED_FILE: &str = "purchased.json";
const FAILED_FILE: &str = "failed.json";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
    #[error("corrupt ledger {path}: {message}")]
    Decode { path: String, message: String },
}

/// Append-only JSON ledgers plus the settings document, one file each.
#[derive(Debug)]
pub struct LedgerStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LedgerStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| io_error(&dir, err))?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn from_env_dir() -> PathBuf {
        std::env::var("DATA_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub async fn queue(&self) -> Result<Vec<QueueItem>, StoreError> {
        self.load(QUEUE_FILE).await
    }

    pub async fn append_queue(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        self.append(QUEUE_FILE, items).await
    }

    pub async fn purchased(&self) -> Result<Vec<PurchasedItem>, StoreError> {
        self.load(PURCHASED_FILE).await
    }

    pub async fn append_purchased(&self, items: &[PurchasedItem]) -> Result<(), StoreError> {
        self.append(PURCHASED_FILE, items).await
    }

    pub async fn failed(&self) -> Result<Vec<FailedItem>, StoreError> {
        self.load(FAILED_FILE).await
    }

    pub async fn append_failed(&self, items: &[FailedItem]) -> Result<(), StoreError> {
        self.append(FAILED_FILE, items).await
    }

    pub async fn settings(&self) -> Result<Settings, StoreError> {
        let path = self.dir.join(SETTINGS_FILE);
        match read_optional(&path).await? {
            Some(bytes) => decode(&path, &bytes),
            None => Ok(Settings::from_env()),
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write(SETTINGS_FILE, settings).await
    }

    async fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Vec<T>, StoreError> {
        let path = self.dir.join(name);
        match read_optional(&path).await? {
            Some(bytes) => decode(&path, &bytes),
            None => Ok(Vec::new()),
        }
    }

    async fn append<T>(&self, name: &str, items: &[T]) -> Result<(), StoreError>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        if items.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut existing: Vec<T> = self.load(name).await?;
        existing.extend_from_slice(items);
        self.write(name, &existing).await?;
        info!(
            target = "trackmaster.ledger",
            ledger = name,
            appended = items.len(),
            total = existing.len(),
            "ledger_appended"
        );
        Ok(())
    }

    async fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StoreError> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let bytes = serde_json::to_vec_pretty(value).map_err(|err| StoreError::Decode {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        fs::write(&tmp, bytes)
            .await
            .map_err(|err| io_error(&tmp, err))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|err| io_error(&path, err))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_error(path, err)),
    }
}

fn decode<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|err| StoreError::Decode {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn io_error(path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}
