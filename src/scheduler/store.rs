//! Durable storage for the schedule record.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::state::{PersistedSchedule, ScheduleState, STATE_FORMAT_VERSION};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schedule state i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("schedule state serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence boundary for [`ScheduleState`]. One record, last write wins.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn load(&self) -> StoreResult<Option<ScheduleState>>;
    async fn save(&self, state: &ScheduleState) -> StoreResult<()>;
    async fn clear(&self) -> StoreResult<()>;
}

/// JSON file-backed store with atomic replace.
///
/// Writes go to a temp file first and are renamed over the target, keeping
/// the previous file as `.bak`; a crash mid-write can never leave a
/// half-written state file in place. Unreadable files are moved aside to a
/// timestamped `.corrupted.*` sidecar and treated as absent.
pub struct FileScheduleStore {
    path: PathBuf,
}

impl FileScheduleStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    async fn ensure_parent(&self) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn quarantine_corrupted(&self, reason: &str) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let sidecar = self.path.with_extension(format!("corrupted.{stamp}.json"));
        warn!(
            "schedule state file unreadable ({reason}), moving {} -> {}",
            self.path.display(),
            sidecar.display()
        );
        if let Err(e) = fs::rename(&self.path, &sidecar).await {
            warn!("failed to move corrupted state file aside: {e}");
        }
    }
}

#[async_trait]
impl ScheduleStore for FileScheduleStore {
    async fn load(&self) -> StoreResult<Option<ScheduleState>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path).await?;
        match serde_json::from_str::<PersistedSchedule>(&data) {
            Ok(persisted) if persisted.version == STATE_FORMAT_VERSION => {
                Ok(Some(persisted.state))
            }
            Ok(persisted) => {
                self.quarantine_corrupted(&format!("unsupported version {}", persisted.version))
                    .await;
                Ok(None)
            }
            Err(e) => {
                self.quarantine_corrupted(&e.to_string()).await;
                Ok(None)
            }
        }
    }

    async fn save(&self, state: &ScheduleState) -> StoreResult<()> {
        self.ensure_parent().await?;
        let json = serde_json::to_string_pretty(&PersistedSchedule::new(state.clone()))?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, json.as_bytes()).await?;

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            let bak = self.path.with_extension("json.bak");
            let _ = fs::rename(&self.path, &bak).await;
        }

        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        if fs::try_exists(&self.path).await.unwrap_or(false) {
            fs::remove_file(&self.path).await?;
            info!("schedule state file removed: {}", self.path.display());
        }
        Ok(())
    }
}

/// Volatile store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryScheduleStore {
    state: Mutex<Option<ScheduleState>>,
}

impl InMemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ScheduleState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

#[async_trait]
impl ScheduleStore for InMemoryScheduleStore {
    async fn load(&self) -> StoreResult<Option<ScheduleState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &ScheduleState) -> StoreResult<()> {
        *self.state.lock().await = Some(state.clone());
        Ok(())
    }

    async fn clear(&self) -> StoreResult<()> {
        *self.state.lock().await = None;
        Ok(())
    }
}
