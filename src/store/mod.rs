//! Durable test records.
//!
//! The queue only needs four operations from persistence, captured by
//! [`TestStore`]. [`JsonTestStore`] keeps records in memory and, when given a
//! path, mirrors every mutation to a JSON file.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::queue::models::{format_timestamp, RunResults, TestRecord, TestStatus, ValidatedSubmission};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Test {0} not found")]
    NotFound(u64),

    #[error("Test {id} cannot move from {from} to {to}")]
    InvalidTransition { id: u64, from: TestStatus, to: TestStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait TestStore: Send + Sync {
    /// Persist a new record in the Queued state and return its id
    async fn create_queued(&self, submission: &ValidatedSubmission) -> Result<u64>;

    /// Move a record to `status`. Entering Running stamps the start time.
    async fn set_status(&self, id: u64, status: TestStatus) -> Result<()>;

    async fn set_results(&self, id: u64, results: RunResults) -> Result<()>;

    async fn get_by_id(&self, id: u64) -> Result<TestRecord>;
}

struct Records {
    next_id: u64,
    by_id: BTreeMap<u64, TestRecord>,
}

pub struct JsonTestStore {
    path: Option<PathBuf>,
    records: RwLock<Records>,
}

impl JsonTestStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: RwLock::new(Records { next_id: 1, by_id: BTreeMap::new() }),
        }
    }

    /// Load records from `path` if it exists. Runs left Queued or Running by a
    /// previous process can never finish, so they are marked Failed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut by_id: BTreeMap<u64, TestRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(json) => {
                let records: Vec<TestRecord> = serde_json::from_str(&json)?;
                records.into_iter().map(|r| (r.id, r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let now = format_timestamp(Utc::now());
        let mut orphaned = 0;
        for record in by_id.values_mut().filter(|r| !r.status.is_terminal()) {
            record.status = TestStatus::Failed;
            if record.end_time.is_none() {
                record.end_time = Some(now.clone());
            }
            orphaned += 1;
        }
        if orphaned > 0 {
            log::warn!("Marked {} unfinished test(s) from a previous run as Failed", orphaned);
        }

        let next_id = by_id.keys().next_back().map_or(1, |id| id + 1);
        log::info!("Loaded {} test record(s) from '{}'", by_id.len(), path.display());

        let store = Self {
            path: Some(path),
            records: RwLock::new(Records { next_id, by_id }),
        };
        if orphaned > 0 {
            let records = store.records.read().await;
            store.persist(&records).await?;
        }
        Ok(store)
    }

    pub async fn all(&self) -> Vec<TestRecord> {
        self.records.read().await.by_id.values().cloned().collect()
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let list: Vec<&TestRecord> = records.by_id.values().collect();
        let json = serde_json::to_string_pretty(&list)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // Replace atomically so a crash never leaves a torn file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl TestStore for JsonTestStore {
    async fn create_queued(&self, submission: &ValidatedSubmission) -> Result<u64> {
        let mut records = self.records.write().await;
        let id = records.next_id;
        records.next_id += 1;
        records.by_id.insert(
            id,
            TestRecord {
                id,
                username: submission.username.clone(),
                chip_id: submission.chip_id.clone(),
                snr_range: submission.snr_range.clone(),
                batch_size: submission.batch_size,
                status: TestStatus::Queued,
                created_at: format_timestamp(Utc::now()),
                start_time: None,
                end_time: None,
                duration: None,
                results_path: None,
            },
        );
        self.persist(&records).await?;
        Ok(id)
    }

    async fn set_status(&self, id: u64, status: TestStatus) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.by_id.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !record.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.status,
                to: status,
            });
        }
        record.status = status;
        if status == TestStatus::Running {
            record.start_time = Some(format_timestamp(Utc::now()));
        }
        log::debug!("Test {} is now {}", id, status);
        self.persist(&records).await
    }

    async fn set_results(&self, id: u64, results: RunResults) -> Result<()> {
        let mut records = self.records.write().await;
        let record = records.by_id.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.results_path = results.results_path;
        record.end_time = Some(results.end_time);
        record.duration = Some(results.duration.to_string());
        self.persist(&records).await
    }

    async fn get_by_id(&self, id: u64) -> Result<TestRecord> {
        let records = self.records.read().await;
        records.by_id.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }
}
