//! Persisted job records.
//!
//! The control plane is the only writer. Each call touches one record and is
//! atomic on its own; nothing spans records.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use utoipa::ToSchema;

use crate::error::JobError;
use crate::os::validate_job_id;
use crate::prelude::{unix_now, RwArc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Completed,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    pub original_name: String,
    pub preset: String,
    pub file_type: String,
    pub input_size: u64,
    pub output_size: Option<u64>,
    /// Unix seconds
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    /// Execution-tier locator of the stored output
    pub download_url: Option<String>,
}

/// Fields supplied at creation; everything else starts empty
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_id: String,
    pub original_name: String,
    pub preset: String,
    pub file_type: String,
    pub input_size: u64,
}

/// Partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub output_size: Option<u64>,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub download_url: Option<String>,
}

impl JobPatch {
    pub fn apply(self, record: &mut JobRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if self.output_size.is_some() {
            record.output_size = self.output_size;
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.finished_at.is_some() {
            record.finished_at = self.finished_at;
        }
        if self.duration_ms.is_some() {
            record.duration_ms = self.duration_ms;
        }
        if self.error_message.is_some() {
            record.error_message = self.error_message;
        }
        if self.download_url.is_some() {
            record.download_url = self.download_url;
        }
    }
}

impl From<NewJob> for JobRecord {
    fn from(job: NewJob) -> Self {
        Self {
            job_id: job.job_id,
            status: JobStatus::Queued,
            original_name: job.original_name,
            preset: job.preset,
            file_type: job.file_type,
            input_size: job.input_size,
            output_size: None,
            created_at: unix_now(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            error_message: None,
            download_url: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} already exists")]
    Conflict(String),

    #[error("Job not found")]
    NotFound(String),

    #[error("Invalid job id {0:?}")]
    InvalidId(String),

    #[error("Job store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt job record: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(_) => JobError::Conflict(e.to_string()),
            StoreError::NotFound(_) | StoreError::InvalidId(_) => JobError::NotFound("Job not found".to_string()),
            StoreError::Io(_) | StoreError::Serde(_) => JobError::Store(e.to_string()),
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `queued` record. An existing id is a conflict.
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError>;

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<JobRecord, StoreError>;

    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Returns whether a record was removed
    async fn delete(&self, job_id: &str) -> Result<bool, StoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    records: RwArc<HashMap<String, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self { records: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&job.job_id) {
            return Err(StoreError::Conflict(job.job_id));
        }
        let record = JobRecord::from(job);
        records.insert(record.job_id.clone(), record.clone());
        Ok(record)
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        let record = records.get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        patch.apply(record);
        Ok(record.clone())
    }

    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(job_id).cloned())
    }

    async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(job_id).is_some())
    }
}

/// One pretty-printed JSON file per record.
///
/// Writes go to a temporary file that is renamed over the record, so a
/// crash leaves either the old or the new version. The lock serializes
/// read-modify-write within this process.
pub struct FileJobStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    fn record_path(&self, job_id: &str) -> Result<PathBuf, StoreError> {
        validate_job_id(job_id).map_err(|_| StoreError::InvalidId(job_id.to_string()))?;
        Ok(self.dir.join(format!("{}.json", job_id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<JobRecord>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, record: &JobRecord) -> Result<(), StoreError> {
        let data = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension(format!("json.{:08x}.tmp", rand::random::<u32>()));
        tokio::fs::write(&tmp, &data).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: NewJob) -> Result<JobRecord, StoreError> {
        let path = self.record_path(&job.job_id)?;
        let _guard = self.lock.lock().await;
        if tokio::fs::try_exists(&path).await? {
            return Err(StoreError::Conflict(job.job_id));
        }
        let record = JobRecord::from(job);
        self.write(&path, &record).await?;
        Ok(record)
    }

    async fn update(&self, job_id: &str, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let path = self.record_path(job_id)?;
        let _guard = self.lock.lock().await;
        let mut record = self.read(&path).await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        patch.apply(&mut record);
        self.write(&path, &record).await?;
        Ok(record)
    }

    async fn find_by_id(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let Ok(path) = self.record_path(job_id) else {
            return Ok(None);
        };
        self.read(&path).await
    }

    async fn delete(&self, job_id: &str) -> Result<bool, StoreError> {
        let path = self.record_path(job_id)?;
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job(id: &str) -> NewJob {
        NewJob {
            job_id: id.to_string(),
            original_name: "people.csv".to_string(),
            preset: "default".to_string(),
            file_type: "text/csv".to_string(),
            input_size: 42,
        }
    }

    async fn exercise(store: &dyn JobStore) {
        let created = store.create(new_job("j1")).await.unwrap();
        assert_eq!(created.status, JobStatus::Queued);
        assert!(matches!(store.create(new_job("j1")).await, Err(StoreError::Conflict(_))));

        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            output_size: Some(40),
            download_url: Some("/jobs/j1/output".to_string()),
            ..Default::default()
        };
        let updated = store.update("j1", patch).await.unwrap();
        assert_eq!(updated.status, JobStatus::Completed);
        assert_eq!(updated.original_name, "people.csv");

        let found = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(found, updated);
        assert!(store.find_by_id("nope").await.unwrap().is_none());
        assert!(matches!(store.update("nope", JobPatch::default()).await, Err(StoreError::NotFound(_))));

        assert!(store.delete("j1").await.unwrap());
        assert!(!store.delete("j1").await.unwrap());
        assert!(store.find_by_id("j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_crud() {
        exercise(&MemoryJobStore::new()).await;
    }

    #[tokio::test]
    async fn test_file_store_crud() {
        let tmp = tempfile::tempdir().unwrap();
        exercise(&FileJobStore::open(tmp.path()).await.unwrap()).await;
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = FileJobStore::open(tmp.path()).await.unwrap();
            store.create(new_job("keep")).await.unwrap();
        }
        let store = FileJobStore::open(tmp.path()).await.unwrap();
        let record = store.find_by_id("keep").await.unwrap().unwrap();
        assert_eq!(record.input_size, 42);

        let raw = std::fs::read_to_string(tmp.path().join("keep.json")).unwrap();
        assert!(raw.contains("\"originalName\": \"people.csv\""));
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_like_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(tmp.path()).await.unwrap();
        assert!(matches!(store.create(new_job("../x")).await, Err(StoreError::InvalidId(_))));
        assert!(store.find_by_id("../x").await.unwrap().is_none());
    }

    #[test]
    fn test_store_errors_map_to_job_errors() {
        assert!(matches!(JobError::from(StoreError::Conflict("a".into())), JobError::Conflict(_)));
        assert!(matches!(JobError::from(StoreError::NotFound("a".into())), JobError::NotFound(_)));
        let io = StoreError::Io(std::io::Error::new(ErrorKind::Other, "disk"));
        assert!(matches!(JobError::from(io), JobError::Store(_)));
    }
}
