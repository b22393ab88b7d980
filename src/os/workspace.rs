//! Per-job scratch directories and promoted output artifacts.
//!
//! Layout under the data root:
//!
//! ```text
//! workspaces/<job_id>/input.<ext>     staged upload
//! workspaces/<job_id>/output.<ext>    buffered worker output
//! workspaces/<job_id>/scratch/        the worker's only writable directory
//! artifacts/<job_id>/output.<ext>     output kept after the workspace is gone
//! ```
//!
//! A job id owns at most one live workspace. The `live` set is consulted
//! before the directory is created, and the directory itself is created
//! non-recursively, so a leftover directory from a crashed run is also
//! treated as a conflict rather than silently reused.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::JobError;
use crate::prelude::RwArc;

pub const MAX_JOB_ID_LEN: usize = 128;

/// Raw upload as received from the caller
#[derive(Debug, Clone)]
pub struct Upload {
    pub bytes: Bytes,
    pub original_name: String,
    pub content_type: Option<String>,
}

/// Output format, inferred from the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Csv,
    Json,
}

impl OutputKind {
    /// JSON when the declared type mentions json or the name ends in `.json`, CSV otherwise
    pub fn infer(content_type: Option<&str>, original_name: &str) -> Self {
        let declared_json = content_type
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false);
        let named_json = Path::new(original_name)
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if declared_json || named_json { Self::Json } else { Self::Csv }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv",
            Self::Json => "application/json",
        }
    }

    pub fn output_file_name(&self) -> String {
        format!("output.{}", self.extension())
    }
}

/// Reject ids that could escape the data root or collide with our own files
pub fn validate_job_id(job_id: &str) -> Result<(), JobError> {
    let ok = !job_id.is_empty()
        && job_id.len() <= MAX_JOB_ID_LEN
        && job_id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if ok {
        Ok(())
    } else {
        Err(JobError::validation(format!(
            "Invalid job id: must be 1-{} characters of [A-Za-z0-9_-]",
            MAX_JOB_ID_LEN
        )))
    }
}

/// Input file name: fixed stem, original extension preserved
fn input_file_name(original_name: &str) -> String {
    let ext = Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.bytes().all(|b| b.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!("input.{}", ext),
        None => "input".to_string(),
    }
}

/// A live job workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    pub job_id: String,
    pub dir: PathBuf,
    pub input_path: PathBuf,
    pub scratch_dir: PathBuf,
    pub output_kind: OutputKind,
    pub original_name: String,
    pub input_size: u64,
}

impl Workspace {
    pub fn output_path(&self) -> PathBuf {
        self.dir.join(self.output_kind.output_file_name())
    }
}

/// A promoted output, located by job id
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub kind: OutputKind,
    pub size: u64,
}

#[derive(Clone)]
pub struct WorkspaceManager {
    workspaces: PathBuf,
    artifacts: PathBuf,
    live: RwArc<HashSet<String>>,
}

impl WorkspaceManager {
    /// Create the manager, making sure both roots exist
    pub async fn new(data_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let data_dir = data_dir.as_ref();
        let workspaces = data_dir.join("workspaces");
        let artifacts = data_dir.join("artifacts");
        tokio::fs::create_dir_all(&workspaces).await?;
        tokio::fs::create_dir_all(&artifacts).await?;
        Ok(Self {
            workspaces,
            artifacts,
            live: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub fn workspace_dir(&self, job_id: &str) -> PathBuf {
        self.workspaces.join(job_id)
    }

    pub fn artifact_dir(&self, job_id: &str) -> PathBuf {
        self.artifacts.join(job_id)
    }

    pub fn artifacts_root(&self) -> &Path {
        &self.artifacts
    }

    pub async fn live_count(&self) -> usize {
        self.live.read().await.len()
    }

    pub async fn is_live(&self, job_id: &str) -> bool {
        self.live.read().await.contains(job_id)
    }

    /// Stage an upload into a fresh workspace.
    ///
    /// Honors `job_id_hint` when given, otherwise generates a v4 uuid.
    pub async fn admit(&self, job_id_hint: Option<&str>, upload: Option<Upload>) -> Result<Workspace, JobError> {
        let upload = match upload {
            Some(u) if !u.bytes.is_empty() => u,
            _ => return Err(JobError::validation("No file uploaded")),
        };

        let job_id = match job_id_hint {
            Some(hint) => hint.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        validate_job_id(&job_id)?;

        {
            let mut live = self.live.write().await;
            if !live.insert(job_id.clone()) {
                return Err(JobError::Conflict(format!("Job {} is already running", job_id)));
            }
        }

        match self.stage(&job_id, &upload).await {
            Ok(ws) => {
                tracing::debug!(job_id = %ws.job_id, bytes = ws.input_size, input = ?ws.input_path, "Workspace admitted");
                Ok(ws)
            }
            Err(e) => {
                // Only undo the directory if this call created it
                if !matches!(e, JobError::Conflict(_)) {
                    let _ = tokio::fs::remove_dir_all(self.workspace_dir(&job_id)).await;
                }
                self.live.write().await.remove(&job_id);
                Err(e)
            }
        }
    }

    async fn stage(&self, job_id: &str, upload: &Upload) -> Result<Workspace, JobError> {
        let dir = self.workspace_dir(job_id);
        match tokio::fs::create_dir(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(JobError::Conflict(format!("Workspace for job {} already exists", job_id)));
            }
            Err(e) => return Err(JobError::Workspace(format!("create {}: {}", dir.display(), e))),
        }

        // A reused id must never serve the previous run's output
        remove_tree(&self.artifact_dir(job_id)).await?;

        let scratch_dir = dir.join("scratch");
        tokio::fs::create_dir(&scratch_dir).await
            .map_err(|e| JobError::Workspace(format!("create scratch: {}", e)))?;

        let input_path = dir.join(input_file_name(&upload.original_name));
        tokio::fs::write(&input_path, &upload.bytes).await
            .map_err(|e| JobError::Workspace(format!("write input: {}", e)))?;

        Ok(Workspace {
            job_id: job_id.to_string(),
            dir,
            input_path,
            scratch_dir,
            output_kind: OutputKind::infer(upload.content_type.as_deref(), &upload.original_name),
            original_name: upload.original_name.clone(),
            input_size: upload.bytes.len() as u64,
        })
    }

    /// Remove a workspace. Never fails; an already-missing directory is fine.
    pub async fn destroy(&self, ws: &Workspace) {
        match tokio::fs::remove_dir_all(&ws.dir).await {
            Ok(()) => tracing::debug!(job_id = %ws.job_id, "Workspace destroyed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(job_id = %ws.job_id, dir = ?ws.dir, error = %e, "Failed to destroy workspace"),
        }
        self.live.write().await.remove(&ws.job_id);
    }

    /// Move a finished buffered output out of the workspace so it survives destroy
    pub async fn promote(&self, ws: &Workspace) -> Result<Artifact, JobError> {
        let dest_dir = self.artifact_dir(&ws.job_id);
        tokio::fs::create_dir_all(&dest_dir).await
            .map_err(|e| JobError::Workspace(format!("create artifact dir: {}", e)))?;
        let dest = dest_dir.join(ws.output_kind.output_file_name());
        tokio::fs::rename(ws.output_path(), &dest).await
            .map_err(|e| JobError::Workspace(format!("promote output: {}", e)))?;
        let size = tokio::fs::metadata(&dest).await
            .map(|m| m.len())
            .map_err(|e| JobError::Workspace(format!("stat artifact: {}", e)))?;
        Ok(Artifact { path: dest, kind: ws.output_kind, size })
    }

    /// Find a promoted output, CSV first
    pub async fn artifact(&self, job_id: &str) -> Option<Artifact> {
        if validate_job_id(job_id).is_err() {
            return None;
        }
        let dir = self.artifact_dir(job_id);
        for kind in [OutputKind::Csv, OutputKind::Json] {
            let path = dir.join(kind.output_file_name());
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                if meta.is_file() {
                    return Some(Artifact { path, kind, size: meta.len() });
                }
            }
        }
        None
    }

    /// Remove everything stored for a job. Absent data is not an error.
    ///
    /// A job that is still running is refused with `Conflict` and nothing is
    /// removed. The live set stays locked meanwhile, so no admit can slip in.
    pub async fn remove_job(&self, job_id: &str) -> Result<(), JobError> {
        validate_job_id(job_id)?;
        let live = self.live.write().await;
        if live.contains(job_id) {
            return Err(JobError::Conflict(format!("Job {} is still running", job_id)));
        }
        remove_tree(&self.artifact_dir(job_id)).await?;
        remove_tree(&self.workspace_dir(job_id)).await?;
        drop(live);
        Ok(())
    }
}

async fn remove_tree(path: &Path) -> Result<(), JobError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JobError::Workspace(format!("remove {}: {}", path.display(), e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv_upload() -> Upload {
        Upload {
            bytes: Bytes::from_static(b"name,email\nalice,a@example.com\n"),
            original_name: "people.csv".to_string(),
            content_type: Some("text/csv".to_string()),
        }
    }

    #[test]
    fn test_output_kind_inference() {
        assert_eq!(OutputKind::infer(Some("text/csv"), "a.csv"), OutputKind::Csv);
        assert_eq!(OutputKind::infer(Some("application/json"), "a.txt"), OutputKind::Json);
        assert_eq!(OutputKind::infer(None, "records.JSON"), OutputKind::Json);
        assert_eq!(OutputKind::infer(Some("application/octet-stream"), "blob"), OutputKind::Csv);
    }

    #[test]
    fn test_validate_job_id() {
        assert!(validate_job_id("job-1_A").is_ok());
        assert!(validate_job_id("").is_err());
        assert!(validate_job_id("../etc").is_err());
        assert!(validate_job_id("a/b").is_err());
        assert!(validate_job_id(&"x".repeat(MAX_JOB_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_admit_stages_input_with_extension() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();

        let ws = mgr.admit(Some("job-1"), Some(csv_upload())).await.unwrap();
        assert_eq!(ws.job_id, "job-1");
        assert!(ws.input_path.ends_with("input.csv"));
        assert!(ws.scratch_dir.is_dir());
        assert_eq!(tokio::fs::read(&ws.input_path).await.unwrap(), csv_upload().bytes.to_vec());
        assert_eq!(ws.output_kind, OutputKind::Csv);
        assert_eq!(mgr.live_count().await, 1);

        mgr.destroy(&ws).await;
        assert!(!ws.dir.exists());
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_admit_generates_id() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let a = mgr.admit(None, Some(csv_upload())).await.unwrap();
        let b = mgr.admit(None, Some(csv_upload())).await.unwrap();
        assert_ne!(a.job_id, b.job_id);
        assert!(uuid::Uuid::parse_str(&a.job_id).is_ok());
    }

    #[tokio::test]
    async fn test_admit_requires_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();

        let err = mgr.admit(Some("empty"), None).await.unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));

        let empty = Upload { bytes: Bytes::new(), ..csv_upload() };
        let err = mgr.admit(Some("empty"), Some(empty)).await.unwrap_err();
        assert!(matches!(err, JobError::Validation { .. }));
        assert!(!mgr.workspace_dir("empty").exists());
    }

    #[tokio::test]
    async fn test_second_admit_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let ws = mgr.admit(Some("dup"), Some(csv_upload())).await.unwrap();

        let err = mgr.admit(Some("dup"), Some(csv_upload())).await.unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        // The live workspace is untouched by the rejected admit
        assert!(ws.input_path.exists());

        mgr.destroy(&ws).await;
        mgr.admit(Some("dup"), Some(csv_upload())).await.unwrap();
    }

    #[tokio::test]
    async fn test_leftover_directory_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        std::fs::create_dir(mgr.workspace_dir("stale")).unwrap();

        let err = mgr.admit(Some("stale"), Some(csv_upload())).await.unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert!(mgr.workspace_dir("stale").exists());
        assert_eq!(mgr.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_tolerates_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let ws = mgr.admit(Some("gone"), Some(csv_upload())).await.unwrap();
        std::fs::remove_dir_all(&ws.dir).unwrap();
        mgr.destroy(&ws).await;
        mgr.destroy(&ws).await;
        assert!(!mgr.is_live("gone").await);
    }

    #[tokio::test]
    async fn test_promote_and_remove_job() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let ws = mgr.admit(Some("promo"), Some(csv_upload())).await.unwrap();
        tokio::fs::write(ws.output_path(), b"name,email\n***,***\n").await.unwrap();

        let artifact = mgr.promote(&ws).await.unwrap();
        mgr.destroy(&ws).await;
        assert_eq!(artifact.size, 19);

        let found = mgr.artifact("promo").await.unwrap();
        assert_eq!(found.kind, OutputKind::Csv);
        assert_eq!(found.path, artifact.path);

        mgr.remove_job("promo").await.unwrap();
        assert!(mgr.artifact("promo").await.is_none());
        // Idempotent
        mgr.remove_job("promo").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_job_refuses_running_job() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let ws = mgr.admit(Some("running"), Some(csv_upload())).await.unwrap();

        let err = mgr.remove_job("running").await.unwrap_err();
        assert!(matches!(err, JobError::Conflict(_)));
        assert!(ws.input_path.exists());
        assert!(mgr.is_live("running").await);

        mgr.destroy(&ws).await;
        mgr.remove_job("running").await.unwrap();
    }

    #[tokio::test]
    async fn test_readmit_clears_previous_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let ws = mgr.admit(Some("same"), Some(csv_upload())).await.unwrap();
        tokio::fs::write(ws.output_path(), b"old,csv\n").await.unwrap();
        mgr.promote(&ws).await.unwrap();
        mgr.destroy(&ws).await;
        assert_eq!(mgr.artifact("same").await.unwrap().kind, OutputKind::Csv);

        let json = Upload {
            bytes: Bytes::from_static(b"[\"new\"]"),
            original_name: "b.json".to_string(),
            content_type: Some("application/json".to_string()),
        };
        let ws = mgr.admit(Some("same"), Some(json)).await.unwrap();
        // Until the re-run finishes there is nothing to download
        assert!(mgr.artifact("same").await.is_none());

        tokio::fs::write(ws.output_path(), b"[\"***\"]").await.unwrap();
        mgr.promote(&ws).await.unwrap();
        mgr.destroy(&ws).await;
        let found = mgr.artifact("same").await.unwrap();
        assert_eq!(found.kind, OutputKind::Json);
        assert_eq!(tokio::fs::read(&found.path).await.unwrap(), b"[\"***\"]");
    }
}
