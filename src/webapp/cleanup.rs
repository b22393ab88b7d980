//! Background sweep of promoted artifacts.
//!
//! Buffered outputs outlive their workspace so they can be downloaded later.
//! With `artifact_retain_secs > 0` anything older than that is removed even
//! if nobody ever calls `DELETE /jobs/{id}`.

use std::time::{Duration, SystemTime};

use crate::os::WorkspaceManager;
use super::ExecState;

/// Run the sweep indefinitely; returns at once when retention is disabled
pub async fn cleanup_loop(state: ExecState, interval: Duration) {
    if state.artifact_retain_secs == 0 {
        return;
    }
    let retain = Duration::from_secs(state.artifact_retain_secs);
    loop {
        tokio::time::sleep(interval).await;
        sweep_artifacts(state.workspaces(), retain).await;
    }
}

/// Remove every artifact last modified more than `retain` ago.
/// Returns the number of jobs swept.
pub async fn sweep_artifacts(workspaces: &WorkspaceManager, retain: Duration) -> usize {
    let now = SystemTime::now();
    let mut entries = match tokio::fs::read_dir(workspaces.artifacts_root()).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list artifacts");
            return 0;
        }
    };

    let mut expired = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read artifact entry");
                break;
            }
        };
        let modified = match entry.metadata().await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > retain {
            if let Some(job_id) = entry.file_name().to_str() {
                expired.push(job_id.to_string());
            }
        }
    }

    let mut swept = 0;
    for job_id in &expired {
        match workspaces.remove_job(job_id).await {
            Ok(()) => {
                swept += 1;
                tracing::debug!(job_id = %job_id, "Removed expired artifact");
            }
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Failed to remove expired artifact"),
        }
    }

    if swept > 0 {
        tracing::info!(swept, "Artifact sweep completed");
    }
    swept
}
