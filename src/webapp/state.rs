use std::time::Instant;

use sha2::Digest;

use crate::os::{JobRunner, WorkspaceManager};

#[derive(Clone)]
pub struct ExecState {
    pub runner: JobRunner,
    /// SHA-256 of the shared bearer secret; the secret itself is not kept
    pub secret_digest: [u8; 32],
    /// When the server was started (for uptime tracking)
    pub started_at: Instant,
    /// Maximum body size for `POST /jobs` (bytes)
    pub upload_limit: usize,
    /// Artifacts older than this are swept; 0 keeps them until deleted
    pub artifact_retain_secs: u64,
}

impl ExecState {
    pub fn new(runner: JobRunner, secret: &str, upload_limit: usize, artifact_retain_secs: u64) -> Self {
        Self {
            runner,
            secret_digest: secret_digest(secret),
            started_at: Instant::now(),
            upload_limit,
            artifact_retain_secs,
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.runner.workspaces
    }

    /// Chunks a passthrough response may hold before the worker is throttled
    pub fn passthrough_depth(&self) -> usize {
        self.runner.sandbox.limits.output_queue_depth
    }
}

pub fn secret_digest(secret: &str) -> [u8; 32] {
    crate::sha256!(secret.as_bytes()).finalize().into()
}

/// First 8 hex digits of the secret's digest; logged by both tiers at startup
pub fn secret_fingerprint(secret: &str) -> String {
    hex::encode(&secret_digest(secret)[..4])
}
