use std::time::Instant;

use super::orchestrator::Orchestrator;

#[derive(Clone)]
pub struct ControlState {
    pub orchestrator: Orchestrator,
    /// When the server was started (for uptime tracking)
    pub started_at: Instant,
    /// Maximum body size for `POST /jobs` (bytes)
    pub upload_limit: usize,
}

impl ControlState {
    pub fn new(orchestrator: Orchestrator, upload_limit: usize) -> Self {
        Self { orchestrator, started_at: Instant::now(), upload_limit }
    }
}
