use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::JobError;

use super::reconciler::{JobOutcome, Reconciler, TerminalSignal};
use super::sink::{BufferedFileSink, OutputSink};
use super::{Sandbox, SandboxHandle, WorkerExit, Workspace, WorkspaceManager};

/// Runs admitted workspaces through the sandbox.
///
/// Cheap to clone; every job gets its own reconciler, pump and exit watcher.
#[derive(Clone)]
pub struct JobRunner {
    pub workspaces: WorkspaceManager,
    pub sandbox: Arc<Sandbox>,
}

impl JobRunner {
    pub fn new(workspaces: WorkspaceManager, sandbox: Sandbox) -> Self {
        Self { workspaces, sandbox: Arc::new(sandbox) }
    }

    /// Start a job with the given sink. The receiver yields its single outcome.
    ///
    /// A start failure is settled before this returns, without waiting on any
    /// exit event.
    pub async fn launch(&self, workspace: Workspace, sink: Box<dyn OutputSink>) -> oneshot::Receiver<JobOutcome> {
        let (reconciler, outcome) = Reconciler::new(workspace.clone(), self.workspaces.clone(), sink);
        let reconciler = Arc::new(reconciler);

        let handle = match self.sandbox.spawn(&workspace).await {
            Ok(handle) => handle,
            Err(e) => {
                reconciler.settle(TerminalSignal::StartFailed(e)).await;
                return outcome;
            }
        };

        let SandboxHandle { output, diagnostics, exit, .. } = handle;
        let pump = tokio::spawn(pump_output(reconciler.clone(), output));

        tokio::spawn(async move {
            let exit = match exit.await {
                Ok(exit) => exit,
                Err(e) => {
                    tracing::warn!(job_id = %reconciler.job_id(), error = %e, "Exit watcher failed");
                    WorkerExit { exit_code: None, killed_by_timeout: false }
                }
            };
            // Everything the worker wrote must reach the sink before success is declared
            let _ = pump.await;
            let diagnostics = diagnostics.read().await.as_string();
            reconciler.settle(TerminalSignal::Exited { exit, diagnostics }).await;
        });

        outcome
    }

    /// Run a job into the buffered file sink and wait for its outcome
    pub async fn run_buffered(&self, workspace: Workspace) -> JobOutcome {
        let job_id = workspace.job_id.clone();
        let sink = match BufferedFileSink::create(self.workspaces.clone(), workspace.clone()).await {
            Ok(sink) => sink,
            Err(error) => {
                self.workspaces.destroy(&workspace).await;
                return JobOutcome::Failed { job_id, error };
            }
        };

        self.launch(workspace, Box::new(sink)).await
            .await
            .unwrap_or_else(|_| JobOutcome::Failed {
                job_id,
                error: JobError::Internal("job outcome was lost".to_string()),
            })
    }
}

/// Move worker output into the sink, one chunk at a time.
///
/// After a sink failure the rest of the output is drained and discarded so
/// the worker is never left blocked on a full pipe.
async fn pump_output(reconciler: Arc<Reconciler>, mut output: mpsc::Receiver<Bytes>) {
    let mut failed = false;
    while let Some(chunk) = output.recv().await {
        if failed || reconciler.is_settled() {
            continue;
        }
        if let Err(e) = reconciler.write(chunk).await {
            failed = true;
            reconciler.settle(TerminalSignal::SinkFailed(e)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::sink::PassthroughSink;
    use crate::os::Upload;

    async fn runner(command: &[&str]) -> (tempfile::TempDir, JobRunner) {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        (tmp, JobRunner::new(mgr, Sandbox::stub(command)))
    }

    fn upload(body: &'static [u8]) -> Upload {
        Upload {
            bytes: Bytes::from_static(body),
            original_name: "people.csv".to_string(),
            content_type: Some("text/csv".to_string()),
        }
    }

    #[tokio::test]
    async fn test_noop_worker_round_trips_bytes() {
        let (_tmp, runner) = runner(&["cat"]).await;
        let body: &'static [u8] = b"name,email\nalice,alice@example.com\nbob,bob@example.com\n";
        let ws = runner.workspaces.admit(Some("roundtrip"), Some(upload(body))).await.unwrap();

        let report = match runner.run_buffered(ws).await {
            JobOutcome::Completed(report) => report,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(report.output_size, body.len() as u64);
        assert_eq!(report.locator.as_deref(), Some("/jobs/roundtrip/output"));

        let artifact = runner.workspaces.artifact("roundtrip").await.unwrap();
        assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_large_output_passes_through_backpressure() {
        let (_tmp, mut runner) = runner(&["sh", "-c", "yes 0123456789abcde | head -c 1048576"]).await;
        let mut sandbox = (*runner.sandbox).clone();
        sandbox.limits.output_queue_depth = 1;
        runner.sandbox = Arc::new(sandbox);
        let ws = runner.workspaces.admit(Some("big"), Some(upload(b"x\n"))).await.unwrap();

        match runner.run_buffered(ws).await {
            JobOutcome::Completed(report) => assert_eq!(report.output_size, 1 << 20),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_worker_is_reported_and_cleaned_up() {
        let (_tmp, runner) = runner(&["sh", "-c", "cat >/dev/null; echo 'bad row 3' >&2; exit 1"]).await;
        let ws = runner.workspaces.admit(Some("bad"), Some(upload(b"a,b\n"))).await.unwrap();
        let dir = ws.dir.clone();

        match runner.run_buffered(ws).await {
            JobOutcome::Failed { error, .. } => assert!(error.summary().contains("bad row 3")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(runner.workspaces.artifact("bad").await.is_none());

        for _ in 0..100 {
            if !dir.exists() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("workspace was not removed");
    }

    #[tokio::test]
    async fn test_start_failure_is_immediate() {
        let (_tmp, runner) = runner(&["/nonexistent/worker"]).await;
        let ws = runner.workspaces.admit(Some("nostart"), Some(upload(b"a\n"))).await.unwrap();

        match runner.run_buffered(ws).await {
            JobOutcome::Failed { error, .. } => assert!(matches!(error, JobError::SandboxStart(_))),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnected_client_is_a_sink_failure() {
        let (_tmp, runner) = runner(&["cat"]).await;
        let ws = runner.workspaces.admit(Some("gone"), Some(upload(b"a,b\n1,2\n"))).await.unwrap();

        let (sink, rx, _started) = PassthroughSink::new(1);
        drop(rx);
        match runner.launch(ws, Box::new(sink)).await.await.unwrap() {
            JobOutcome::Failed { error, .. } => assert!(matches!(error, JobError::SinkWrite(_))),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
