//! Exactly-once completion for a job.
//!
//! Three things can end a job: the worker exits, the worker never starts,
//! or the sink fails. They may race. Every one of them goes through
//! [`Reconciler::settle`], and only the first caller gets past the
//! `responded` flag; it closes the sink, emits the single outcome and
//! removes the workspace. Later callers return `false` and do nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex};

use crate::error::JobError;

use super::sink::OutputSink;
use super::{WorkerExit, Workspace, WorkspaceManager};

/// Signals that end a job
#[derive(Debug)]
pub enum TerminalSignal {
    Exited { exit: WorkerExit, diagnostics: String },
    StartFailed(JobError),
    SinkFailed(JobError),
}

impl TerminalSignal {
    fn kind(&self) -> &'static str {
        match self {
            Self::Exited { .. } => "exited",
            Self::StartFailed(_) => "start_failed",
            Self::SinkFailed(_) => "sink_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    /// Where buffered output can be fetched; `None` for passthrough runs
    pub locator: Option<String>,
    pub output_size: u64,
    pub duration_ms: u64,
}

/// The single result of one job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(JobReport),
    Failed { job_id: String, error: JobError },
}

impl JobOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Completed(report) => &report.job_id,
            Self::Failed { job_id, .. } => job_id,
        }
    }
}

pub struct Reconciler {
    workspace: Workspace,
    manager: WorkspaceManager,
    sink: Mutex<Option<Box<dyn OutputSink>>>,
    outcome: Mutex<Option<oneshot::Sender<JobOutcome>>>,
    responded: AtomicBool,
    started_at: Instant,
}

impl Reconciler {
    pub fn new(
        workspace: Workspace,
        manager: WorkspaceManager,
        sink: Box<dyn OutputSink>,
    ) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        let reconciler = Self {
            workspace,
            manager,
            sink: Mutex::new(Some(sink)),
            outcome: Mutex::new(Some(tx)),
            responded: AtomicBool::new(false),
            started_at: Instant::now(),
        };
        (reconciler, rx)
    }

    pub fn job_id(&self) -> &str {
        &self.workspace.job_id
    }

    pub fn is_settled(&self) -> bool {
        self.responded.load(Ordering::Acquire)
    }

    /// Hand one chunk to the sink. A no-op once the job is settled.
    pub async fn write(&self, chunk: Bytes) -> Result<(), JobError> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.write(chunk).await,
            None => Ok(()),
        }
    }

    /// Apply a terminal signal. Returns true if this call produced the outcome.
    pub async fn settle(&self, signal: TerminalSignal) -> bool {
        if self.responded.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            tracing::debug!(job_id = %self.job_id(), signal = signal.kind(), "Ignoring terminal signal, job already settled");
            return false;
        }

        let sink = self.sink.lock().await.take();
        let outcome = self.finalize(signal, sink).await;
        let duration_ms = self.started_at.elapsed().as_millis() as u64;

        match &outcome {
            JobOutcome::Completed(report) => tracing::info!(
                job_id = %report.job_id, bytes = report.output_size, duration_ms, "Job completed"
            ),
            JobOutcome::Failed { job_id, error } => tracing::warn!(
                job_id = %job_id, duration_ms, error = %error.summary(), "Job failed"
            ),
        }

        // Torn down before anyone hears the outcome: a job that has answered
        // is never still live
        self.manager.destroy(&self.workspace).await;

        if let Some(tx) = self.outcome.lock().await.take() {
            if tx.send(outcome).is_err() {
                tracing::debug!(job_id = %self.job_id(), "Outcome receiver dropped");
            }
        }

        true
    }

    async fn finalize(&self, signal: TerminalSignal, sink: Option<Box<dyn OutputSink>>) -> JobOutcome {
        let job_id = self.job_id().to_string();
        let Some(sink) = sink else {
            return JobOutcome::Failed { job_id, error: JobError::Internal("sink already closed".to_string()) };
        };

        let error = match signal {
            TerminalSignal::Exited { exit, .. } if exit.success() => {
                return match sink.finish().await {
                    Ok(summary) => JobOutcome::Completed(JobReport {
                        job_id,
                        locator: summary.locator,
                        output_size: summary.bytes,
                        duration_ms: self.started_at.elapsed().as_millis() as u64,
                    }),
                    Err(error) => JobOutcome::Failed { job_id, error },
                };
            }
            TerminalSignal::Exited { exit, diagnostics } => JobError::SandboxRuntime {
                exit_code: exit.exit_code,
                killed_by_timeout: exit.killed_by_timeout,
                diagnostics,
            },
            TerminalSignal::StartFailed(error) | TerminalSignal::SinkFailed(error) => error,
        };

        let forwarded = sink.bytes_written();
        if forwarded > 0 {
            tracing::debug!(job_id = %job_id, bytes = forwarded, "Aborting sink after partial output");
        }
        sink.abort(&error).await;
        JobOutcome::Failed { job_id, error }
    }
}
