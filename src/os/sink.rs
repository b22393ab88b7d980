//! Destinations for worker output.
//!
//! Both sinks are driven by a single pump per job and never produce a
//! response themselves; they only report success or failure upward.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};

use crate::error::JobError;

use super::{Workspace, WorkspaceManager};

/// What a sink reports once the worker finished successfully
#[derive(Debug, Clone)]
pub struct SinkSummary {
    pub bytes: u64,
    /// Download path for buffered output; passthrough output has none
    pub locator: Option<String>,
}

#[async_trait]
pub trait OutputSink: Send {
    /// Accept one chunk. Returning only after the destination took it is
    /// what throttles the worker.
    async fn write(&mut self, chunk: Bytes) -> Result<(), JobError>;

    /// Close the destination after a successful run
    async fn finish(self: Box<Self>) -> Result<SinkSummary, JobError>;

    /// Close the destination after a failed run
    async fn abort(self: Box<Self>, error: &JobError);

    fn bytes_written(&self) -> u64;
}

/// Download path served by the execution tier for a finished job
pub fn output_locator(job_id: &str) -> String {
    format!("/jobs/{}/output", job_id)
}

/// Appends output to `output.<ext>` inside the workspace, then promotes it
pub struct BufferedFileSink {
    file: BufWriter<tokio::fs::File>,
    workspace: Workspace,
    manager: WorkspaceManager,
    bytes: u64,
}

impl BufferedFileSink {
    pub async fn create(manager: WorkspaceManager, workspace: Workspace) -> Result<Self, JobError> {
        let file = tokio::fs::File::create(workspace.output_path()).await
            .map_err(|e| JobError::SinkWrite(format!("Failed to create output file: {}", e)))?;
        Ok(Self {
            file: BufWriter::new(file),
            workspace,
            manager,
            bytes: 0,
        })
    }
}

#[async_trait]
impl OutputSink for BufferedFileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), JobError> {
        self.file.write_all(&chunk).await
            .map_err(|e| JobError::SinkWrite(format!("Failed to write output file: {}", e)))?;
        self.bytes += chunk.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<SinkSummary, JobError> {
        self.file.flush().await
            .map_err(|e| JobError::SinkWrite(format!("Failed to flush output file: {}", e)))?;
        self.file.get_ref().sync_all().await
            .map_err(|e| JobError::SinkWrite(format!("Failed to sync output file: {}", e)))?;
        let artifact = self.manager.promote(&self.workspace).await?;
        tracing::debug!(job_id = %self.workspace.job_id, artifact = ?artifact.path, bytes = self.bytes, "Output promoted");
        Ok(SinkSummary {
            bytes: self.bytes,
            locator: Some(output_locator(&self.workspace.job_id)),
        })
    }

    async fn abort(self: Box<Self>, _error: &JobError) {
        // The partial file goes away with the workspace
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

/// Body chunks handed to the HTTP response
pub type BodyChunk = Result<Bytes, io::Error>;

/// Forwards output straight into a streaming response body.
///
/// The first successful write fires `started`, which tells the handler to
/// commit to a 200 with attachment headers. After that point a failure can
/// only be reported in-band, as a trailing error payload.
pub struct PassthroughSink {
    tx: Option<mpsc::Sender<BodyChunk>>,
    started: Option<oneshot::Sender<()>>,
    bytes: u64,
}

impl PassthroughSink {
    /// Returns the sink, the body stream receiver and the started signal
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<BodyChunk>, oneshot::Receiver<()>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let (started_tx, started_rx) = oneshot::channel();
        let sink = Self {
            tx: Some(tx),
            started: Some(started_tx),
            bytes: 0,
        };
        (sink, rx, started_rx)
    }

    fn committed(&self) -> bool {
        self.started.is_none()
    }
}

/// In-band failure notice appended to a partially streamed body
pub fn trailing_error_payload(error: &JobError) -> Bytes {
    let payload = serde_json::json!({
        "status": "failed",
        "error": error.to_string(),
        "details": error.details(),
    });
    Bytes::from(format!("\n{}\n", payload))
}

#[async_trait]
impl OutputSink for PassthroughSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), JobError> {
        let Some(tx) = &self.tx else {
            return Err(JobError::SinkWrite("response stream already closed".to_string()));
        };
        if let Some(started) = self.started.take() {
            let _ = started.send(());
        }
        let len = chunk.len() as u64;
        tx.send(Ok(chunk)).await
            .map_err(|_| JobError::SinkWrite("Client disconnected".to_string()))?;
        self.bytes += len;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<SinkSummary, JobError> {
        // Dropping the sender ends the response body
        self.tx.take();
        Ok(SinkSummary { bytes: self.bytes, locator: None })
    }

    async fn abort(mut self: Box<Self>, error: &JobError) {
        let Some(tx) = self.tx.take() else { return };
        if self.committed() {
            // Best effort: the caller may already be gone
            let _ = tx.send(Ok(trailing_error_payload(error))).await;
        }
    }

    fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Upload;

    #[tokio::test]
    async fn test_buffered_sink_promotes_output() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = WorkspaceManager::new(tmp.path()).await.unwrap();
        let upload = Upload {
            bytes: Bytes::from_static(b"[{\"a\":1}]"),
            original_name: "rows.json".to_string(),
            content_type: Some("application/json".to_string()),
        };
        let ws = mgr.admit(Some("buf"), Some(upload)).await.unwrap();

        let mut sink: Box<dyn OutputSink> = Box::new(BufferedFileSink::create(mgr.clone(), ws.clone()).await.unwrap());
        sink.write(Bytes::from_static(b"[{\"a\":")).await.unwrap();
        sink.write(Bytes::from_static(b"\"***\"}]")).await.unwrap();
        assert_eq!(sink.bytes_written(), 13);

        let summary = sink.finish().await.unwrap();
        assert_eq!(summary.bytes, 13);
        assert_eq!(summary.locator.as_deref(), Some("/jobs/buf/output"));

        let artifact = mgr.artifact("buf").await.unwrap();
        assert!(artifact.path.ends_with("output.json"));
        assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), b"[{\"a\":\"***\"}]");
    }

    #[tokio::test]
    async fn test_passthrough_forwards_and_signals_start() {
        let (mut sink, mut rx, mut started) = PassthroughSink::new(4);
        assert!(started.try_recv().is_err());

        sink.write(Bytes::from_static(b"a,b\n")).await.unwrap();
        assert!(started.try_recv().is_ok());
        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"a,b\n"));

        let summary = Box::new(sink).finish().await.unwrap();
        assert_eq!(summary.bytes, 4);
        assert!(summary.locator.is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_abort_appends_trailer_once_committed() {
        let (mut sink, mut rx, _started) = PassthroughSink::new(4);
        sink.write(Bytes::from_static(b"partial")).await.unwrap();

        let err = JobError::SandboxRuntime { exit_code: Some(1), killed_by_timeout: false, diagnostics: "bad row 3".into() };
        Box::new(sink).abort(&err).await;

        assert_eq!(rx.recv().await.unwrap().unwrap(), Bytes::from_static(b"partial"));
        let trailer = rx.recv().await.unwrap().unwrap();
        let text = String::from_utf8(trailer.to_vec()).unwrap();
        assert!(text.contains("\"failed\""));
        assert!(text.contains("bad row 3"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_abort_before_start_sends_nothing() {
        let (sink, mut rx, _started) = PassthroughSink::new(4);
        Box::new(sink).abort(&JobError::SandboxStart("ENOENT".into())).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_passthrough_reports_disconnect() {
        let (mut sink, rx, _started) = PassthroughSink::new(1);
        drop(rx);
        let err = sink.write(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, JobError::SinkWrite(_)));
    }
}
