pub mod jobs;
pub mod reconciler;
pub mod sandbox;
pub mod sink;
pub mod sluice;
pub mod workspace;

pub use jobs::JobRunner;
pub use reconciler::{JobOutcome, JobReport, Reconciler, TerminalSignal};
pub use sandbox::{Sandbox, SandboxHandle, SandboxLimits, WorkerExit};
pub use sink::{BufferedFileSink, OutputSink, PassthroughSink, SinkSummary};
pub use sluice::Sluice;
pub use workspace::{validate_job_id, Artifact, OutputKind, Upload, Workspace, WorkspaceManager};
