use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::exit;

use bytes::Bytes;

use crate::os::{JobOutcome, JobRunner, Upload, WorkspaceManager};
use crate::prelude::parse_size_kb;

#[derive(Parser, Debug)]
pub struct SandboxArgs {
    /// RAM limit (supports human-friendly formats: 64mb, 1gb, etc.)
    /// Default: worker.ram_mb from the config
    #[arg(long)]
    ram: Option<String>,

    /// Wallclock time limit in seconds (kills the worker after this duration)
    #[arg(long, visible_alias = "wall")]
    wall_time: Option<u64>,

    /// Declared content type of the input; inferred from the extension when omitted
    #[arg(long)]
    content_type: Option<String>,

    /// Write the processed output here instead of stdout
    #[arg(short = 'o', long)]
    out: Option<PathBuf>,

    /// Append a JSON summary of the run to a JSONL file
    #[arg(long = "stats")]
    stats_file: Option<String>,

    /// CSV or JSON file to run through the worker
    file: PathBuf,
}

/// Stats record appended to JSONL file
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsRecord {
    file: String,
    job_id: String,
    status: &'static str,
    input_size: u64,
    output_size: Option<u64>,
    duration_ms: Option<u64>,
    error: Option<String>,
}

/// Run the configured worker once on a local file, in the same sandbox the
/// execution tier uses
pub async fn run(args: SandboxArgs, config: &crate::config::GlobalConfig) -> Result<()> {
    let mut sandbox = config.sandbox();
    if let Some(ram) = &args.ram {
        sandbox.limits.ram_kb = parse_size_kb(ram)
            .map_err(|e| anyhow::anyhow!("Invalid --ram value: {}", e))?;
    }
    if let Some(wall) = args.wall_time {
        sandbox.limits.wall_time_secs = wall;
    }

    let workspaces = WorkspaceManager::new(&config.data_dir).await
        .context(format!("Failed to prepare data dir {}", config.data_dir.display()))?;
    let runner = JobRunner::new(workspaces, sandbox);

    let stats = run_file(&runner, &args.file, args.content_type.clone(), args.out.as_deref()).await?;

    if let Some(stats_path) = &args.stats_file {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(stats_path)
            .context(format!("Failed to open stats file: {}", stats_path))?;
        writeln!(file, "{}", serde_json::to_string(&stats)?)
            .context("Failed to write stats")?;
    }

    if stats.error.is_some() {
        exit(1);
    }
    Ok(())
}

/// Run one file and deliver its output to `out` or stdout.
///
/// Nothing is left under the data dir afterwards, whether the run or the
/// delivery failed.
async fn run_file(runner: &JobRunner, file: &Path, content_type: Option<String>, out: Option<&Path>) -> Result<StatsRecord> {
    let data = tokio::fs::read(file).await
        .context(format!("Failed to read input file {}", file.display()))?;
    let original_name = file.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("input")
        .to_string();
    let input_size = data.len() as u64;

    let workspaces = &runner.workspaces;
    let upload = Upload { bytes: Bytes::from(data), original_name, content_type };
    let workspace = workspaces.admit(None, Some(upload)).await?;
    let job_id = workspace.job_id.clone();
    tracing::info!(job_id = %job_id, bytes = input_size, "Running worker");

    let outcome = runner.run_buffered(workspace).await;
    let delivered = match &outcome {
        JobOutcome::Completed(_) => deliver(workspaces, &job_id, out).await,
        JobOutcome::Failed { .. } => Ok(()),
    };

    if let Err(e) = workspaces.remove_job(&job_id).await {
        tracing::warn!(job_id = %job_id, error = %e.summary(), "Failed to remove job output");
    }
    delivered?;

    let mut stats = StatsRecord {
        file: file.display().to_string(),
        job_id,
        status: "completed",
        input_size,
        output_size: None,
        duration_ms: None,
        error: None,
    };
    match outcome {
        JobOutcome::Completed(report) => {
            stats.output_size = Some(report.output_size);
            stats.duration_ms = Some(report.duration_ms);
        }
        JobOutcome::Failed { error, .. } => {
            eprintln!("{}", error.summary());
            stats.status = "failed";
            stats.error = Some(error.summary());
        }
    }
    Ok(stats)
}

async fn deliver(workspaces: &WorkspaceManager, job_id: &str, out: Option<&Path>) -> Result<()> {
    let artifact = workspaces.artifact(job_id).await
        .ok_or_else(|| anyhow::anyhow!("Output of job {} went missing", job_id))?;
    match out {
        Some(path) => {
            tokio::fs::copy(&artifact.path, path).await
                .context(format!("Failed to write {}", path.display()))?;
        }
        None => {
            let bytes = tokio::fs::read(&artifact.path).await?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    Ok(())
}
