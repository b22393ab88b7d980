//! Global configuration for both tiers.
//!
//! Sources, highest priority first:
//! 1. CLI flags and their `SCRUBBOX_*` environment variables
//! 2. `--config` (a JSON file path or inline JSON)
//! 3. Built-in defaults
//!
//! Sizes accept either a byte count or a human-friendly string such as
//! `"20MB"` in JSON, and the string form on the command line.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use serde::{Deserialize, Deserializer, Serialize};

use crate::logging::LogFormat;
use crate::os::{Sandbox, SandboxLimits};
use crate::prelude::parse_size;

pub const DEFAULT_PORT: u16 = 3000;

// ============================================================================
// Configuration Arguments
// ============================================================================

#[derive(Args, Clone, Debug, Default)]
pub struct ConfigArgs {
    /// Configuration file (JSON file path or JSON string).
    ///
    /// - A file path: --config /etc/scrubbox.json
    ///
    /// - Inline JSON: --config '{"worker":{"command":["python3","/opt/worker/process.py"]}}'
    ///
    #[arg(long = "config", short = 'c', env = "SCRUBBOX_CONFIG", value_name = "file.json or {json}")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "SCRUBBOX_PORT")]
    pub port: Option<u16>,

    /// Root directory for workspaces and output artifacts (execution tier)
    #[arg(long, env = "SCRUBBOX_DATA_DIR", value_name = "PATH")]
    pub data_dir: Option<PathBuf>,

    /// Shared secret expected as `Authorization: Bearer <secret>` by the
    /// execution tier, and sent by the control plane
    #[arg(long, env = "SCRUBBOX_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Base URL of the execution tier (control plane)
    #[arg(long, env = "SCRUBBOX_EXEC_URL", value_name = "http(s)://...")]
    pub exec_url: Option<String>,

    /// Directory for JSON job records (control plane).
    ///
    /// Without it, records are kept in memory only.
    #[arg(long, env = "SCRUBBOX_STORE_DIR", value_name = "PATH")]
    pub store_dir: Option<PathBuf>,

    /// Maximum upload body accepted by the execution tier (e.g. "20MB")
    #[arg(long, env = "SCRUBBOX_UPLOAD_LIMIT", value_name = "SIZE")]
    pub upload_limit: Option<String>,

    /// Maximum input file accepted by the control plane (e.g. "5MB")
    #[arg(long, env = "SCRUBBOX_MAX_INPUT_SIZE", value_name = "SIZE")]
    pub max_input_size: Option<String>,

    /// Require full sandbox isolation (fail jobs if unavailable)
    ///
    /// Without this flag, the sandbox degrades when kernel features are
    /// unavailable (e.g., in containers without user namespaces).
    ///
    /// With this flag, a job fails to start unless all of these hold:
    /// - a delegated cgroup for memory and CPU quotas
    /// - user, network, IPC, UTS and mount namespaces
    /// - Landlock filesystem restrictions
    ///
    #[arg(long, env = "SCRUBBOX_REQUIRE_SANDBOX")]
    pub require_sandbox: bool,

    // -------------------------------------------------------------------------
    // Logging/Tracing Options
    // -------------------------------------------------------------------------

    /// Enable verbose output (INFO level logging)
    #[arg(short = 'v', long, env = "SCRUBBOX_VERBOSE")]
    pub verbose: bool,

    /// Enable debug output (DEBUG level logging)
    #[arg(short = 'd', long, env = "SCRUBBOX_DEBUG", conflicts_with = "verbose")]
    pub debug: bool,

    /// Quiet mode - only show errors
    #[arg(short = 'q', long, conflicts_with_all = ["verbose", "debug"])]
    pub quiet: bool,

    /// Silent mode - suppress all terminal log output
    ///
    /// Log file output (if configured) is unaffected.
    #[arg(long, short = 's', conflicts_with_all = ["verbose", "debug", "quiet"])]
    pub silent: bool,

    /// Log output format
    #[arg(long, short = 'L', value_enum, env = "SCRUBBOX_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Write debug logs to file
    #[arg(long, short = 'l', env = "SCRUBBOX_LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

// ============================================================================
// Worker Configuration
// ============================================================================

/// The opaque anonymization worker and its per-run limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// argv of the worker; input on stdin, output on stdout, diagnostics on stderr
    pub command: Vec<String>,
    pub ram_mb: u64,
    /// Share of one CPU (0.5 = half a core)
    pub cpu_fraction: f64,
    /// Size cap of the writable scratch tmpfs
    pub scratch_mb: u64,
    pub wall_time_secs: u64,
    /// Bytes of stderr kept for failure reports
    #[serde(deserialize_with = "size_or_bytes")]
    pub diagnostics_capacity: u64,
    /// 8 KiB output chunks buffered between worker and sink
    pub output_queue_depth: usize,
    /// Host paths the worker may read and execute from
    pub read_paths: Vec<PathBuf>,
    /// Delegated cgroup v2 directory (e.g. /sys/fs/cgroup/scrubbox)
    pub cgroup_root: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".to_string(), "/opt/scrubbox/process.py".to_string()],
            ram_mb: 512,
            cpu_fraction: 0.5,
            scratch_mb: 128,
            wall_time_secs: 300,
            diagnostics_capacity: 64 * 1024,
            output_queue_depth: 8,
            read_paths: ["/usr", "/lib", "/lib64", "/bin", "/etc"].iter().map(PathBuf::from).collect(),
            cgroup_root: None,
        }
    }
}

impl WorkerConfig {
    pub fn to_sandbox(&self, require_sandbox: bool) -> Sandbox {
        Sandbox {
            command: self.command.clone(),
            limits: SandboxLimits {
                ram_kb: self.ram_mb * 1024,
                cpu_fraction: self.cpu_fraction,
                scratch_kb: self.scratch_mb * 1024,
                wall_time_secs: self.wall_time_secs,
                diagnostics_capacity: self.diagnostics_capacity as usize,
                output_queue_depth: self.output_queue_depth,
            },
            read_paths: self.read_paths.clone(),
            cgroup_root: self.cgroup_root.clone(),
            require_sandbox,
        }
    }
}

// ============================================================================
// Global Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    pub port: Option<u16>,

    /// Root of `workspaces/` and `artifacts/`
    pub data_dir: PathBuf,

    /// Shared bearer secret between the tiers
    pub secret: Option<String>,

    /// Execution tier base URL, used by the control plane
    pub exec_url: Option<String>,

    /// JSON job store directory; None keeps records in memory
    pub store_dir: Option<PathBuf>,

    /// Cross-tier connection timeout in seconds
    pub connect_timeout: Option<u64>,

    /// Cross-tier total request timeout in seconds.
    /// Jobs hold the request open, so this must exceed the worker wall time.
    pub request_timeout: Option<u64>,

    #[serde(deserialize_with = "size_or_bytes")]
    pub upload_limit: u64,

    #[serde(deserialize_with = "size_or_bytes")]
    pub max_input_size: u64,

    /// Age after which unclaimed artifacts are swept; 0 keeps them until deleted
    pub artifact_retain_secs: u64,

    pub worker: WorkerConfig,

    pub require_sandbox: bool,

    pub verbose: bool,
    pub debug: bool,
    pub quiet: bool,
    pub silent: bool,
    pub log_format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            port: None,
            data_dir: std::env::temp_dir().join("scrubbox"),
            secret: None,
            exec_url: None,
            store_dir: None,
            connect_timeout: Some(10),
            request_timeout: None,
            upload_limit: 20 * 1024 * 1024,
            max_input_size: 5 * 1024 * 1024,
            artifact_retain_secs: 0,
            worker: WorkerConfig::default(),
            require_sandbox: false,
            verbose: false,
            debug: false,
            quiet: false,
            silent: false,
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

impl GlobalConfig {
    /// Load configuration, CLI args taking precedence over the config file
    pub fn from_args(args: &ConfigArgs) -> Result<Self> {
        let mut global: GlobalConfig = match &args.config {
            Some(input) => {
                let json = load_json_string(input)?;
                serde_json::from_str(&json)
                    .map_err(|e| anyhow::anyhow!("Failed to parse config JSON: {}", e))?
            }
            None => GlobalConfig::default(),
        };
        global.merge_args(args)?;
        Ok(global)
    }

    fn merge_args(&mut self, args: &ConfigArgs) -> Result<()> {
        if let Some(port) = args.port {
            self.port = Some(port);
        }
        if let Some(dir) = &args.data_dir {
            self.data_dir = dir.clone();
        }
        if let Some(secret) = &args.secret {
            self.secret = Some(secret.clone());
        }
        if let Some(url) = &args.exec_url {
            self.exec_url = Some(url.clone());
        }
        if let Some(dir) = &args.store_dir {
            self.store_dir = Some(dir.clone());
        }
        if let Some(size) = &args.upload_limit {
            self.upload_limit = parse_size(size).map_err(anyhow::Error::msg)?;
        }
        if let Some(size) = &args.max_input_size {
            self.max_input_size = parse_size(size).map_err(anyhow::Error::msg)?;
        }
        if args.require_sandbox {
            self.require_sandbox = true;
        }

        self.verbose |= args.verbose;
        self.debug |= args.debug;
        self.quiet |= args.quiet;
        self.silent |= args.silent;
        if let Some(format) = &args.log_format {
            self.log_format = format.clone();
        }
        if let Some(log_file) = &args.log_file {
            self.log_file = Some(log_file.clone());
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// The shared secret; both servers refuse to start without one
    pub fn require_secret(&self) -> Result<&str> {
        self.secret.as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!(
                "Shared secret required. Specify via --secret, SCRUBBOX_SECRET env var, or config file"
            ))
    }

    pub fn require_exec_url(&self) -> Result<&str> {
        self.exec_url.as_deref()
            .ok_or_else(|| anyhow::anyhow!(
                "Execution tier URL required. Specify via --exec-url, SCRUBBOX_EXEC_URL env var, or config file"
            ))
    }

    pub fn sandbox(&self) -> Sandbox {
        self.worker.to_sandbox(self.require_sandbox)
    }

    /// Initialize tracing once the config is fully merged
    pub fn init_tracing(&self) {
        crate::logging::init_tracing(crate::logging::TracingConfig {
            verbose: self.verbose,
            debug: self.debug,
            quiet: self.quiet,
            silent: self.silent,
            format: self.log_format.clone(),
            log_file: self.log_file.clone(),
        });
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

/// Inline JSON if it looks like JSON, otherwise a file path
fn load_json_string(input: &str) -> Result<String> {
    if input.trim_start().starts_with('{') {
        return Ok(input.to_string());
    }
    let path = std::path::Path::new(input);
    std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))
}

/// Accept `1048576` or `"1MB"`
fn size_or_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Size {
        Bytes(u64),
        Text(String),
    }

    match Size::deserialize(deserializer)? {
        Size::Bytes(n) => Ok(n),
        Size::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
