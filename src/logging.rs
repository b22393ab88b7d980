//! Tracing setup shared by every subcommand.
//!
//! Terminal verbosity: default WARN, `-v` INFO, `-d` DEBUG, `-q` ERROR,
//! `-s` nothing. `RUST_LOG` applies only when none of those flags is given.
//! An optional log file always receives DEBUG (INFO in release builds).

use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
    Layer, Registry,
};

const CRATE_TARGET: &str = "scrubbox";

/// Log output format
#[derive(Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
    /// Compact single-line format
    Compact,
}

#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    pub verbose: bool,
    pub debug: bool,
    pub quiet: bool,
    pub silent: bool,
    pub format: LogFormat,
    pub log_file: Option<PathBuf>,
}

impl TracingConfig {
    /// Terminal level, or None when silent
    pub fn terminal_level(&self) -> Option<Level> {
        if self.silent {
            None
        } else if self.quiet {
            Some(Level::ERROR)
        } else if self.debug {
            // DEBUG is compiled out of release builds
            Some(if cfg!(debug_assertions) { Level::DEBUG } else { Level::INFO })
        } else if self.verbose {
            Some(Level::INFO)
        } else {
            Some(Level::WARN)
        }
    }

    fn level_flag_given(&self) -> bool {
        self.verbose || self.debug || self.quiet || self.silent
    }
}

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// `scrubbox=<level>,warn`
fn directive(level: Level) -> String {
    format!("{}={},warn", CRATE_TARGET, level.as_str().to_lowercase())
}

fn terminal_filter(level: Level, flag_given: bool) -> EnvFilter {
    if flag_given {
        EnvFilter::new(directive(level))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive(level)))
    }
}

fn terminal_layer(format: &LogFormat, filter: EnvFilter) -> BoxedLayer {
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_ansi(true)
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(path: &PathBuf) -> Option<BoxedLayer> {
    let file = match std::fs::File::create(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Warning: Failed to create log file {:?}: {}", path, e);
            return None;
        }
    };
    let level = if cfg!(debug_assertions) { Level::DEBUG } else { Level::INFO };
    Some(
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(file)
            .with_filter(EnvFilter::new(directive(level)))
            .boxed(),
    )
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_tracing(config: TracingConfig) {
    if TRACING_INITIALIZED.set(()).is_err() {
        return;
    }

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if let Some(layer) = config.log_file.as_ref().and_then(file_layer) {
        layers.push(layer);
    }
    if let Some(level) = config.terminal_level() {
        layers.push(terminal_layer(&config.format, terminal_filter(level, config.level_flag_given())));
    }

    // An empty layer list still installs a registry, which drops everything
    let _ = tracing_subscriber::registry().with(layers).try_init();
}
