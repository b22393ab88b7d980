use anyhow::Result;
use clap::{Parser, Subcommand};

use scrubbox::{cli, config, control, webapp};

#[derive(Parser)]
#[command(name = "scrubbox")]
#[command(about = "Sandboxed anonymization jobs for CSV and JSON files")]
#[command(long_about = "\
Sandboxed anonymization jobs for CSV and JSON files

scrubbox runs untrusted data files through an anonymization worker inside an
isolated, resource-bounded sandbox. It has two tiers:

  exec     stages uploads, runs the worker, stores or streams the output
  control  keeps job records and exposes submit/poll/download/delete

TYPICAL DEPLOYMENT:

    scrubbox --secret $TOKEN --data-dir /var/lib/scrubbox exec
    scrubbox --secret $TOKEN --exec-url http://exec:3000 --port 8080 control

Smoke-test the worker on a local file:

    scrubbox sandbox people.csv

For more details on each command, use: scrubbox <command> --help
")]
struct Cli {
    /// Global configuration arguments
    #[command(flatten)]
    config: config::ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the execution tier
    ///
    ///  - Accepts bearer-authenticated job submissions and runs each one in its own sandbox.
    ///
    ///  - Buffered outputs are kept for download until deleted.
    ///
    /// Example:
    ///
    ///  $ scrubbox --secret s3cret exec
    ///
    ///  $ scrubbox --secret s3cret --require-sandbox --port 3001 exec
    ///
    Exec(webapp::ServeArgs),

    /// Run the control plane
    ///
    ///  - Validates submissions, records them and forwards each to the execution tier.
    ///
    /// Example:
    ///
    ///  $ scrubbox --secret s3cret --exec-url http://127.0.0.1:3001 control
    ///
    ///  $ scrubbox --secret s3cret --exec-url http://exec:3000 --store-dir ./jobs control
    ///
    Control(webapp::ServeArgs),

    /// Run the worker once on a local file inside the sandbox
    ///
    /// Example:
    ///
    ///  $ scrubbox sandbox people.csv
    ///
    ///  $ scrubbox sandbox --ram 256mb --wall 30 -o out.json rows.json
    ///
    Sandbox(cli::sandbox::SandboxArgs),

    /// Display version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let global_config = config::GlobalConfig::from_args(&cli.config)?;

    // Initialize tracing after config is fully merged
    global_config.init_tracing();

    tracing::debug!("scrubbox starting");

    match cli.command {
        Commands::Exec(args) => webapp::run(args, &global_config).await?,
        Commands::Control(args) => control::run(args, &global_config).await?,
        Commands::Sandbox(args) => cli::sandbox::run(args, &global_config).await?,
        Commands::Version => println!("{}", cli::version("scrubbox")),
    }

    tracing::debug!("scrubbox shutting down");

    Ok(())
}
