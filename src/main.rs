use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

mod cmd;

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Controlled execution engine for sandboxed repository changes")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory override. Defaults to <repo>/.warden
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Turn a dry-run report into an executable request document
    Plan {
        /// Dry-run report (JSON) listing the proposed operations
        dry_run: PathBuf,

        /// Where to write the request document
        #[arg(short, long, default_value = "request.json")]
        output: PathBuf,

        /// Validate the proposed operations against a policy document
        #[arg(long)]
        policy: Option<PathBuf>,

        /// Plan a linear-mode request instead of DAG mode
        #[arg(long)]
        linear: bool,
    },
    /// Execute a request through the full lifecycle
    Run {
        /// Request document (JSON or YAML)
        #[arg(short, long)]
        request: PathBuf,

        /// Policy document (JSON or YAML)
        #[arg(short, long)]
        policy: PathBuf,

        /// Maximum concurrently running operations in DAG mode
        #[arg(long, default_value = "5")]
        max_parallel: usize,

        /// Force linear mode regardless of the request document
        #[arg(long)]
        linear: bool,

        /// Skip checksum verification after a rollback
        #[arg(long)]
        no_verify: bool,
    },
    /// Restore a repository to a recorded rollback point
    Rollback {
        /// Repository the execution ran against
        #[arg(long)]
        repo: PathBuf,

        /// Execution id whose rollback points to use
        #[arg(long)]
        run: Uuid,

        /// Rollback point name or operation id (defaults to the most recent point)
        #[arg(long)]
        step: Option<String>,

        /// Skip checksum verification after the restore
        #[arg(long)]
        no_verify: bool,
    },
    /// Show the audit tape and result of an execution
    Status {
        /// Repository the execution ran against
        #[arg(long)]
        repo: PathBuf,

        /// Execution id to inspect
        #[arg(long)]
        run: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "warden=debug" } else { "warden=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match &cli.command {
        Commands::Plan {
            dry_run,
            output,
            policy,
            linear,
        } => {
            cmd::cmd_plan(dry_run, output, policy.as_deref(), *linear)?;
        }
        Commands::Run {
            request,
            policy,
            max_parallel,
            linear,
            no_verify,
        } => {
            let success = cmd::cmd_run(
                request,
                policy,
                cli.state_dir.clone(),
                *max_parallel,
                *linear,
                *no_verify,
            )
            .await?;
            if !success {
                std::process::exit(1);
            }
        }
        Commands::Rollback {
            repo,
            run,
            step,
            no_verify,
        } => {
            cmd::cmd_rollback(repo, cli.state_dir.clone(), run, step.as_deref(), *no_verify)?;
        }
        Commands::Status { repo, run } => {
            cmd::cmd_status(repo, cli.state_dir.clone(), run)?;
        }
    }

    Ok(())
}
