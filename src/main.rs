mod config;
mod hint;
mod process;
mod verify;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::verify::VerifyOptions;

const LOG_ENV: &str = "CHARTGATE_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "chartgate",
    version,
    about = "Pre-merge checks for chart package branches",
    long_about = None
)]
struct Cli {
    /// Log filter used when CHARTGATE_LOG is unset (logs go to stderr)
    #[arg(global = true, long = "log-level", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Verify the packages modified on the current branch
    VerifyBranch {
        /// Repository to verify (defaults to the current directory)
        path: Option<PathBuf>,
        /// Emit the report as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
        /// Write the report to FILE instead of stdout
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },
    /// Print a ClusterRepo manifest for testing the current branch
    QaHint {
        /// Repository to inspect (defaults to the current directory)
        path: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match std::env::var(LOG_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(level),
    }
    .with_context(|| format!("invalid log filter (set via {} or --log-level)", LOG_ENV))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

fn resolve_path(path: Option<PathBuf>) -> Result<PathBuf> {
    match path {
        Some(path) => Ok(path),
        None => std::env::current_dir().context("failed to read current directory"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::VerifyBranch { path, json, report } => {
            let opts = VerifyOptions {
                repo_path: resolve_path(path)?,
                json_output: json,
                report_path: report,
            };
            let result = verify::run_verify(&opts)
                .await
                .context("branch verification could not run")?;
            Ok(if result.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::QaHint { path } => {
            let path = resolve_path(path)?;
            let hint = hint::resolve_hint(&path)
                .with_context(|| format!("failed to inspect {}", path.display()))?;
            println!("{}", hint::render_hint(&hint)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
