//! # Main — CLI Entry Point
//!
//! Routes CLI subcommands to the agent pipeline and the dashboard server.
//! Handles shared concerns: environment loading, structured logging, the
//! Tokio runtime, and database connection.
//!
//! ## Subcommands
//!
//! - `serve`: start the admin API server with the background schedule.
//! - `run <job>`: execute one agent job (or `full` for the whole pipeline).
//! - `report`: print a status report over recent runs.
//! - `migrate`: apply pending database migrations and exit.
//!
//! ## Global Options
//!
//! - `--database-url` / `DATABASE_URL`: PostgreSQL connection for agent state.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "tollgate",
    about = "Monetization agent: metrics sync, opportunity detection, and revenue forecasting"
)]
struct Cli {
    /// PostgreSQL connection URL (or set DATABASE_URL env var)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the admin API server and background schedule
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 7001)]
        port: u16,
    },
    /// Execute one agent job to completion and print its summary
    Run {
        /// Job to run: metrics_sync, opportunity_scan, rpm_analysis, forecast,
        /// cleanup, full, or report
        job: String,
    },
    /// Print a status report over recent runs
    Report {
        /// Emit the report as JSON on stdout instead of the human summary
        #[arg(long)]
        json: bool,
    },
    /// Apply pending database migrations and exit
    Migrate,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize structured logging: LOG_FORMAT=json for K8s, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt().json().with_target(false).init();
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;
    let cfg = tollgate::config::Settings::from_env()?;
    let rt = tokio::runtime::Runtime::new()?;

    match &cli.command {
        Commands::Serve { port } => rt.block_on(tollgate::dashboard::run(*port, database_url, cfg)),
        Commands::Run { job } => cli::run_job_command(&rt, database_url, cfg, job),
        Commands::Report { json } => cli::run_report(&rt, database_url, cfg, *json),
        Commands::Migrate => cli::run_migrate(&rt, database_url),
    }
}
