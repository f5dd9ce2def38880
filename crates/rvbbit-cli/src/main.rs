// Allow clippy pedantry that makes sense in libraries but not a CLI binary
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use clap::{Parser, Subcommand};

mod bootstrap;
mod commands;

use commands::{logs, mcp, run, serve, sql};

/// RVBBIT - LLM-native data orchestration
///
/// Execute declarative multi-stage workflows (cascades), expose semantic SQL
/// operators over the PostgreSQL wire protocol, and inspect the unified
/// event log.
#[derive(Parser)]
#[command(name = "rvbbit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "LLM-native data orchestration engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one cascade locally
    Run(run::RunArgs),

    /// Start servers (currently: the PostgreSQL wire server)
    #[command(subcommand)]
    Serve(serve::ServeCommand),

    /// Execute a SQL statement locally (with semantic operators)
    #[command(subcommand)]
    Sql(sql::SqlCommand),

    /// Inspect the unified event log
    #[command(subcommand)]
    Logs(logs::LogsCommand),

    /// Manage external MCP tool servers
    #[command(subcommand)]
    Mcp(mcp::McpCommand),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rvbbit=info,warn")),
        )
        .init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");

    let exit_code = runtime.block_on(async {
        let result: Result<()> = match cli.command {
            Commands::Run(args) => run::execute(args).await,
            Commands::Serve(command) => serve::execute(command).await,
            Commands::Sql(command) => sql::execute(command).await,
            Commands::Logs(command) => logs::execute(command).await,
            Commands::Mcp(command) => mcp::execute(command).await,
        };
        match result {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                e.downcast_ref::<rvbbit_core::Error>()
                    .map(rvbbit_core::Error::exit_code)
                    .unwrap_or(3)
            }
        }
    });

    std::process::exit(exit_code);
}
