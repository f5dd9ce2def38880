//! `rvbbit serve sql --host --port`

use anyhow::Result;
use clap::{Args, Subcommand};

use rvbbit_pgwire::{PgServer, PgServerConfig};

use crate::bootstrap;

#[derive(Subcommand)]
pub enum ServeCommand {
    /// Start the PostgreSQL wire-protocol server
    Sql(SqlServeArgs),
}

#[derive(Args)]
pub struct SqlServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long, default_value_t = 5433)]
    pub port: u16,

    /// Database file backing sessions (in-memory per session when unset)
    #[arg(long)]
    pub database: Option<std::path::PathBuf>,
}

pub async fn execute(command: ServeCommand) -> Result<()> {
    match command {
        ServeCommand::Sql(args) => {
            let runtime = bootstrap::runtime().await?;
            let config = PgServerConfig {
                host: args.host,
                port: args.port,
                database_path: args.database,
            };
            let server =
                PgServer::bind(config, runtime.scheduler.clone(), runtime.rewriter.clone()).await?;
            println!(
                "listening on postgresql://{}  (ctrl-c to stop)",
                server.local_addr
            );

            let events = runtime.events.clone();
            tokio::select! {
                result = server.serve() => { result?; }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down");
                }
            }
            events.close().await;
            Ok(())
        }
    }
}
