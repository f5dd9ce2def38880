//! # RVBBIT PG Wire Server
//!
//! Speaks enough of the PostgreSQL wire protocol for off-the-shelf clients
//! (psql, JDBC, tokio-postgres, BI tools) to connect, introspect, and run
//! queries — including the semantic SQL surface, which each session routes
//! through the rewriter, the embedded engine, and the LLM UDF bridge.
//!
//! Per-connection state: one dedicated OLAP session (own embedded-engine
//! connection, UDF registrations, pg_catalog views), prepared-statement and
//! portal maps, and a caller-context holder so UDF dispatches roll up under
//! the SQL request that caused them. Protocol errors close only the
//! offending connection; per-query errors are reported as ErrorResponse and
//! the connection survives.

mod catalog;
mod handler;

pub use catalog::install_views;
pub use handler::{ConnectionHandler, RvbbitHandler, RvbbitStartupHandler};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;

use rvbbit_core::{Error, Result};
use rvbbit_engine::Scheduler;
use rvbbit_sql::{SqlExecutor, SqlRewriter, SqliteEngine, UdfBridge};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct PgServerConfig {
    pub host: String,
    pub port: u16,
    /// Database file backing every session; in-memory (per-session) when
    /// unset.
    pub database_path: Option<PathBuf>,
}

impl Default for PgServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5433,
            database_path: None,
        }
    }
}

/// A running server handle.
pub struct PgServer {
    pub local_addr: std::net::SocketAddr,
    listener: TcpListener,
    scheduler: Scheduler,
    rewriter: Arc<RwLock<SqlRewriter>>,
    database_path: Option<PathBuf>,
}

impl PgServer {
    /// Bind the listener. `rewriter` is shared so operators discovered later
    /// apply to new statements on every session.
    pub async fn bind(
        config: PgServerConfig,
        scheduler: Scheduler,
        rewriter: Arc<RwLock<SqlRewriter>>,
    ) -> Result<Self> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::Protocol(e.to_string()))?;
        tracing::info!(%local_addr, "pg wire server listening");
        Ok(Self {
            local_addr,
            listener,
            scheduler,
            rewriter,
            database_path: config.database_path,
        })
    }

    /// Accept connections forever. Each connection gets its own OLAP
    /// session; a failed session setup or protocol error only affects that
    /// connection.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (socket, peer) = self.listener.accept().await?;
            tracing::debug!(%peer, "pg client connected");

            let scheduler = self.scheduler.clone();
            let rewriter = self.rewriter.clone();
            let database_path = self.database_path.clone();

            tokio::spawn(async move {
                let session = match new_session(scheduler, rewriter, database_path).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!(%peer, "session setup failed: {e}");
                        return;
                    }
                };
                if let Err(e) =
                    pgwire::tokio::process_socket(socket, None, ConnectionHandler::new(session))
                        .await
                {
                    tracing::debug!(%peer, "connection closed: {e}");
                }
            });
        }
    }
}

/// Build one connection's OLAP session: engine, UDFs, catalog views.
async fn new_session(
    scheduler: Scheduler,
    rewriter: Arc<RwLock<SqlRewriter>>,
    database_path: Option<PathBuf>,
) -> Result<Arc<SqlExecutor>> {
    let engine: Arc<dyn rvbbit_sql::OlapEngine> = match database_path {
        Some(path) => Arc::new(SqliteEngine::open(path).await?),
        None => Arc::new(SqliteEngine::open_in_memory().await?),
    };
    let bridge = UdfBridge::new(scheduler);
    let executor = SqlExecutor::new(engine, bridge, rewriter).await?;
    install_views(executor.engine().as_ref()).await?;
    Ok(executor)
}
