pub mod client;
pub mod config;
pub mod error;
pub mod ops;
pub mod procs;
pub mod serialization;
pub mod server;
pub mod triggers;

use std::path::Path;

use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub use client::TsdbClient;
pub use config::{EngineKind, ServerConfig};
pub use error::{Result, ServerError};
pub use ops::{Op, Return, Status};
pub use procs::{ProcRegistry, StoredProcedure};
pub use server::TsdbServer;
pub use triggers::{TriggerEvent, TriggerRegistry};

/// Runs the server configured by the `TSDB_*` environment until ctrl-c.
pub async fn serve() -> anyhow::Result<()> {
    let cfg = ServerConfig::from_env();
    let _guard = init_tracing(cfg.log_dir.as_deref());

    let db = cfg.open_db()?;
    let listener = TcpListener::bind(&cfg.listen).await?;
    TsdbServer::new(db)
        .serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("cannot listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

/// Logs to stdout, or to a daily file under `log_dir`. Keep the returned
/// guard alive to flush the file writer.
pub fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "tsdb.log"));
            let _ = builder.with_ansi(false).with_writer(writer).try_init();
            Some(guard)
        }
        None => {
            let _ = builder.try_init();
            None
        }
    }
}
