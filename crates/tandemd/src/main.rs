//! Tandem Daemon (tandemd)
//!
//! Serves collaborative text documents over WebSocket.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 7070, in-memory)
//! tandemd
//!
//! # With persistence
//! tandemd --db /var/lib/tandem/tandem.db
//!
//! # With metrics
//! tandemd --metrics-port 9100
//!
//! # With configuration file
//! tandemd --config /etc/tandem/tandemd.toml
//! ```

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tandem_storage::{MemoryStorage, SqliteStorage, Storage};
use tandem_transport::{Metrics, MetricsServer, SessionOrchestrator, WebSocketServer};

use crate::config::{Args, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let storage: Arc<dyn Storage> = match &config.db {
        Some(db_path) => {
            info!(path = %db_path.display(), "Initializing SQLite persistence");
            let storage = SqliteStorage::new(db_path)
                .with_context(|| format!("Failed to open database {}", db_path.display()))?;
            Arc::new(storage)
        }
        None => {
            info!("Running in-memory only (no --db specified)");
            Arc::new(MemoryStorage::new())
        }
    };

    let session = Arc::new(
        SessionOrchestrator::new(storage.clone()).with_broadcast_capacity(config.broadcast_capacity),
    );
    let server_id = session.server_id().await?;
    let addr = config.addr()?;

    info!(
        addr = %addr,
        server_id = %server_id,
        persistent = config.db.is_some(),
        broadcast_capacity = config.broadcast_capacity,
        "Starting Tandem daemon"
    );

    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);
    let mut handles = Vec::new();

    if let Some(metrics_addr) = config.metrics_addr()? {
        let metrics_server = MetricsServer::new(metrics.clone(), metrics_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        }));
    }

    let ws_server = WebSocketServer::new(session.clone(), addr).with_metrics(metrics);
    handles.push(tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            error!(error = %e, "WebSocket server error");
        }
    }));

    // Periodic summary of what the coordinator holds
    let stats_session = session.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = stats_session.coordinator().stats();
            info!(
                documents = stats.document_count,
                transactions = stats.transaction_count,
                authors = stats.active_authors,
                "Coordinator stats"
            );
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    for handle in handles {
        handle.abort();
    }

    if let Ok(stats) = storage.stats().await {
        info!(
            documents = stats.document_count,
            transactions = stats.transaction_count,
            "Storage at shutdown"
        );
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔╦╗╔═╗╔╗╔╔╦╗╔═╗╔╦╗
   ║ ╠═╣║║║ ║║║╣ ║║║
   ╩ ╩ ╩╝╚╝═╩╝╚═╝╩ ╩
  Collaborative text synchronization
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
