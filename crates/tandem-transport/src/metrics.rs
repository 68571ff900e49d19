//! Prometheus metrics for Tandem
//!
//! Counters for connections, admissions, rejections and broadcasts, exposed
//! in Prometheus text format via HTTP.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Tandem metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,

    // Message metrics
    pub messages_total: IntCounterVec,
    pub errors_total: IntCounterVec,

    // Admission metrics
    pub submissions_total: IntCounter,
    pub transactions_applied: IntCounter,
    pub empty_admissions: IntCounter,
    pub transactions_rejected: IntCounter,

    // Broadcast metrics
    pub broadcasts_sent: IntCounter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let connections_total = IntCounter::new("tandem_connections_total", "Total number of connections")?;
        let connections_active = IntGauge::new("tandem_connections_active", "Number of active connections")?;

        let messages_total = IntCounterVec::new(
            Opts::new("tandem_messages_total", "Client messages processed"),
            &["kind"],
        )?;
        let errors_total = IntCounterVec::new(
            Opts::new("tandem_errors_total", "Errors reported to clients"),
            &["code"],
        )?;

        let submissions_total = IntCounter::new("tandem_submissions_total", "Changes submitted by clients")?;
        let transactions_applied = IntCounter::new(
            "tandem_transactions_applied_total",
            "Transactions appended to history",
        )?;
        let empty_admissions = IntCounter::new(
            "tandem_empty_admissions_total",
            "Submissions that admitted nothing",
        )?;
        let transactions_rejected = IntCounter::new(
            "tandem_transactions_rejected_total",
            "Submitted transactions rejected as conflicting",
        )?;

        let broadcasts_sent = IntCounter::new("tandem_broadcasts_sent_total", "Broadcast messages forwarded to connections")?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(submissions_total.clone()))?;
        registry.register(Box::new(transactions_applied.clone()))?;
        registry.register(Box::new(empty_admissions.clone()))?;
        registry.register(Box::new(transactions_rejected.clone()))?;
        registry.register(Box::new(broadcasts_sent.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            messages_total,
            errors_total,
            submissions_total,
            transactions_applied,
            empty_admissions,
            transactions_rejected,
            broadcasts_sent,
        })
    }

    /// Record a new connection
    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Record a connection closed
    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    pub fn record_message(&self, kind: &str) {
        self.messages_total.with_label_values(&[kind]).inc();
    }

    pub fn record_error(&self, code: &str) {
        self.errors_total.with_label_values(&[code]).inc();
    }

    /// Record the outcome of one submission
    pub fn record_submission(&self, applied: usize, rejected: usize) {
        self.submissions_total.inc();
        if applied == 0 {
            self.empty_admissions.inc();
        }
        self.transactions_applied.inc_by(applied as u64);
        self.transactions_rejected.inc_by(rejected as u64);
    }

    pub fn record_broadcast(&self) {
        self.broadcasts_sent.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    /// Run the metrics HTTP server
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let Ok(n) = stream.read(&mut buf).await else {
                            return;
                        };
                        let request = String::from_utf8_lossy(&buf[..n]);

                        let response = if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
                            let body = metrics.export();
                            format!(
                                "HTTP/1.1 200 OK\r\n\
                                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                                 Content-Length: {}\r\n\
                                 \r\n\
                                 {}",
                                body.len(),
                                body
                            )
                        } else if request.starts_with("GET /health") {
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
                        } else {
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
                        };
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}
