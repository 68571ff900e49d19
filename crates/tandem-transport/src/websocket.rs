//! WebSocket transport for Tandem

use crate::error::TransportError;
use crate::handler::ConnectionHandler;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::session::SessionOrchestrator;
use bytes::Bytes;
use futures_util::future::ready;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::Frame;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{error, info, warn};

/// WebSocket Server for Tandem
pub struct WebSocketServer {
    session: Arc<SessionOrchestrator>,
    addr: SocketAddr,
    client_counter: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl WebSocketServer {
    pub fn new(session: Arc<SessionOrchestrator>, addr: SocketAddr) -> Self {
        Self {
            session,
            addr,
            client_counter: AtomicU64::new(0),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), TransportError> {
        info!(addr = %listener.local_addr()?, "Tandem WebSocket server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let client_id = format!(
                        "ws:{}:{}",
                        peer_addr,
                        self.client_counter.fetch_add(1, Ordering::Relaxed)
                    );
                    let handler = ConnectionHandler::new(client_id.clone(), self.session.clone());
                    #[cfg(feature = "metrics")]
                    let handler = match &self.metrics {
                        Some(metrics) => handler.with_metrics(metrics.clone()),
                        None => handler,
                    };
                    #[cfg(feature = "metrics")]
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = &metrics {
                            metrics.record_connection();
                        }

                        if let Err(e) = Self::handle_connection(stream, handler).await {
                            error!(client = %client_id, error = %e, "WebSocket connection error");
                        }

                        #[cfg(feature = "metrics")]
                        if let Some(metrics) = &metrics {
                            metrics.record_disconnection();
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(stream: TcpStream, handler: ConnectionHandler) -> Result<(), TransportError> {
        let ws_stream = accept_async(stream).await?;
        let client_id = handler.client_id.clone();
        info!(client = %client_id, "WebSocket client connected");

        let (write, read) = ws_stream.split();

        let incoming = read
            .take_while(move |msg| {
                let open = match msg {
                    Ok(Message::Close(_)) => false,
                    Ok(_) => true,
                    Err(e) => {
                        warn!(client = %client_id, error = %e, "WebSocket read error");
                        false
                    }
                };
                ready(open)
            })
            .filter_map(|msg| {
                ready(match msg {
                    Ok(Message::Text(text)) => Some(Frame::Text(text)),
                    Ok(Message::Binary(data)) => Some(Frame::Binary(Bytes::from(data))),
                    _ => None,
                })
            });

        let outgoing = write.with(|frame: Frame| {
            ready(Ok::<_, TransportError>(match frame {
                Frame::Text(text) => Message::Text(text),
                Frame::Binary(data) => Message::Binary(data.to_vec()),
            }))
        });

        let client_id = handler.client_id.clone();
        handler.run(incoming, outgoing).await?;
        info!(client = %client_id, "WebSocket client disconnected");
        Ok(())
    }
}
