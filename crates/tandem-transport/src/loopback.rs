//! In-process transport: connections are a pair of channels served by the
//! same [`ConnectionHandler`] the network servers use.

use crate::error::TransportError;
use crate::handler::ConnectionHandler;
use crate::session::SessionOrchestrator;
use futures_util::{sink, stream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tandem_protocol::Frame;
use tokio::sync::mpsc;
use tracing::error;

/// Client end of a loopback connection
pub struct LoopbackConnection {
    /// Frames to the server; dropping it closes the connection
    pub sender: mpsc::UnboundedSender<Frame>,
    /// Frames from the server; yields `None` once the server side closed
    pub receiver: mpsc::UnboundedReceiver<Frame>,
}

/// Serves loopback connections against a session orchestrator
pub struct LoopbackServer {
    session: Arc<SessionOrchestrator>,
    client_counter: AtomicU64,
}

impl LoopbackServer {
    pub fn new(session: Arc<SessionOrchestrator>) -> Self {
        Self {
            session,
            client_counter: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &Arc<SessionOrchestrator> {
        &self.session
    }

    /// Open a connection served by a new task
    pub fn connect(&self) -> LoopbackConnection {
        let client_id = format!("loop:{}", self.client_counter.fetch_add(1, Ordering::Relaxed));
        let (to_server, from_client) = mpsc::unbounded_channel::<Frame>();
        let (to_client, from_server) = mpsc::unbounded_channel::<Frame>();

        let incoming = stream::unfold(from_client, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        });
        let outgoing = sink::unfold(to_client, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });

        let handler = ConnectionHandler::new(client_id.clone(), self.session.clone());
        tokio::spawn(async move {
            if let Err(e) = handler.run(incoming, outgoing).await {
                error!(client = %client_id, error = %e, "Loopback connection error");
            }
        });

        LoopbackConnection {
            sender: to_server,
            receiver: from_server,
        }
    }
}
