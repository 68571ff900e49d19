//! Tandem Transport Layer
//!
//! Provides the server side of the sync protocol:
//! - Session: authentication, history replay and event routing per document
//! - WebSocket: Browser-compatible transport
//! - Loopback: In-process connections over channels
//! - Metrics: Prometheus metrics (optional feature)

pub mod error;
pub mod handler;
pub mod loopback;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod session;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use error::{TransportError, TransportResult};
pub use handler::{ConnectionHandler, Outcome};
pub use loopback::{LoopbackConnection, LoopbackServer};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use session::{SessionContext, SessionOrchestrator, Submitted, Welcome};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketServer;
