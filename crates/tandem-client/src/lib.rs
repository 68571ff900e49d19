//! Tandem Client
//!
//! Client side of the sync protocol:
//! - Surface: local document, history and collaborator caches driven by the rebase engine
//! - Client: connection task with debounced submission over WebSocket or in-process channels

pub mod client;
pub mod error;
pub mod surface;

pub use client::{
    ChannelTransport, ClientConfig, ClientHandle, ClientTransport, Snapshot, SyncClient, DEFAULT_SUBMIT_DEBOUNCE,
};
#[cfg(feature = "websocket")]
pub use client::WebSocketTransport;
pub use error::{ClientError, ClientResult};
pub use surface::{SurfaceEvent, SurfaceSynchronizer};
