//! Tandem wire protocol
//!
//! Messages are tagged by a `type` field in snake_case.
//!
//! ## Server to client
//! ```text
//! registered         { server_id, author_id, token }
//! init_doc           { history, authors }
//! new_change         { change }
//! author_change      { author_id, author }
//! author_disconnect  { author_id }
//! error              { code, message }
//! ```
//!
//! ## Client to server
//! ```text
//! join               { doc, author_id?, token?, start_length }
//! submit_change      { backtrack, change }
//! change_author      { name?, color? }
//! log_event          { event, data }
//! ```
//!
//! Text frames carry JSON, binary frames carry MessagePack.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{Codec, Frame, MAX_FRAME_SIZE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{codes, ClientMessage, ServerMessage};
