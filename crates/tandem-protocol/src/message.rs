//! Messages exchanged between clients and the session server

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tandem_core::change::author_keys;
use tandem_core::{AuthorData, AuthorId, AuthorPatch, Change, DocumentName};

/// Error codes carried by [`ServerMessage::Error`]
pub mod codes {
    pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
    pub const MALFORMED: &str = "MALFORMED";
    pub const NOT_JOINED: &str = "NOT_JOINED";
    pub const STORAGE: &str = "STORAGE";
    pub const LAGGED: &str = "LAGGED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Identity assigned to the connection
    Registered {
        server_id: String,
        author_id: AuthorId,
        token: String,
    },

    /// Committed history and active authors at join time
    InitDoc {
        history: Change,
        #[serde(with = "author_keys")]
        authors: BTreeMap<AuthorId, AuthorData>,
    },

    /// A change appended to the authoritative history
    NewChange { change: Change },

    AuthorChange {
        author_id: AuthorId,
        author: AuthorData,
    },

    AuthorDisconnect { author_id: AuthorId },

    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::error(codes::MALFORMED, msg.to_string())
    }

    /// Message name, for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Registered { .. } => "registered",
            ServerMessage::InitDoc { .. } => "init_doc",
            ServerMessage::NewChange { .. } => "new_change",
            ServerMessage::AuthorChange { .. } => "author_change",
            ServerMessage::AuthorDisconnect { .. } => "author_disconnect",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a session on a document, optionally resuming an identity
    Join {
        doc: DocumentName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author_id: Option<AuthorId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        /// History offset the client already holds
        #[serde(default)]
        start_length: usize,
    },

    SubmitChange { backtrack: usize, change: Change },

    ChangeAuthor(AuthorPatch),

    /// Client-side log record forwarded to the server log
    LogEvent {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl ClientMessage {
    pub fn join(doc: DocumentName) -> Self {
        ClientMessage::Join {
            doc,
            author_id: None,
            token: None,
            start_length: 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::SubmitChange { .. } => "submit_change",
            ClientMessage::ChangeAuthor(_) => "change_author",
            ClientMessage::LogEvent { .. } => "log_event",
        }
    }
}
