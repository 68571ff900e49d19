//! Frame codecs: JSON text frames and MessagePack binary frames

use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// A transport-neutral frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The codec a peer used to produce this frame
    pub fn codec(&self) -> Codec {
        match self {
            Frame::Text(_) => Codec::Json,
            Frame::Binary(_) => Codec::MessagePack,
        }
    }
}

/// Wire encoding of messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
    MessagePack,
}

impl Codec {
    pub fn encode<T: Serialize>(&self, msg: &T) -> ProtocolResult<Frame> {
        match self {
            Codec::Json => Ok(Frame::Text(serde_json::to_string(msg)?)),
            // Named encoding keeps struct fields as map keys, which tagged enums need.
            Codec::MessagePack => Ok(Frame::Binary(Bytes::from(rmp_serde::to_vec_named(msg)?))),
        }
    }

    /// Decode a frame with the codec matching its kind
    pub fn decode<T: DeserializeOwned>(frame: &Frame) -> ProtocolResult<T> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        match frame {
            Frame::Text(text) => Ok(serde_json::from_str(text)?),
            Frame::Binary(data) => Ok(rmp_serde::from_slice(data)?),
        }
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MessagePack),
            _ => Err(format!("Unknown codec: {}", s)),
        }
    }
}
