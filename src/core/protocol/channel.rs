//! Data-channel protocol.
//!
//! One channel per peer carries every transfer in both directions:
//!
//! ```text
//! text   {"type":"file-meta","id":..,"name":..,"size":..,"mimeType":..,"from":..}
//! binary <chunk bytes>            (repeated, in order)
//! text   {"type":"file-complete","id":..}
//! ```
//!
//! Binary frames carry no header; they belong to the most recently announced
//! transfer of that peer that has not yet received all of its bytes.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A raw message as delivered by (or handed to) the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    /// Payload size in bytes, as counted by the transport's send buffer.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }
}

/// Announcement sent once before the chunks of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub id: Uuid,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub from: String,
}

/// A decoded data-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    FileMeta(FileMeta),
    FileComplete { id: Uuid },
    Chunk(Bytes),
}

/// Text-frame encoding of the control variants.
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlWire {
    FileMeta(FileMeta),
    FileComplete { id: Uuid },
}

impl ChannelFrame {
    /// Decode a transport message. Text frames must be a known control frame;
    /// binary frames are always chunks.
    pub fn decode(msg: ChannelMessage) -> Result<Self> {
        match msg {
            ChannelMessage::Binary(data) => Ok(Self::Chunk(data)),
            ChannelMessage::Text(text) => {
                let wire: ControlWire = serde_json::from_str(&text)
                    .map_err(|e| anyhow!("Unrecognized control frame: {e}"))?;
                Ok(match wire {
                    ControlWire::FileMeta(meta) => Self::FileMeta(meta),
                    ControlWire::FileComplete { id } => Self::FileComplete { id },
                })
            }
        }
    }

    pub fn encode(&self) -> Result<ChannelMessage> {
        let wire = match self {
            Self::Chunk(data) => return Ok(ChannelMessage::Binary(data.clone())),
            Self::FileMeta(meta) => ControlWire::FileMeta(meta.clone()),
            Self::FileComplete { id } => ControlWire::FileComplete { id: *id },
        };
        Ok(ChannelMessage::Text(serde_json::to_string(&wire)?))
    }
}
