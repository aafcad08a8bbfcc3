//! Relay wire protocol: JSON text frames over a WebSocket.
//!
//! Client -> server: [`ClientFrame`] (`join`, `signal`).
//! Server -> client: [`ServerFrame`] (`peers-sync`, `peer-joined`,
//! `peer-left`, `signal`, `signal-error`).
//!
//! Field names are camelCase and the `type` tag is kebab-case so browser
//! peers speaking the same protocol interoperate.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Presence ─────────────────────────────────────────────────────────────────

/// A device as advertised in a room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub color: String,
}

// ── Signaling ────────────────────────────────────────────────────────────────

/// Kind of connection-setup payload carried by a `signal` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalType {
    Offer,
    Answer,
    IceCandidate,
}

/// A `signal` frame. The relay never looks inside `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalFrame {
    pub room_id: String,
    pub from: String,
    pub to: String,
    pub signal_type: SignalType,
    #[serde(default)]
    pub payload: Value,
}

/// Reason attached to a `signal-error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalErrorReason {
    TargetNotFound,
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Frames sent by a peer to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Enter a room. Missing fields decode as empty strings so the relay can
    /// reject them by validation instead of by parse failure.
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(default)]
        room_id: String,
        #[serde(flatten)]
        device: Device,
    },
    Signal(SignalFrame),
}

/// Frames sent by the relay to a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    PeersSync { room_id: String, peers: Vec<Device> },
    #[serde(rename_all = "camelCase")]
    PeerJoined { room_id: String, peer: Device },
    #[serde(rename_all = "camelCase")]
    PeerLeft { room_id: String, device_id: String },
    Signal(SignalFrame),
    #[serde(rename_all = "camelCase")]
    SignalError {
        reason: SignalErrorReason,
        to: String,
        signal_type: SignalType,
    },
}

impl ClientFrame {
    /// Decode a text frame; `None` for anything malformed or unknown.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerFrame {
    /// Decode a text frame; `None` for anything malformed or unknown.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
