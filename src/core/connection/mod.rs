//! Peer link abstraction.
//!
//! The session layer drives links and channels only through these traits;
//! [`webrtc`] backs them with webrtc-rs. Everything a link observes
//! (local candidates, state changes, channel lifecycle, inbound messages)
//! is reported as a [`LinkEvent`] on the sender handed to
//! [`LinkFactory::create_link`].

pub mod webrtc;

#[cfg(test)]
pub mod memory;

use crate::core::protocol::ChannelMessage;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum LinkEvent {
    /// A local candidate to trickle to the remote side.
    LocalCandidate(Value),
    StateChanged(LinkState),
    /// The data channel is open and ready to carry frames. Reported once
    /// per channel, on both the initiating and the accepting side.
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(ChannelMessage),
    ChannelClosed,
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            Self::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            Self::ChannelOpen(dc) => f.debug_tuple("ChannelOpen").field(&dc.label()).finish(),
            Self::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(&m.payload_len()).finish(),
            Self::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

/// An ordered, reliable message channel to one peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Bytes queued by the transport but not yet sent.
    async fn buffered_amount(&self) -> usize;
    async fn send(&self, msg: ChannelMessage) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// A direct connection to one remote device.
///
/// Descriptions and candidates travel as opaque JSON through signaling.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create the data channel (initiator only). It is reported through
    /// [`LinkEvent::ChannelOpen`] once usable.
    async fn open_data_channel(&self, label: &str) -> Result<()>;
    /// Create an offer and set it as the local description.
    async fn create_offer(&self) -> Result<Value>;
    /// Create an answer and set it as the local description.
    async fn create_answer(&self) -> Result<Value>;
    async fn set_remote_description(&self, description: Value) -> Result<()>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: Value) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create_link(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>>;
}
