//! webrtc-rs backed peer links.
//!
//! - Trickle ICE: local candidates are reported as they are gathered, no
//!   waiting for gathering to complete.
//! - One ordered, reliable data channel per link.
//! - Descriptions travel as `{"type":"offer"|"answer","sdp":..}` and
//!   candidates as `RTCIceCandidateInit` JSON, the shape browsers use.

mod channel;
mod initializer;

pub use channel::WebRtcChannel;

use crate::core::connection::{DataChannel, LinkEvent, LinkFactory, PeerLink};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type ChannelSlot = Arc<Mutex<Option<Arc<WebRtcChannel>>>>;

pub struct WebRtcFactory {
    api: webrtc::api::API,
}

impl WebRtcFactory {
    pub fn new() -> Result<Self> {
        Ok(Self {
            api: initializer::create_webrtc_api()?,
        })
    }
}

#[async_trait]
impl LinkFactory for WebRtcFactory {
    async fn create_link(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration {
                    ice_servers: initializer::default_ice_servers(),
                    ..Default::default()
                })
                .await?,
        );
        initializer::attach_pc_handlers(&pc, events.clone());

        let slot: ChannelSlot = Arc::new(Mutex::new(None));

        // Responder side: the channel arrives from the remote peer.
        let tx = events.clone();
        let incoming = slot.clone();
        pc.on_data_channel(Box::new(move |dc| {
            let tx = tx.clone();
            let incoming = incoming.clone();
            Box::pin(async move {
                debug!(event = "dc_incoming", channel = %dc.label(), "Remote opened a data channel");
                let channel = WebRtcChannel::attach(dc, tx);
                store(&incoming, channel);
            })
        }));

        Ok(Arc::new(WebRtcLink { pc, events, slot }))
    }
}

fn store(slot: &ChannelSlot, channel: Arc<WebRtcChannel>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(channel);
    }
}

pub struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
    slot: ChannelSlot,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        // Explicit ordered + fully reliable (SCTP default, no partial reliability).
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        store(&self.slot, WebRtcChannel::attach(dc, self.events.clone()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(serde_json::to_value(offer)?)
    }

    async fn create_answer(&self) -> Result<Value> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(serde_json::to_value(answer)?)
    }

    async fn set_remote_description(&self, description: Value) -> Result<()> {
        let desc: RTCSessionDescription = serde_json::from_value(description)?;
        self.pc.set_remote_description(desc).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)?;
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channel = self.slot.lock().ok().and_then(|mut g| g.take());
        if let Some(channel) = channel {
            let _ = channel.close().await;
        }
        self.pc.close().await?;
        Ok(())
    }
}
