//! WebRTC API construction and connection-state plumbing.

use crate::core::config::{SCTP_USE_LOOPBACK, STUN_SERVERS};
use crate::core::connection::{LinkEvent, LinkState};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;

pub(crate) fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![RTCIceServer {
        urls: STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }]
}

pub(crate) fn create_webrtc_api() -> Result<webrtc::api::API> {
    let mut me = MediaEngine::default();
    let reg = register_default_interceptors(Registry::new(), &mut me)?;

    let mut se = SettingEngine::default();
    se.set_include_loopback_candidate(SCTP_USE_LOOPBACK);

    Ok(APIBuilder::new()
        .with_setting_engine(se)
        .with_media_engine(me)
        .with_interceptor_registry(reg)
        .build())
}

pub(crate) fn map_state(s: RTCPeerConnectionState) -> LinkState {
    match s {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

/// Report connection-state changes and trickled local candidates.
pub(crate) fn attach_pc_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        let tx = tx.clone();
        Box::pin(async move {
            match s {
                RTCPeerConnectionState::Connected => {
                    info!(event = "webrtc_connected", "WebRTC connection established");
                }
                RTCPeerConnectionState::Failed => {
                    error!(event = "webrtc_failed", "WebRTC connection failed");
                }
                RTCPeerConnectionState::Disconnected => {
                    warn!(
                        event = "webrtc_disconnected",
                        "WebRTC transient disconnect (ICE may recover)"
                    );
                }
                RTCPeerConnectionState::Closed => {
                    info!(event = "webrtc_closed", "WebRTC connection closed");
                }
                _ => {}
            }
            let _ = tx.send(LinkEvent::StateChanged(map_state(s)));
        })
    }));

    let tx = events;
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering; nothing to trickle.
            let Some(candidate) = candidate else { return };
            let encoded = candidate
                .to_json()
                .map_err(anyhow::Error::from)
                .and_then(|init| Ok(serde_json::to_value(init)?));
            match encoded {
                Ok(value) => {
                    let _ = tx.send(LinkEvent::LocalCandidate(value));
                }
                Err(e) => {
                    debug!(event = "ice_candidate_encode_failure", error = %e, "Failed to encode candidate");
                }
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_mapping_covers_terminal_states() {
        assert_eq!(map_state(RTCPeerConnectionState::Failed), LinkState::Failed);
        assert_eq!(map_state(RTCPeerConnectionState::Closed), LinkState::Closed);
        assert_eq!(map_state(RTCPeerConnectionState::Connected), LinkState::Connected);
    }

    #[test]
    fn ice_servers_from_config() {
        let servers = default_ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), STUN_SERVERS.len());
    }
}
