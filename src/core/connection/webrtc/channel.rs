//! Data channel wrapper: handlers are installed once, at construction.

use crate::core::config::SCTP_MAX_FRAGMENT;
use crate::core::connection::{DataChannel, LinkEvent};
use crate::core::protocol::ChannelMessage;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl WebRtcChannel {
    /// Wrap `dc` and route its lifecycle into `events`.
    ///
    /// `ChannelOpen` is reported exactly once, whether the channel opens
    /// later or is already open when wrapped. The caller keeps the returned
    /// handle alive for as long as the channel is in use.
    pub fn attach(dc: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<LinkEvent>) -> Arc<Self> {
        let label = dc.label().to_string();
        let channel = Arc::new(Self {
            dc: dc.clone(),
            label: label.clone(),
        });
        let announced = Arc::new(AtomicBool::new(false));

        // Weak: the data channel owns its handlers.
        let tx = events.clone();
        let ch = Arc::downgrade(&channel);
        let flag = announced.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            let ch = ch.clone();
            let flag = flag.clone();
            Box::pin(async move {
                if let Some(ch) = ch.upgrade() {
                    announce_open(&ch, &flag, &tx);
                }
            })
        }));

        let tx = events.clone();
        let lbl = label.clone();
        dc.on_close(Box::new(move || {
            let tx = tx.clone();
            let lbl = lbl.clone();
            Box::pin(async move {
                warn!(event = "dc_closed", channel = %lbl, "DataChannel closed by transport");
                let _ = tx.send(LinkEvent::ChannelClosed);
            })
        }));

        let lbl = label.clone();
        dc.on_error(Box::new(move |err| {
            let lbl = lbl.clone();
            Box::pin(async move {
                error!(event = "dc_error", channel = %lbl, %err, "DataChannel transport error");
            })
        }));

        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                let message = if msg.is_string {
                    ChannelMessage::Text(String::from_utf8_lossy(&msg.data).into_owned())
                } else {
                    ChannelMessage::Binary(msg.data)
                };
                let _ = tx.send(LinkEvent::ChannelMessage(message));
            })
        }));

        if channel.is_open() {
            announce_open(&channel, &announced, &events);
        }
        channel
    }
}

fn announce_open(
    channel: &Arc<WebRtcChannel>,
    announced: &AtomicBool,
    events: &mpsc::UnboundedSender<LinkEvent>,
) {
    if announced.swap(true, Ordering::AcqRel) {
        return;
    }
    debug!(event = "dc_open", channel = %channel.label, "DataChannel open");
    let _ = events.send(LinkEvent::ChannelOpen(channel.clone()));
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn send(&self, msg: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!(
                "DataChannel '{}' not open: {:?}",
                self.label,
                self.dc.ready_state()
            ));
        }
        match msg {
            ChannelMessage::Text(text) => {
                self.dc.send_text(text).await?;
            }
            // Binary frames carry no header, so splitting them is invisible
            // to the receiver while keeping every SCTP message small.
            ChannelMessage::Binary(data) => {
                for piece in fragments(data) {
                    self.dc.send(&piece).await?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

fn fragments(data: Bytes) -> Vec<Bytes> {
    if data.len() <= SCTP_MAX_FRAGMENT {
        return vec![data];
    }
    let mut out = Vec::with_capacity(data.len().div_ceil(SCTP_MAX_FRAGMENT));
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + SCTP_MAX_FRAGMENT).min(data.len());
        out.push(data.slice(offset..end));
        offset = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_preserve_bytes() {
        let data: Vec<u8> = (0..(SCTP_MAX_FRAGMENT * 2 + 17)).map(|i| i as u8).collect();
        let pieces = fragments(Bytes::from(data.clone()));
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.len() <= SCTP_MAX_FRAGMENT));
        assert_eq!(pieces.concat(), data);
    }

    #[test]
    fn small_payload_is_not_split() {
        assert_eq!(fragments(Bytes::from_static(b"abc")).len(), 1);
        assert_eq!(fragments(Bytes::new()).len(), 1);
    }
}
