//! Signaling relay.
//!
//! A single actor task owns the [`Relay`] state machine (and through it the
//! [`RoomRegistry`]). Connection tasks never touch room state; they report
//! [`RelayEvent`]s over an mpsc channel and drain their own outbox.
//!
//! The relay never inspects `signal` payloads: a forwarded frame is the exact
//! text the sender wrote.

pub mod registry;
pub mod server;

pub use registry::{ConnId, RoomRegistry};
pub use server::serve;

use crate::core::protocol::{ClientFrame, Device, ServerFrame, SignalErrorReason, SignalFrame};
use crate::utils::sos::SignalOfStop;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Input of the relay actor.
#[derive(Debug)]
pub enum RelayEvent {
    /// A WebSocket finished its handshake; `outbox` receives text frames for it.
    Connected {
        conn: ConnId,
        outbox: mpsc::UnboundedSender<String>,
    },
    /// A text frame arrived on `conn`.
    Frame { conn: ConnId, text: String },
    /// `conn` is gone (close frame, error or end of stream).
    Disconnected { conn: ConnId },
}

/// Relay state machine. Pure: every effect is a push into an outbox.
#[derive(Default)]
pub struct Relay {
    registry: RoomRegistry,
    outboxes: HashMap<ConnId, mpsc::UnboundedSender<String>>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected { conn, outbox } => {
                debug!(event = "relay_conn_open", conn, "Connection registered");
                self.outboxes.insert(conn, outbox);
            }
            RelayEvent::Frame { conn, text } => self.on_frame(conn, &text),
            RelayEvent::Disconnected { conn } => self.on_disconnect(conn),
        }
    }

    fn on_frame(&mut self, conn: ConnId, text: &str) {
        match ClientFrame::parse(text) {
            Some(ClientFrame::Join { room_id, device }) => self.on_join(conn, room_id, device),
            Some(ClientFrame::Signal(signal)) => self.on_signal(conn, signal, text),
            None => {
                debug!(event = "relay_frame_ignored", conn, "Ignoring unrecognized frame");
            }
        }
    }

    fn on_join(&mut self, conn: ConnId, room_id: String, device: Device) {
        if room_id.is_empty() || device.device_id.is_empty() {
            debug!(event = "relay_join_invalid", conn, "Dropping join without roomId/deviceId");
            return;
        }

        let joined = device.clone();
        let (peers, departed) = self.registry.join(&room_id, conn, device);

        if let Some((old_room, old_device)) = departed {
            self.announce_departure(&old_room, &old_device);
        }

        info!(
            event = "relay_join",
            conn,
            room = %room_id,
            device = %joined.device_id,
            peers = peers.len(),
            "Device joined room"
        );

        self.send_frame(
            conn,
            &ServerFrame::PeersSync {
                room_id: room_id.clone(),
                peers,
            },
        );

        let announce = ServerFrame::PeerJoined {
            room_id: room_id.clone(),
            peer: joined,
        };
        for other in self.registry.members(&room_id) {
            if other != conn {
                self.send_frame(other, &announce);
            }
        }
    }

    fn on_signal(&mut self, conn: ConnId, signal: SignalFrame, raw: &str) {
        // Only a socket joined as `from` in `roomId` may signal on its behalf.
        if self.registry.binding(conn) != Some((signal.room_id.as_str(), signal.from.as_str())) {
            debug!(
                event = "relay_signal_unbound",
                conn,
                room = %signal.room_id,
                from = %signal.from,
                "Dropping signal from a socket not joined as its sender"
            );
            return;
        }

        let targets = self.registry.lookup(&signal.room_id, &signal.to);

        if targets.is_empty() {
            debug!(
                event = "relay_signal_target_missing",
                conn,
                room = %signal.room_id,
                to = %signal.to,
                "Signal target not in room"
            );
            self.send_frame(
                conn,
                &ServerFrame::SignalError {
                    reason: SignalErrorReason::TargetNotFound,
                    to: signal.to,
                    signal_type: signal.signal_type,
                },
            );
            return;
        }

        debug!(
            event = "relay_signal_forward",
            from = %signal.from,
            to = %signal.to,
            signal_type = ?signal.signal_type,
            "Forwarding signal"
        );
        for target in targets {
            self.send_text(target, raw.to_string());
        }
    }

    fn on_disconnect(&mut self, conn: ConnId) {
        self.outboxes.remove(&conn);
        if let Some((room_id, device_id)) = self.registry.leave(conn) {
            info!(
                event = "relay_leave",
                conn,
                room = %room_id,
                device = %device_id,
                "Device left room"
            );
            self.announce_departure(&room_id, &device_id);
        } else {
            debug!(event = "relay_conn_closed", conn, "Connection closed");
        }
    }

    fn announce_departure(&mut self, room_id: &str, device_id: &str) {
        let frame = ServerFrame::PeerLeft {
            room_id: room_id.to_string(),
            device_id: device_id.to_string(),
        };
        for member in self.registry.members(room_id) {
            self.send_frame(member, &frame);
        }
    }

    fn send_frame(&mut self, conn: ConnId, frame: &ServerFrame) {
        match frame.to_text() {
            Ok(text) => self.send_text(conn, text),
            Err(e) => warn!(event = "relay_encode_failure", error = %e, "Failed to encode frame"),
        }
    }

    fn send_text(&mut self, conn: ConnId, text: String) {
        if let Some(outbox) = self.outboxes.get(&conn) {
            if outbox.send(text).is_err() {
                // Writer is gone; the Disconnected event will clean up.
                debug!(event = "relay_outbox_closed", conn, "Outbox closed");
            }
        }
    }
}

// ── Actor ────────────────────────────────────────────────────────────────────

/// Cloneable sender side of the relay actor.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayHandle {
    /// Returns `false` once the actor has stopped.
    pub fn send(&self, event: RelayEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Spawn the actor that owns a fresh [`Relay`]. It stops when `sos` is
/// cancelled or every handle has been dropped.
pub fn spawn_relay(sos: SignalOfStop) -> RelayHandle {
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut relay = Relay::new();
        while let Some(Some(event)) = sos.select(rx.recv()).await {
            relay.handle(event);
        }
        debug!(
            event = "relay_actor_stopped",
            rooms = relay.registry().room_count(),
            "Relay actor stopped"
        );
    });
    RelayHandle { tx }
}
