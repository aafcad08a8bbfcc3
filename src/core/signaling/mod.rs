//! Signaling connection manager.
//!
//! Keeps one logical WebSocket connection to the relay for the local
//! identity. A background session task connects, sends `join`, reads
//! server frames and reconnects with exponential backoff after unexpected
//! closures. Consumers receive [`SignalingEvent`]s, state changes
//! included, on an mpsc channel.
//!
//! Every session carries a generation number; a session that has been
//! replaced (identity change) or stopped (`close`) can no longer touch the
//! shared state even if it is still winding down.

pub mod backoff;
pub mod directory;

pub use backoff::Backoff;
pub use directory::{Dispatch, PeerDirectory};

use crate::core::protocol::{ClientFrame, Device, ServerFrame, SignalFrame, SignalType};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

/// Who we are and where we join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub room_id: String,
    pub device: Device,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Full peer list after any presence change (self excluded).
    PeersChanged(Vec<Device>),
    /// A `signal` frame addressed to us, as received.
    Signal(SignalFrame),
    /// The relay could not deliver a signal we sent.
    SignalError { to: String, signal_type: SignalType },
    StateChanged(ConnectionState),
}

/// Outbound half of signaling, as needed by the session orchestrator.
pub trait SignalSink: Send + Sync {
    fn send_signal(&self, to: &str, signal_type: SignalType, payload: Value) -> Result<()>;
}

// ── Shared state ─────────────────────────────────────────────────────────────

struct Session {
    identity: Identity,
    sos: SignalOfStop,
}

struct Inner {
    state: ConnectionState,
    identity: Option<Identity>,
    connected_identity: Option<Identity>,
    directory: PeerDirectory,
    outbound: Option<mpsc::UnboundedSender<String>>,
    session: Option<Session>,
    generation: u64,
}

struct Shared {
    url: String,
    sos: SignalOfStop,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        inner.state = state;
        self.state_tx.send_replace(state);
        self.emit(SignalingEvent::StateChanged(state));
    }

    /// Run `f` only if session `generation` is still the live one.
    fn with_session(&self, generation: u64, f: impl FnOnce(&mut Inner)) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.session.is_none() {
            return false;
        }
        f(&mut inner);
        true
    }

    fn dispatch(&self, generation: u64, text: &str) -> bool {
        let Some(frame) = ServerFrame::parse(text) else {
            debug!(event = "signaling_frame_ignored", "Ignoring unrecognized server frame");
            return true;
        };
        self.with_session(generation, |inner| {
            let event = match inner.directory.apply(frame) {
                Dispatch::Peers(peers) => SignalingEvent::PeersChanged(peers),
                Dispatch::Signal(signal) => SignalingEvent::Signal(signal),
                Dispatch::SignalError { to, signal_type } => {
                    SignalingEvent::SignalError { to, signal_type }
                }
            };
            self.emit(event);
        })
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

/// Handle to the signaling connection. Cheap to clone.
#[derive(Clone)]
pub struct SignalingManager {
    shared: Arc<Shared>,
}

impl SignalingManager {
    /// Create a manager for the relay at `url`. Nothing connects until an
    /// identity is set.
    pub fn new(
        url: impl Into<String>,
        sos: SignalOfStop,
        events: mpsc::UnboundedSender<SignalingEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                sos,
                events,
                state_tx,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Closed,
                    identity: None,
                    connected_identity: None,
                    directory: PeerDirectory::default(),
                    outbound: None,
                    session: None,
                    generation: 0,
                }),
            }),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    #[cfg(test)]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    #[cfg(test)]
    pub fn peers(&self) -> Vec<Device> {
        self.shared.lock().directory.peers().to_vec()
    }

    /// Set the identity to join with.
    ///
    /// Reconnects only if `identity` differs from the one the live session
    /// (or, without one, the last successful connection) used.
    pub fn set_identity(&self, identity: Identity) {
        let mut inner = self.shared.lock();
        inner.identity = Some(identity.clone());

        match &inner.session {
            Some(session) if session.identity == identity => return,
            Some(_) => {
                info!(
                    event = "signaling_identity_changed",
                    room = %identity.room_id,
                    "Identity changed, reconnecting"
                );
                self.stop_session(&mut inner);
            }
            None if inner.connected_identity.as_ref() == Some(&identity) => return,
            None => {}
        }
        self.start_session(&mut inner);
    }

    /// Open the connection with the current identity.
    ///
    /// No-op while a session is live (connecting, open, or waiting to retry).
    /// The peer worker connects through [`set_identity`](Self::set_identity).
    #[cfg(test)]
    pub fn connect(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.session.is_some() {
            debug!(event = "signaling_connect_noop", state = ?inner.state, "Session already live");
            return Ok(());
        }
        if inner.identity.is_none() {
            return Err(anyhow!("Cannot connect before an identity is set"));
        }
        self.start_session(&mut inner);
        Ok(())
    }

    /// Caller-initiated close: no reconnect, peer list cleared.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        self.stop_session(&mut inner);
        inner.directory.clear();
        self.shared.set_state(&mut inner, ConnectionState::Closed);
        self.shared.emit(SignalingEvent::PeersChanged(Vec::new()));
        info!(event = "signaling_closed", "Signaling connection closed by caller");
    }

    /// Start a session for the stored identity; nothing happens without one.
    fn start_session(&self, inner: &mut Inner) {
        let Some(identity) = inner.identity.clone() else {
            return;
        };
        inner.generation += 1;
        let generation = inner.generation;

        // Peers of a previous session are stale until the next peers-sync.
        if !inner.directory.peers().is_empty() {
            self.shared.emit(SignalingEvent::PeersChanged(Vec::new()));
        }
        inner.directory = PeerDirectory::new(identity.device.device_id.clone());

        let sos = self.shared.sos.child();
        inner.session = Some(Session {
            identity: identity.clone(),
            sos: sos.clone(),
        });
        self.shared.set_state(inner, ConnectionState::Connecting);

        tokio::spawn(run_session(self.shared.clone(), generation, identity, sos));
    }

    fn stop_session(&self, inner: &mut Inner) {
        if let Some(session) = inner.session.take() {
            session.sos.cancel();
        }
        inner.outbound = None;
        inner.generation += 1;
    }
}

impl SignalSink for SignalingManager {
    fn send_signal(&self, to: &str, signal_type: SignalType, payload: Value) -> Result<()> {
        let inner = self.shared.lock();
        let (Some(identity), Some(outbound)) = (&inner.connected_identity, &inner.outbound) else {
            return Err(anyhow!("Signaling connection is not open"));
        };
        let frame = ClientFrame::Signal(SignalFrame {
            room_id: identity.room_id.clone(),
            from: identity.device.device_id.clone(),
            to: to.to_string(),
            signal_type,
            payload,
        });
        outbound
            .send(frame.to_text()?)
            .map_err(|_| anyhow!("Signaling connection is not open"))
    }
}

// ── Session task ─────────────────────────────────────────────────────────────

enum Outcome {
    Cancelled,
    CleanClose,
    Lost,
}

async fn run_session(shared: Arc<Shared>, generation: u64, identity: Identity, sos: SignalOfStop) {
    let mut backoff = Backoff::default();

    loop {
        debug!(event = "signaling_connecting", url = %shared.url, "Connecting to relay");
        let outcome = match sos.select(connect_async(shared.url.as_str())).await {
            None => Outcome::Cancelled,
            Some(Err(e)) => {
                warn!(event = "signaling_connect_failure", url = %shared.url, error = %e, "Relay unreachable");
                Outcome::Lost
            }
            Some(Ok((ws, _))) => {
                run_socket(&shared, generation, &identity, &sos, ws, &mut backoff).await
            }
        };

        match outcome {
            Outcome::Cancelled => return,
            Outcome::CleanClose => {
                shared.with_session(generation, |inner| {
                    inner.session = None;
                    inner.outbound = None;
                    shared.set_state(inner, ConnectionState::Closed);
                });
                info!(event = "signaling_server_closed", "Relay closed the connection");
                return;
            }
            Outcome::Lost => {
                let live = shared.with_session(generation, |inner| {
                    inner.outbound = None;
                    shared.set_state(inner, ConnectionState::Error);
                });
                if !live {
                    return;
                }
            }
        }

        let delay = backoff.next_delay();
        info!(
            event = "signaling_reconnect_scheduled",
            delay_ms = delay.as_millis() as u64,
            "Reconnecting to relay"
        );
        if sos.select(tokio::time::sleep(delay)).await.is_none() {
            return;
        }
        if !shared.with_session(generation, |inner| {
            shared.set_state(inner, ConnectionState::Connecting)
        }) {
            return;
        }
    }
}

async fn send_text(ws_tx: &mut SplitSink<WsStream, Message>, text: String) -> bool {
    ws_tx.send(Message::Text(text)).await.is_ok()
}

async fn run_socket(
    shared: &Shared,
    generation: u64,
    identity: &Identity,
    sos: &SignalOfStop,
    ws: WsStream,
    backoff: &mut Backoff,
) -> Outcome {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let join = ClientFrame::Join {
        room_id: identity.room_id.clone(),
        device: identity.device.clone(),
    };
    let join = match join.to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!(event = "signaling_encode_failure", error = %e, "Failed to encode join");
            return Outcome::Lost;
        }
    };
    if !send_text(&mut ws_tx, join).await {
        return Outcome::Lost;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let opened = shared.with_session(generation, |inner| {
        inner.outbound = Some(out_tx);
        inner.connected_identity = Some(identity.clone());
        shared.set_state(inner, ConnectionState::Open);
    });
    if !opened {
        return Outcome::Cancelled;
    }
    backoff.reset();
    info!(
        event = "signaling_open",
        room = %identity.room_id,
        device = %identity.device.device_id,
        "Joined room on relay"
    );

    loop {
        tokio::select! {
            _ = sos.wait() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return Outcome::Cancelled;
            }
            Some(text) = out_rx.recv() => {
                if !send_text(&mut ws_tx, text).await {
                    return Outcome::Lost;
                }
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if !shared.dispatch(generation, &text) {
                        return Outcome::Cancelled;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let clean = frame.is_some_and(|f| f.code == CloseCode::Normal);
                    return if clean { Outcome::CleanClose } else { Outcome::Lost };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(event = "signaling_socket_error", error = %e, "Relay connection failed");
                    return Outcome::Lost;
                }
                None => return Outcome::Lost,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relay::serve;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn identity(room: &str, id: &str) -> Identity {
        Identity {
            room_id: room.into(),
            device: Device {
                device_id: id.into(),
                device_name: id.to_uppercase(),
                color: "#3b82f6".into(),
            },
        }
    }

    async fn start_relay() -> (String, SignalOfStop) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let sos = SignalOfStop::new();
        tokio::spawn(serve(listener, sos.clone()));
        (url, sos)
    }

    fn manager(url: &str) -> (SignalingManager, mpsc::UnboundedReceiver<SignalingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalingManager::new(url, SignalOfStop::new(), tx), rx)
    }

    async fn wait_for<F>(rx: &mut mpsc::UnboundedReceiver<SignalingEvent>, mut pred: F) -> SignalingEvent
    where
        F: FnMut(&SignalingEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let ev = rx.recv().await.expect("event channel open");
                if pred(&ev) {
                    return ev;
                }
            }
        })
        .await
        .expect("event in time")
    }

    fn peers_are(ids: &'static [&'static str]) -> impl FnMut(&SignalingEvent) -> bool {
        move |ev| match ev {
            SignalingEvent::PeersChanged(p) => {
                p.iter().map(|d| d.device_id.as_str()).collect::<Vec<_>>() == ids
            }
            _ => false,
        }
    }

    #[tokio::test]
    async fn peers_discover_each_other_and_exchange_signals() {
        let (url, relay) = start_relay().await;
        let (a, mut a_rx) = manager(&url);
        let (b, mut b_rx) = manager(&url);

        a.set_identity(identity("room", "a"));
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Open)).await;
        b.set_identity(identity("room", "b"));

        wait_for(&mut a_rx, peers_are(&["b"])).await;
        wait_for(&mut b_rx, peers_are(&["a"])).await;
        assert_eq!(a.peers().len(), 1);

        b.send_signal("a", SignalType::Offer, serde_json::json!({"sdp": "x"}))
            .unwrap();
        match wait_for(&mut a_rx, |e| matches!(e, SignalingEvent::Signal(_))).await {
            SignalingEvent::Signal(s) => {
                assert_eq!(s.from, "b");
                assert_eq!(s.signal_type, SignalType::Offer);
                assert_eq!(s.payload["sdp"], "x");
            }
            _ => unreachable!(),
        }

        b.send_signal("ghost", SignalType::IceCandidate, Value::Null).unwrap();
        let err = wait_for(&mut b_rx, |e| matches!(e, SignalingEvent::SignalError { .. })).await;
        assert_eq!(
            err,
            SignalingEvent::SignalError {
                to: "ghost".into(),
                signal_type: SignalType::IceCandidate
            }
        );

        b.close();
        wait_for(&mut a_rx, peers_are(&[])).await;
        relay.cancel();
    }

    #[tokio::test]
    async fn close_clears_peers_and_stays_closed() {
        let (url, relay) = start_relay().await;
        let (a, mut a_rx) = manager(&url);
        let (b, mut b_rx) = manager(&url);
        a.set_identity(identity("room", "a"));
        b.set_identity(identity("room", "b"));
        wait_for(&mut b_rx, peers_are(&["a"])).await;

        b.close();
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(b.peers().is_empty());
        assert!(b.send_signal("a", SignalType::Offer, Value::Null).is_err());
        wait_for(&mut a_rx, peers_are(&[])).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(b.state(), ConnectionState::Closed);
        relay.cancel();
    }

    #[tokio::test]
    async fn connect_is_a_noop_while_live() {
        let (url, relay) = start_relay().await;
        let (a, mut a_rx) = manager(&url);
        assert!(a.connect().is_err());

        a.set_identity(identity("room", "a"));
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Open)).await;
        a.connect().unwrap();
        a.set_identity(identity("room", "a"));
        assert_eq!(a.state(), ConnectionState::Open);
        relay.cancel();
    }

    #[tokio::test]
    async fn identity_change_leaves_old_room_and_joins_new() {
        let (url, relay) = start_relay().await;
        let (a, mut a_rx) = manager(&url);
        let (b, mut b_rx) = manager(&url);
        let (c, mut c_rx) = manager(&url);

        c.set_identity(identity("r2", "c"));
        wait_for(&mut c_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Open)).await;
        a.set_identity(identity("r1", "a"));
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Open)).await;
        b.set_identity(identity("r1", "b"));
        wait_for(&mut b_rx, peers_are(&["a"])).await;
        wait_for(&mut a_rx, peers_are(&["b"])).await;

        a.set_identity(identity("r2", "a"));
        // Stale r1 peers are dropped right away, then r2 is synced.
        wait_for(&mut a_rx, peers_are(&[])).await;
        wait_for(&mut a_rx, peers_are(&["c"])).await;
        wait_for(&mut b_rx, peers_are(&[])).await;
        wait_for(&mut c_rx, peers_are(&["a"])).await;

        assert_eq!(a.state(), ConnectionState::Open);
        assert_eq!(a.peers().len(), 1);
        assert!(b.peers().is_empty());
        relay.cancel();
    }

    #[tokio::test]
    async fn reconnects_after_relay_restart() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first = SignalOfStop::new();
        let server = tokio::spawn(serve(listener, first.clone()));

        let (a, mut a_rx) = manager(&format!("ws://{addr}"));
        let mut state = a.subscribe_state();
        a.set_identity(identity("room", "a"));
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Open)).await;

        first.cancel();
        server.await.unwrap().unwrap();
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Error)).await;

        let listener = TcpListener::bind(addr).await.unwrap();
        let second = SignalOfStop::new();
        tokio::spawn(serve(listener, second.clone()));

        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == ConnectionState::Open))
            .await
            .expect("reopened in time")
            .unwrap();
        second.cancel();
    }

    #[tokio::test]
    async fn clean_server_close_does_not_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _join = ws.next().await;
            let _ = ws
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "bye".into(),
                })))
                .await;
            // Keep the listener busy so any reconnect attempt would hang.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let (a, mut a_rx) = manager(&url);
        a.set_identity(identity("room", "a"));
        wait_for(&mut a_rx, |e| *e == SignalingEvent::StateChanged(ConnectionState::Closed)).await;
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(a.state(), ConnectionState::Closed);
    }
}
