//! Peer session orchestrator.
//!
//! Turns presence and signaling into live links. One [`PeerSession`] per
//! discovered device:
//!
//! - The side with the smaller device id creates the link, opens the
//!   `file-transfer` channel and sends the offer.
//! - The other side creates its link when the offer arrives and answers.
//! - Local candidates trickle through signaling once our description has
//!   gone out; remote candidates are applied as they arrive.
//! - Every link reports through a [`LinkEvent`] pump task. Channel open and
//!   close are forwarded to the [`TransferEngine`], as are inbound messages.
//!
//! Link failure only marks the peer failed. Teardown happens when the peer
//! leaves the presence list, or when the relay reports it unreachable in
//! the middle of a handshake.

mod peer;

pub use peer::{should_initiate, PeerPhase, Role};

use crate::core::config::DATA_CHANNEL_LABEL;
use crate::core::connection::{LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::core::protocol::{Device, SignalFrame, SignalType};
use crate::core::signaling::{SignalSink, SignalingEvent};
use crate::core::transfer::TransferEngine;
use crate::utils::sos::SignalOfStop;
use anyhow::anyhow;
use peer::PeerSession;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct OrchestratorInner {
    local_id: String,
    factory: Arc<dyn LinkFactory>,
    signals: Arc<dyn SignalSink>,
    engine: TransferEngine,
    sos: SignalOfStop,
    sessions: Mutex<HashMap<String, PeerSession>>,
    generation: AtomicU64,
}

/// Cheap to clone; clones drive the same set of sessions.
#[derive(Clone)]
pub struct SessionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl SessionOrchestrator {
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn LinkFactory>,
        signals: Arc<dyn SignalSink>,
        engine: TransferEngine,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                local_id: local_id.into(),
                factory,
                signals,
                engine,
                sos,
                sessions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, PeerSession>> {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.inner.engine
    }

    #[cfg(test)]
    pub fn phase(&self, peer_id: &str) -> Option<PeerPhase> {
        self.sessions().get(peer_id).map(|s| s.phase)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    // ── Signaling input ──────────────────────────────────────────────────

    /// Events are handled one at a time, in arrival order.
    pub async fn handle_event(&self, event: SignalingEvent) {
        match event {
            SignalingEvent::PeersChanged(peers) => self.sync_peers(&peers).await,
            SignalingEvent::Signal(frame) => self.handle_signal(frame).await,
            SignalingEvent::SignalError { to, signal_type } => {
                self.handle_signal_error(&to, signal_type).await
            }
            SignalingEvent::StateChanged(state) => {
                debug!(event = "session_signaling_state", state = ?state, "Signaling state changed");
            }
        }
    }

    /// Reconcile sessions with the current presence list: start links we
    /// are due to initiate and tear down peers that are gone.
    pub async fn sync_peers(&self, peers: &[Device]) {
        let present: HashSet<&str> = peers.iter().map(|d| d.device_id.as_str()).collect();

        let gone: Vec<String> = self
            .sessions()
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();
        for peer_id in gone {
            self.teardown(&peer_id, "peer left").await;
            self.inner.engine.remove_peer(&peer_id);
        }

        for device in peers {
            let peer_id = device.device_id.as_str();
            if peer_id == self.inner.local_id || !should_initiate(&self.inner.local_id, peer_id) {
                continue;
            }
            let state = self
                .sessions()
                .get(peer_id)
                .map(|s| s.is_live());
            match state {
                Some(true) => continue,
                // A failed link is retried when the peer is announced again.
                Some(false) => self.teardown(peer_id, "restarting").await,
                None => {}
            }
            info!(
                event = "session_initiate",
                peer = %peer_id,
                name = %device.device_name,
                "Opening link to peer"
            );
            self.start_initiator(peer_id).await;
        }
    }

    /// Apply one `signal` frame addressed to us.
    pub async fn handle_signal(&self, frame: SignalFrame) {
        if frame.from == self.inner.local_id {
            return;
        }
        match frame.signal_type {
            SignalType::Offer => self.on_offer(&frame.from, frame.payload).await,
            SignalType::Answer => self.on_answer(&frame.from, frame.payload).await,
            SignalType::IceCandidate => self.on_remote_candidate(&frame.from, frame.payload).await,
        }
    }

    /// The relay could not reach `peer_id`. A handshake still in progress
    /// with it is abandoned.
    pub async fn handle_signal_error(&self, peer_id: &str, signal_type: SignalType) {
        let connecting = self
            .sessions()
            .get(peer_id)
            .is_some_and(|s| s.phase == PeerPhase::Connecting);
        warn!(
            event = "session_signal_undeliverable",
            peer = %peer_id,
            signal = ?signal_type,
            "Relay could not deliver signal"
        );
        if connecting {
            self.teardown(peer_id, "target not found").await;
            self.inner.engine.detach_channel(peer_id);
        }
    }

    /// Tear down every session, failing whatever is still owed to them.
    pub async fn shutdown(&self) {
        let peers = self.peer_ids();
        for peer_id in peers {
            self.teardown(&peer_id, "shutdown").await;
            self.inner.engine.remove_peer(&peer_id);
        }
    }

    // ── Handshake ────────────────────────────────────────────────────────

    /// Register a fresh session for `peer_id` and start its event pump.
    fn open_session(&self, peer_id: &str, role: Role) -> (u64, mpsc::UnboundedSender<LinkEvent>) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let sos = self.inner.sos.child();
        let (tx, rx) = mpsc::unbounded_channel();

        self.sessions().insert(
            peer_id.to_string(),
            PeerSession::new(generation, role, sos.clone()),
        );
        tokio::spawn(self.clone().pump(peer_id.to_string(), generation, rx, sos));
        (generation, tx)
    }

    async fn start_initiator(&self, peer_id: &str) {
        let (generation, events) = self.open_session(peer_id, Role::Initiator);
        let result = async {
            let link = self.inner.factory.create_link(events).await?;
            if !self.bind_link(peer_id, generation, &link) {
                let _ = link.close().await;
                return Ok(());
            }
            link.open_data_channel(DATA_CHANNEL_LABEL).await?;
            let offer = link.create_offer().await?;
            self.inner
                .signals
                .send_signal(peer_id, SignalType::Offer, offer)?;
            self.described(peer_id, generation);
            debug!(event = "session_offer_sent", peer = %peer_id, "Offer sent");
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            self.fail(peer_id, generation, &e);
        }
    }

    async fn on_offer(&self, peer_id: &str, offer: Value) {
        let existing = self.sessions().get(peer_id).map(|s| s.role);
        match existing {
            Some(Role::Initiator) => {
                warn!(event = "session_offer_unexpected", peer = %peer_id, "Ignoring offer from a peer we initiate to");
                return;
            }
            Some(Role::Responder) => {
                // The remote restarted its side.
                self.teardown(peer_id, "renegotiating").await;
                self.inner.engine.detach_channel(peer_id);
            }
            None => {}
        }
        info!(event = "session_offer_received", peer = %peer_id, "Answering peer");

        let (generation, events) = self.open_session(peer_id, Role::Responder);
        let result = async {
            let link = self.inner.factory.create_link(events).await?;
            if !self.bind_link(peer_id, generation, &link) {
                let _ = link.close().await;
                return Ok(());
            }
            link.set_remote_description(offer).await?;
            let answer = link.create_answer().await?;
            self.inner
                .signals
                .send_signal(peer_id, SignalType::Answer, answer)?;
            self.described(peer_id, generation);
            debug!(event = "session_answer_sent", peer = %peer_id, "Answer sent");
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            self.fail(peer_id, generation, &e);
        }
    }

    async fn on_answer(&self, peer_id: &str, answer: Value) {
        let Some(link) = self.link_of(peer_id) else {
            debug!(event = "session_answer_orphan", peer = %peer_id, "Answer without a session");
            return;
        };
        if link.has_remote_description().await {
            debug!(event = "session_answer_duplicate", peer = %peer_id, "Remote description already set");
            return;
        }
        if let Err(e) = link.set_remote_description(answer).await {
            let generation = self.sessions().get(peer_id).map(|s| s.generation);
            if let Some(generation) = generation {
                self.fail(peer_id, generation, &e);
            }
        }
    }

    async fn on_remote_candidate(&self, peer_id: &str, candidate: Value) {
        let Some(link) = self.link_of(peer_id) else {
            debug!(event = "session_candidate_orphan", peer = %peer_id, "Candidate without a session");
            return;
        };
        if let Err(e) = link.add_ice_candidate(candidate).await {
            debug!(event = "session_candidate_rejected", peer = %peer_id, error = %e, "Ignoring remote candidate");
        }
    }

    // ── Session bookkeeping ──────────────────────────────────────────────

    fn link_of(&self, peer_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.sessions().get(peer_id).and_then(|s| s.link.clone())
    }

    /// Store `link` in session `generation`; `false` if it was replaced meanwhile.
    fn bind_link(&self, peer_id: &str, generation: u64, link: &Arc<dyn PeerLink>) -> bool {
        match self.sessions().get_mut(peer_id) {
            Some(s) if s.generation == generation => {
                s.link = Some(link.clone());
                true
            }
            _ => false,
        }
    }

    /// Our description is out: release the candidates held back so far.
    fn described(&self, peer_id: &str, generation: u64) {
        let held = match self.sessions().get_mut(peer_id) {
            Some(s) if s.generation == generation => {
                s.described = true;
                std::mem::take(&mut s.held_candidates)
            }
            _ => return,
        };
        for candidate in held {
            self.send_candidate(peer_id, candidate);
        }
    }

    fn send_candidate(&self, peer_id: &str, candidate: Value) {
        if let Err(e) = self
            .inner
            .signals
            .send_signal(peer_id, SignalType::IceCandidate, candidate)
        {
            debug!(event = "session_candidate_unsent", peer = %peer_id, error = %e, "Failed to send candidate");
        }
    }

    fn set_phase(&self, peer_id: &str, generation: u64, phase: PeerPhase) -> bool {
        match self.sessions().get_mut(peer_id) {
            Some(s) if s.generation == generation && s.phase != phase => {
                s.phase = phase;
                true
            }
            _ => false,
        }
    }

    fn fail(&self, peer_id: &str, generation: u64, error: &anyhow::Error) {
        if self.set_phase(peer_id, generation, PeerPhase::Failed) {
            warn!(event = "session_failed", peer = %peer_id, error = %error, "Peer link failed");
        }
    }

    /// Remove the session for `peer_id` and close its link.
    async fn teardown(&self, peer_id: &str, reason: &str) {
        let Some(session) = self.sessions().remove(peer_id) else {
            return;
        };
        session.sos.cancel();
        if let Some(link) = session.link {
            if let Err(e) = link.close().await {
                debug!(event = "session_close_error", peer = %peer_id, error = %e, "Error closing link");
            }
        }
        info!(event = "session_closed", peer = %peer_id, reason, "Peer session closed");
    }

    // ── Link events ──────────────────────────────────────────────────────

    async fn pump(
        self,
        peer_id: String,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
        sos: SignalOfStop,
    ) {
        while let Some(Some(event)) = sos.select(events.recv()).await {
            if !self.is_current(&peer_id, generation) {
                break;
            }
            self.on_link_event(&peer_id, generation, event).await;
        }
        debug!(event = "session_pump_stopped", peer = %peer_id, generation, "Link event pump stopped");
    }

    fn is_current(&self, peer_id: &str, generation: u64) -> bool {
        self.sessions()
            .get(peer_id)
            .is_some_and(|s| s.generation == generation)
    }

    async fn on_link_event(&self, peer_id: &str, generation: u64, event: LinkEvent) {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let ready = match self.sessions().get_mut(peer_id) {
                    Some(s) if s.generation == generation => {
                        if s.described {
                            Some(candidate)
                        } else {
                            s.held_candidates.push(candidate);
                            None
                        }
                    }
                    _ => None,
                };
                if let Some(candidate) = ready {
                    self.send_candidate(peer_id, candidate);
                }
            }
            LinkEvent::StateChanged(state) => self.on_link_state(peer_id, generation, state),
            LinkEvent::ChannelOpen(channel) => {
                self.set_phase(peer_id, generation, PeerPhase::Connected);
                info!(event = "session_channel_open", peer = %peer_id, channel = %channel.label(), "Data channel open");
                self.inner.engine.attach_channel(peer_id, channel);
            }
            LinkEvent::ChannelMessage(msg) => {
                self.inner.engine.handle_message(peer_id, msg).await;
            }
            LinkEvent::ChannelClosed => {
                self.inner.engine.detach_channel(peer_id);
            }
        }
    }

    fn on_link_state(&self, peer_id: &str, generation: u64, state: LinkState) {
        match state {
            LinkState::Connected => {
                if self.set_phase(peer_id, generation, PeerPhase::Connected) {
                    info!(event = "session_connected", peer = %peer_id, "Peer link connected");
                }
            }
            LinkState::Failed => self.fail(peer_id, generation, &anyhow!("link failed")),
            LinkState::Closed => {
                self.set_phase(peer_id, generation, PeerPhase::Closed);
            }
            LinkState::Disconnected => {
                debug!(event = "session_disconnected", peer = %peer_id, "Peer link interrupted");
            }
            LinkState::New | LinkState::Connecting => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::memory::MemoryNetwork;
    use crate::core::transfer::{DirectoryDelivery, TransferEvent, TransferStatus};
    use anyhow::Result;
    use std::path::PathBuf;
    use std::time::Duration;

    fn device(id: &str) -> Device {
        Device {
            device_id: id.into(),
            device_name: format!("{id}-name"),
            color: "#00ff00".into(),
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("roomdrop_test")
            .join("session")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Records outbound signals.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, SignalType, Value)>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<(String, SignalType)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|(to, t, _)| (to.clone(), *t))
                .collect()
        }

        fn payload(&self, to: &str, signal_type: SignalType) -> Option<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .find(|(t, s, _)| t == to && *s == signal_type)
                .map(|(_, _, p)| p.clone())
        }
    }

    impl SignalSink for Recorder {
        fn send_signal(&self, to: &str, signal_type: SignalType, payload: Value) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), signal_type, payload));
            Ok(())
        }
    }

    /// Delivers signals straight to another orchestrator's inbox.
    struct Wire {
        from: String,
        tx: mpsc::UnboundedSender<SignalFrame>,
    }

    impl SignalSink for Wire {
        fn send_signal(&self, to: &str, signal_type: SignalType, payload: Value) -> Result<()> {
            self.tx
                .send(SignalFrame {
                    room_id: "room".into(),
                    from: self.from.clone(),
                    to: to.to_string(),
                    signal_type,
                    payload,
                })
                .map_err(|_| anyhow!("wire cut"))
        }
    }

    fn orchestrator(
        local: &str,
        net: &MemoryNetwork,
        signals: Arc<dyn SignalSink>,
        out: &std::path::Path,
    ) -> (SessionOrchestrator, mpsc::UnboundedReceiver<TransferEvent>) {
        let sos = SignalOfStop::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(
            local,
            Arc::new(DirectoryDelivery::new(out)),
            tx,
            sos.clone(),
        );
        let orch = SessionOrchestrator::new(local, Arc::new(net.clone()), signals, engine, sos);
        (orch, rx)
    }

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !pred() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn only_the_smaller_id_offers() {
        let dir = test_dir("offers");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("b", &net, rec.clone(), &dir);

        orch.sync_peers(&[device("a"), device("b"), device("c")]).await;

        assert_eq!(orch.peer_ids(), vec!["c".to_string()]);
        assert_eq!(orch.phase("c"), Some(PeerPhase::Connecting));
        wait_until(|| rec.sent().len() >= 2).await;
        let sent = rec.sent();
        assert_eq!(sent[0], ("c".to_string(), SignalType::Offer));
        // Candidates only follow the offer.
        assert!(sent[1..].iter().all(|s| s == &("c".to_string(), SignalType::IceCandidate)));

        // Re-announcing a live peer does not start a second link.
        orch.sync_peers(&[device("a"), device("c")]).await;
        assert_eq!(net.links().len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn two_peers_connect_and_transfer() {
        let dir = test_dir("end_to_end");
        let net = MemoryNetwork::new();

        let (alice_tx, alice_inbox) = mpsc::unbounded_channel::<SignalFrame>();
        let (bob_tx, bob_inbox) = mpsc::unbounded_channel::<SignalFrame>();
        let (alice, _alice_events) = orchestrator(
            "alice",
            &net,
            Arc::new(Wire { from: "alice".into(), tx: bob_tx }),
            &dir.join("alice_out"),
        );
        let (bob, mut bob_events) = orchestrator(
            "bob",
            &net,
            Arc::new(Wire { from: "bob".into(), tx: alice_tx }),
            &dir.join("bob_out"),
        );
        for (mut inbox, target) in [(alice_inbox, alice.clone()), (bob_inbox, bob.clone())] {
            tokio::spawn(async move {
                while let Some(frame) = inbox.recv().await {
                    target.handle_signal(frame).await;
                }
            });
        }

        // Queued before any link exists.
        let src = dir.join("photo.jpg");
        let data: Vec<u8> = (0..300_000).map(|i| (i % 199) as u8).collect();
        std::fs::write(&src, &data).unwrap();
        let id = alice.engine().send_file("bob", &src).await;
        assert_eq!(alice.engine().transfer(id).unwrap().status, TransferStatus::Queued);

        bob.sync_peers(&[device("alice")]).await;
        alice.sync_peers(&[device("bob")]).await;

        wait_until(|| {
            alice.phase("bob") == Some(PeerPhase::Connected)
                && bob.phase("alice") == Some(PeerPhase::Connected)
        })
        .await;
        let links = net.links();
        assert_eq!(links.len(), 2);
        wait_until(|| links.iter().all(|l| l.candidates_applied() >= 1)).await;

        let (received, path) = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if let Some(TransferEvent::Delivered { transfer, path }) = bob_events.recv().await {
                    return (transfer, path);
                }
            }
        })
        .await
        .expect("file delivered");
        assert_eq!(received.id, id);
        assert_eq!(received.peer_id, "alice");
        assert_eq!(std::fs::read(path).unwrap(), data);
        wait_until(|| alice.engine().transfer(id).unwrap().status == TransferStatus::Completed).await;

        // Presence pruning tears the link down.
        alice.sync_peers(&[]).await;
        assert_eq!(alice.phase("bob"), None);
        assert!(links[0].is_closed());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn signal_error_abandons_handshake() {
        let dir = test_dir("signal_error");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("a", &net, rec.clone(), &dir);

        orch.sync_peers(&[device("ghost")]).await;
        assert_eq!(orch.phase("ghost"), Some(PeerPhase::Connecting));

        orch.handle_signal_error("ghost", SignalType::Offer).await;
        assert_eq!(orch.phase("ghost"), None);
        assert!(net.links()[0].is_closed());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn offers_replace_responder_sessions_only() {
        let dir = test_dir("offers_replace");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("m", &net, rec.clone(), &dir);

        // An offer from a smaller id is answered.
        let frame = |from: &str, payload: Value| SignalFrame {
            room_id: "room".into(),
            from: from.into(),
            to: "m".into(),
            signal_type: SignalType::Offer,
            payload,
        };
        orch.handle_signal(frame("a", serde_json::json!({ "type": "offer", "link": 90 })))
            .await;
        assert_eq!(orch.phase("a"), Some(PeerPhase::Connecting));
        assert!(rec.payload("a", SignalType::Answer).is_some());

        // A second offer restarts that session.
        orch.handle_signal(frame("a", serde_json::json!({ "type": "offer", "link": 91 })))
            .await;
        let links = net.links();
        assert_eq!(links.len(), 2);
        assert!(links[0].is_closed());
        assert!(!links[1].is_closed());

        // An offer from a peer we initiate to is ignored.
        orch.sync_peers(&[device("a"), device("z")]).await;
        let before = net.links().len();
        orch.handle_signal(frame("z", serde_json::json!({ "type": "offer", "link": 92 })))
            .await;
        assert_eq!(net.links().len(), before);
        assert!(rec.payload("z", SignalType::Answer).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn bad_candidates_are_swallowed() {
        let dir = test_dir("bad_candidates");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("a", &net, rec, &dir);
        orch.sync_peers(&[device("b")]).await;

        let candidate = |payload: Value| SignalFrame {
            room_id: "room".into(),
            from: "b".into(),
            to: "a".into(),
            signal_type: SignalType::IceCandidate,
            payload,
        };
        orch.handle_signal(candidate(serde_json::json!({ "bogus": true }))).await;
        orch.handle_signal(candidate(serde_json::json!({ "candidate": "mem-x" }))).await;
        assert_eq!(orch.phase("b"), Some(PeerPhase::Connecting));
        assert_eq!(net.links()[0].candidates_applied(), 1);

        // Candidates for unknown peers go nowhere.
        let mut stray = candidate(serde_json::json!({ "candidate": "mem-y" }));
        stray.from = "nobody".into();
        orch.handle_signal(stray).await;
        assert_eq!(orch.peer_ids(), vec!["b".to_string()]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn failed_link_is_kept_until_pruned() {
        let dir = test_dir("failed_link");
        let net = MemoryNetwork::new();
        net.refuse.store(true, Ordering::Release);
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("a", &net, rec.clone(), &dir);

        orch.sync_peers(&[device("b")]).await;
        assert_eq!(orch.phase("b"), Some(PeerPhase::Failed));
        assert!(rec.sent().is_empty());

        // Announced again with the transport back: retried.
        net.refuse.store(false, Ordering::Release);
        orch.sync_peers(&[device("b")]).await;
        assert_eq!(orch.phase("b"), Some(PeerPhase::Connecting));

        orch.sync_peers(&[]).await;
        assert_eq!(orch.phase("b"), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn duplicate_answer_is_applied_once() {
        let dir = test_dir("duplicate_answer");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("a", &net, rec.clone(), &dir);

        orch.sync_peers(&[device("b")]).await;
        wait_until(|| rec.payload("b", SignalType::Offer).is_some()).await;
        let offer = rec.payload("b", SignalType::Offer).unwrap();

        // Play the responder by hand.
        let (far_tx, _far_events) = mpsc::unbounded_channel();
        let far = net.create_link(far_tx).await.unwrap();
        far.set_remote_description(offer).await.unwrap();
        let answer = SignalFrame {
            room_id: "room".into(),
            from: "b".into(),
            to: "a".into(),
            signal_type: SignalType::Answer,
            payload: far.create_answer().await.unwrap(),
        };

        orch.handle_signal(answer.clone()).await;
        orch.handle_signal(answer).await;

        let ours = net.links()[0].clone();
        assert_eq!(ours.descriptions_applied(), 1);
        wait_until(|| orch.phase("b") == Some(PeerPhase::Connected)).await;
        assert!(ours.channel().is_some());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn shutdown_tears_every_session_down() {
        let dir = test_dir("shutdown");
        let net = MemoryNetwork::new();
        let rec = Arc::new(Recorder::default());
        let (orch, _rx) = orchestrator("a", &net, rec, &dir);

        orch.handle_event(SignalingEvent::PeersChanged(vec![device("b"), device("c")]))
            .await;
        assert_eq!(orch.peer_ids(), vec!["b".to_string(), "c".to_string()]);

        orch.shutdown().await;
        assert!(orch.peer_ids().is_empty());
        assert!(net.links().iter().all(|l| l.is_closed()));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
