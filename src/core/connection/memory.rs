//! In-process links for tests.
//!
//! Descriptions carry the id of the link that produced them, so applying an
//! offer and then the answer pairs two links. Once the initiator has the
//! answer both sides report `Connected` and, if a data channel was
//! requested, a channel pair opens.

use crate::core::connection::{DataChannel, LinkEvent, LinkFactory, LinkState, PeerLink};
use crate::core::protocol::ChannelMessage;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

// ── Channel ──────────────────────────────────────────────────────────────────

pub struct MemoryChannel {
    label: String,
    open: AtomicBool,
    local_events: mpsc::UnboundedSender<LinkEvent>,
    remote_events: mpsc::UnboundedSender<LinkEvent>,
    peer: Mutex<Weak<MemoryChannel>>,
    /// Reported by `buffered_amount`; tests set it to exercise backpressure.
    pub buffered: AtomicUsize,
    pub sent_messages: AtomicUsize,
}

impl MemoryChannel {
    pub fn pair(
        label: &str,
        a_events: mpsc::UnboundedSender<LinkEvent>,
        b_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> (Arc<Self>, Arc<Self>) {
        let make = |local: &mpsc::UnboundedSender<LinkEvent>, remote: &mpsc::UnboundedSender<LinkEvent>| {
            Arc::new(Self {
                label: label.to_string(),
                open: AtomicBool::new(true),
                local_events: local.clone(),
                remote_events: remote.clone(),
                peer: Mutex::new(Weak::new()),
                buffered: AtomicUsize::new(0),
                sent_messages: AtomicUsize::new(0),
            })
        };
        let a = make(&a_events, &b_events);
        let b = make(&b_events, &a_events);
        *a.peer.lock().unwrap() = Arc::downgrade(&b);
        *b.peer.lock().unwrap() = Arc::downgrade(&a);
        (a, b)
    }

    fn shut(&self) -> bool {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.local_events.send(LinkEvent::ChannelClosed);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn send(&self, msg: ChannelMessage) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("channel closed"));
        }
        self.sent_messages.fetch_add(1, Ordering::Relaxed);
        self.remote_events
            .send(LinkEvent::ChannelMessage(msg))
            .map_err(|_| anyhow!("remote gone"))
    }

    async fn close(&self) -> Result<()> {
        if self.shut() {
            let peer = self.peer.lock().unwrap().upgrade();
            if let Some(peer) = peer {
                peer.shut();
            }
        }
        Ok(())
    }
}

// ── Link ─────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LinkInner {
    remote: Option<u64>,
    has_remote: bool,
    label: Option<String>,
    channel: Option<Arc<MemoryChannel>>,
    closed: bool,
    candidates: usize,
    descriptions: usize,
}

pub struct MemoryLink {
    id: u64,
    net: Weak<NetState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    inner: Mutex<LinkInner>,
}

impl MemoryLink {
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn candidates_applied(&self) -> usize {
        self.inner.lock().unwrap().candidates
    }

    pub fn descriptions_applied(&self) -> usize {
        self.inner.lock().unwrap().descriptions
    }

    pub fn channel(&self) -> Option<Arc<MemoryChannel>> {
        self.inner.lock().unwrap().channel.clone()
    }

    fn description(&self, kind: &str) -> Value {
        let _ = self
            .events
            .send(LinkEvent::LocalCandidate(json!({ "candidate": format!("mem-{}", self.id) })));
        json!({ "type": kind, "link": self.id })
    }

    /// Called on the initiator once it holds the answer.
    fn establish(&self, remote: &Arc<MemoryLink>) {
        let label = self.inner.lock().unwrap().label.clone();
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Connected));
        let _ = remote.events.send(LinkEvent::StateChanged(LinkState::Connected));

        if let Some(label) = label {
            let (mine, theirs) = MemoryChannel::pair(&label, self.events.clone(), remote.events.clone());
            self.inner.lock().unwrap().channel = Some(mine.clone());
            remote.inner.lock().unwrap().channel = Some(theirs.clone());
            let _ = self.events.send(LinkEvent::ChannelOpen(mine));
            let _ = remote.events.send(LinkEvent::ChannelOpen(theirs));
        }
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    async fn open_data_channel(&self, label: &str) -> Result<()> {
        self.inner.lock().unwrap().label = Some(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<Value> {
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<Value> {
        if !self.inner.lock().unwrap().has_remote {
            return Err(anyhow!("answer without remote offer"));
        }
        Ok(self.description("answer"))
    }

    async fn set_remote_description(&self, description: Value) -> Result<()> {
        let remote_id = description["link"]
            .as_u64()
            .ok_or_else(|| anyhow!("not a memory description"))?;
        let kind = description["type"].as_str().unwrap_or_default().to_string();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remote = Some(remote_id);
            inner.has_remote = true;
            inner.descriptions += 1;
        }
        if kind == "answer" {
            let net = self.net.upgrade().ok_or_else(|| anyhow!("network gone"))?;
            let remote = net.link(remote_id).ok_or_else(|| anyhow!("unknown link"))?;
            self.establish(&remote);
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().unwrap().has_remote
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<()> {
        if candidate.get("candidate").and_then(Value::as_str).is_none() {
            return Err(anyhow!("malformed candidate"));
        }
        self.inner.lock().unwrap().candidates += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channel = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.channel.take()
        };
        if let Some(channel) = channel {
            channel.close().await?;
        }
        let _ = self.events.send(LinkEvent::StateChanged(LinkState::Closed));
        Ok(())
    }
}

// ── Network ──────────────────────────────────────────────────────────────────

#[derive(Default)]
struct NetState {
    links: Mutex<HashMap<u64, Arc<MemoryLink>>>,
    next_id: AtomicUsize,
}

impl NetState {
    fn link(&self, id: u64) -> Option<Arc<MemoryLink>> {
        self.links.lock().unwrap().get(&id).cloned()
    }
}

/// Factory for paired in-memory links.
#[derive(Default, Clone)]
pub struct MemoryNetwork {
    state: Arc<NetState>,
    /// When set, `create_link` fails.
    pub refuse: Arc<AtomicBool>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn links(&self) -> Vec<Arc<MemoryLink>> {
        let mut links: Vec<_> = self.state.links.lock().unwrap().values().cloned().collect();
        links.sort_by_key(|l| l.id);
        links
    }
}

#[async_trait]
impl LinkFactory for MemoryNetwork {
    async fn create_link(
        &self,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>> {
        if self.refuse.load(Ordering::Acquire) {
            return Err(anyhow!("link creation refused"));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) as u64 + 1;
        let link = Arc::new(MemoryLink {
            id,
            net: Arc::downgrade(&self.state),
            events,
            inner: Mutex::new(LinkInner::default()),
        });
        self.state.links.lock().unwrap().insert(id, link.clone());
        Ok(link)
    }
}
