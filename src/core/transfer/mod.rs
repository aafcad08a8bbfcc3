//! Transfer engine.
//!
//! Owns every [`Transfer`] record and the per-peer send state:
//!
//! - `send_file` queues a send until the peer's channel is open.
//! - `reconcile` (on a periodic tick, and for a single peer on its channel
//!   attach/detach) counts one attempt per queued send, dispatches those
//!   whose channel is open and fails those that ran out of attempts.
//! - Sends to one peer are serialized so a single file streams per channel.
//! - `handle_message` reassembles inbound files and hands them to the
//!   [`Delivery`] collaborator.
//!
//! Failures only ever fail the transfer they belong to.

pub mod delivery;
pub mod receiver;
pub mod sender;
pub mod types;

pub use delivery::{Delivery, DirectoryDelivery};
pub use types::{Direction, PendingSend, Transfer, TransferEvent, TransferStatus};

use crate::core::config::{MAX_SEND_RETRIES, SEND_RETRY_INTERVAL};
use crate::core::connection::DataChannel;
use crate::core::protocol::{ChannelFrame, ChannelMessage, FileMeta};
use crate::utils::sos::SignalOfStop;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use receiver::Reassembler;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Per-peer state ───────────────────────────────────────────────────────────

struct Attached {
    channel: Arc<dyn DataChannel>,
    /// Cancelled when the channel is detached; stops its in-flight sends.
    sos: SignalOfStop,
}

#[derive(Default)]
struct PeerSlot {
    attached: Option<Attached>,
    pending: Vec<PendingSend>,
    send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl PeerSlot {
    fn open_channel(&self) -> Option<&Attached> {
        self.attached.as_ref().filter(|a| a.channel.is_open())
    }
}

struct EngineInner {
    local_id: String,
    delivery: Arc<dyn Delivery>,
    events: mpsc::UnboundedSender<TransferEvent>,
    sos: SignalOfStop,
    transfers: Mutex<HashMap<Uuid, Transfer>>,
    peers: Mutex<HashMap<String, PeerSlot>>,
    reassembler: Mutex<Reassembler>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<EngineInner>,
}

impl TransferEngine {
    pub fn new(
        local_id: impl Into<String>,
        delivery: Arc<dyn Delivery>,
        events: mpsc::UnboundedSender<TransferEvent>,
        sos: SignalOfStop,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                local_id: local_id.into(),
                delivery,
                events,
                sos,
                transfers: Mutex::new(HashMap::new()),
                peers: Mutex::new(HashMap::new()),
                reassembler: Mutex::new(Reassembler::new()),
            }),
        }
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn transfer(&self, id: Uuid) -> Option<Transfer> {
        lock(&self.inner.transfers).get(&id).cloned()
    }

    #[cfg(test)]
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.inner.transfers).values().cloned().collect()
    }

    #[cfg(test)]
    pub fn pending_count(&self, peer_id: &str) -> usize {
        lock(&self.inner.peers)
            .get(peer_id)
            .map_or(0, |slot| slot.pending.len())
    }

    // ── Record keeping ───────────────────────────────────────────────────

    fn insert(&self, transfer: Transfer) {
        let mut transfers = lock(&self.inner.transfers);
        let _ = self.inner.events.send(TransferEvent::Updated(transfer.clone()));
        transfers.insert(transfer.id, transfer);
    }

    /// Apply `f` to a non-terminal transfer and publish the result.
    /// Terminal transfers are never modified again.
    fn update(&self, id: Uuid, f: impl FnOnce(&mut Transfer)) -> Option<Transfer> {
        let mut transfers = lock(&self.inner.transfers);
        let transfer = transfers.get_mut(&id)?;
        if transfer.status.is_terminal() {
            return None;
        }
        f(transfer);
        let snapshot = transfer.clone();
        let _ = self.inner.events.send(TransferEvent::Updated(snapshot.clone()));
        Some(snapshot)
    }

    fn fail(&self, id: Uuid, reason: &str) {
        if let Some(t) = self.update(id, |t| t.status = TransferStatus::Failed) {
            warn!(
                event = "transfer_failed",
                id = %id,
                peer = %t.peer_id,
                name = %t.name,
                reason,
                "Transfer failed"
            );
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────

    /// Send `path` to `peer_id`. The returned id identifies the transfer for
    /// its whole life, including retries.
    pub async fn send_file(&self, peer_id: &str, path: &Path) -> Uuid {
        let id = Uuid::new_v4();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let size = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => Some(m.len()),
            _ => None,
        };
        let mut transfer = Transfer::new(id, Direction::Send, peer_id, &name, size.unwrap_or(0));
        if size.is_none() {
            transfer.status = TransferStatus::Failed;
            warn!(
                event = "transfer_source_unreadable",
                id = %id,
                path = %path.display(),
                "Source file unreadable"
            );
            self.insert(transfer);
            return id;
        }
        self.insert(transfer);

        let pending = PendingSend {
            path: path.to_path_buf(),
            transfer_id: id,
            retry_count: 0,
        };

        let mut peers = lock(&self.inner.peers);
        let slot = peers.entry(peer_id.to_string()).or_default();
        if slot.open_channel().is_some() {
            self.dispatch(peer_id, slot, pending);
        } else {
            info!(event = "transfer_queued", id = %id, peer = %peer_id, name = %name, "Channel not open, send queued");
            slot.pending.push(pending);
        }
        id
    }

    /// One retry pass over every queued send.
    pub fn reconcile(&self) {
        let mut exhausted = Vec::new();
        {
            let mut peers = lock(&self.inner.peers);
            for (peer_id, slot) in peers.iter_mut() {
                self.reconcile_slot(peer_id, slot, &mut exhausted);
            }
        }
        self.fail_exhausted(exhausted);
    }

    /// One retry pass over the sends queued for `peer_id` only.
    fn reconcile_peer(&self, peer_id: &str) {
        let mut exhausted = Vec::new();
        if let Some(slot) = lock(&self.inner.peers).get_mut(peer_id) {
            self.reconcile_slot(peer_id, slot, &mut exhausted);
        }
        self.fail_exhausted(exhausted);
    }

    fn reconcile_slot(&self, peer_id: &str, slot: &mut PeerSlot, exhausted: &mut Vec<Uuid>) {
        if slot.pending.is_empty() {
            return;
        }
        let open = slot.open_channel().is_some();
        for mut entry in std::mem::take(&mut slot.pending) {
            entry.retry_count += 1;
            if open {
                self.dispatch(peer_id, slot, entry);
            } else if entry.retry_count >= MAX_SEND_RETRIES {
                exhausted.push(entry.transfer_id);
            } else {
                debug!(
                    event = "transfer_retry_pending",
                    id = %entry.transfer_id,
                    attempt = entry.retry_count,
                    "Channel still not open"
                );
                slot.pending.push(entry);
            }
        }
    }

    fn fail_exhausted(&self, exhausted: Vec<Uuid>) {
        for id in exhausted {
            self.fail(id, "channel never opened");
        }
    }

    /// Spawn the send task for `pending` on the slot's open channel.
    fn dispatch(&self, peer_id: &str, slot: &PeerSlot, pending: PendingSend) {
        let Some(attached) = slot.open_channel() else {
            return;
        };
        let engine = self.clone();
        let channel = attached.channel.clone();
        let sos = attached.sos.clone();
        let send_lock = slot.send_lock.clone();
        let peer_id = peer_id.to_string();

        tokio::spawn(async move {
            let id = pending.transfer_id;
            let outcome = sos
                .select(async {
                    let _serial = send_lock.lock().await;
                    engine.run_send(&peer_id, channel.as_ref(), &pending).await
                })
                .await;
            match outcome {
                Some(Ok(())) => {
                    if let Some(t) = engine.update(id, |t| {
                        t.status = TransferStatus::Completed;
                        t.progress = 1.0;
                    }) {
                        info!(
                            event = "transfer_sent",
                            id = %id,
                            peer = %t.peer_id,
                            name = %t.name,
                            bytes = t.size,
                            "File sent"
                        );
                    }
                }
                Some(Err(e)) => engine.fail(id, &e.to_string()),
                None => engine.fail(id, "channel closed"),
            }
        });
    }

    async fn run_send(&self, peer_id: &str, channel: &dyn DataChannel, pending: &PendingSend) -> Result<()> {
        let id = pending.transfer_id;
        let transfer = self
            .transfer(id)
            .ok_or_else(|| anyhow!("Unknown transfer {id}"))?;
        if !channel.is_open() {
            return Err(anyhow!("Channel to {peer_id} closed before sending"));
        }
        // Nothing goes on the wire for a source that changed while queued.
        let size = tokio::fs::metadata(&pending.path)
            .await
            .with_context(|| format!("Cannot read {}", pending.path.display()))?
            .len();
        if size != transfer.size {
            return Err(anyhow!(
                "Source changed size from {} to {size} bytes",
                transfer.size
            ));
        }

        let meta = FileMeta {
            id,
            name: transfer.name.clone(),
            size: transfer.size,
            mime_type: sender::guess_mime_type(&pending.path).to_string(),
            from: self.inner.local_id.clone(),
        };

        self.update(id, |t| {
            t.status = TransferStatus::InProgress;
            t.progress = 0.0;
        });
        info!(event = "transfer_started", id = %id, peer = %peer_id, name = %meta.name, size = meta.size, "Sending file");

        let started = Instant::now();
        sender::stream_file(channel, &pending.path, &meta, |sent| {
            self.update(id, |t| t.record_progress(sent, started.elapsed()));
        })
        .await
    }

    // ── Channel availability ─────────────────────────────────────────────

    /// `peer_id` now has an open channel; queued sends are retried at once.
    pub fn attach_channel(&self, peer_id: &str, channel: Arc<dyn DataChannel>) {
        {
            let mut peers = lock(&self.inner.peers);
            let slot = peers.entry(peer_id.to_string()).or_default();
            if let Some(old) = slot.attached.take() {
                old.sos.cancel();
            }
            slot.attached = Some(Attached {
                channel,
                sos: self.inner.sos.child(),
            });
        }
        info!(event = "channel_attached", peer = %peer_id, "Data channel ready");
        self.reconcile_peer(peer_id);
    }

    /// The channel to `peer_id` closed: in-flight transfers on it fail,
    /// queued sends stay queued.
    pub fn detach_channel(&self, peer_id: &str) {
        let detached = {
            let mut peers = lock(&self.inner.peers);
            peers.get_mut(peer_id).and_then(|slot| slot.attached.take())
        };
        if let Some(attached) = detached {
            attached.sos.cancel();
            info!(event = "channel_detached", peer = %peer_id, "Data channel closed");
        }
        self.drop_incoming(peer_id, "channel closed");
        self.reconcile_peer(peer_id);
    }

    /// Forget `peer_id` entirely, failing everything still owed to or from it.
    pub fn remove_peer(&self, peer_id: &str) {
        let slot = lock(&self.inner.peers).remove(peer_id);
        if let Some(slot) = slot {
            if let Some(attached) = slot.attached {
                attached.sos.cancel();
            }
            for entry in slot.pending {
                self.fail(entry.transfer_id, "peer left");
            }
        }
        self.drop_incoming(peer_id, "peer left");
    }

    fn drop_incoming(&self, peer_id: &str, reason: &str) {
        let ids = lock(&self.inner.reassembler).drop_peer(peer_id);
        for id in ids {
            self.fail(id, reason);
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────

    /// Process one inbound data-channel message from `peer_id`.
    pub async fn handle_message(&self, peer_id: &str, msg: ChannelMessage) {
        let frame = match ChannelFrame::decode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(event = "channel_frame_ignored", peer = %peer_id, error = %e, "Ignoring frame");
                return;
            }
        };
        match frame {
            ChannelFrame::FileMeta(meta) => self.on_file_meta(peer_id, meta),
            ChannelFrame::Chunk(data) => self.on_chunk(peer_id, data),
            ChannelFrame::FileComplete { id } => self.on_file_complete(peer_id, id).await,
        }
    }

    fn on_file_meta(&self, peer_id: &str, meta: FileMeta) {
        let announced = if lock(&self.inner.transfers).contains_key(&meta.id) {
            None
        } else {
            lock(&self.inner.reassembler).announce(peer_id, &meta)
        };
        let Some(abandoned) = announced else {
            debug!(event = "file_meta_duplicate", id = %meta.id, "Ignoring duplicate file-meta");
            return;
        };
        for id in abandoned {
            self.fail(id, "sender moved on to another file");
        }
        info!(
            event = "transfer_incoming",
            id = %meta.id,
            peer = %peer_id,
            name = %meta.name,
            size = meta.size,
            mime = %meta.mime_type,
            "Receiving file"
        );
        let mut transfer = Transfer::new(meta.id, Direction::Receive, peer_id, &meta.name, meta.size);
        transfer.status = TransferStatus::InProgress;
        self.insert(transfer);
    }

    fn on_chunk(&self, peer_id: &str, data: Bytes) {
        let accepted = lock(&self.inner.reassembler).append(peer_id, data);
        match accepted {
            Some(chunk) => {
                self.update(chunk.id, |t| {
                    t.record_progress(chunk.received_bytes, chunk.started_at.elapsed())
                });
            }
            None => {
                debug!(event = "chunk_dropped", peer = %peer_id, "Chunk without an open assembly");
            }
        }
    }

    async fn on_file_complete(&self, peer_id: &str, id: Uuid) {
        let assembly = {
            let mut reassembler = lock(&self.inner.reassembler);
            if reassembler.peer_of(&id) != Some(peer_id) {
                debug!(event = "file_complete_unknown", id = %id, peer = %peer_id, "No matching assembly");
                return;
            }
            reassembler.complete(&id)
        };
        let Some(assembly) = assembly else { return };

        if assembly.received_bytes != assembly.size {
            self.fail(
                id,
                &format!("received {} of {} bytes", assembly.received_bytes, assembly.size),
            );
            return;
        }

        let name = assembly.name.clone();
        let mime_type = assembly.mime_type.clone();
        match self
            .inner
            .delivery
            .deliver(&name, &mime_type, assembly.into_bytes())
            .await
        {
            Ok(path) => self.complete_receive(id, path),
            Err(e) => self.fail(id, &format!("delivery failed: {e}")),
        }
    }

    fn complete_receive(&self, id: Uuid, path: PathBuf) {
        let Some(transfer) = self.update(id, |t| {
            t.status = TransferStatus::Completed;
            t.progress = 1.0;
        }) else {
            return;
        };
        info!(
            event = "transfer_received",
            id = %id,
            peer = %transfer.peer_id,
            path = %path.display(),
            bytes = transfer.size,
            "File received"
        );
        let _ = self
            .inner
            .events
            .send(TransferEvent::Delivered { transfer, path });
    }

    // ── Background ───────────────────────────────────────────────────────

    /// Periodic reconciliation; stops with the engine's stop signal.
    pub fn spawn_retry_ticker(&self) -> tokio::task::JoinHandle<()> {
        let engine = self.clone();
        let sos = self.inner.sos.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SEND_RETRY_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            tick.tick().await;
            while sos.select(tick.tick()).await.is_some() {
                engine.reconcile();
            }
            debug!(event = "retry_ticker_stopped", "Send retry ticker stopped");
        })
    }
}
