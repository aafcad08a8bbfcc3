//! `roomdrop peer`: join a room, connect to every device in it and
//! exchange files.
//!
//! Wires the signaling manager, the session orchestrator and the transfer
//! engine together. Files passed with `--send` go to each peer once, as
//! soon as that peer shows up (or only to `--to`). Received files land in
//! `--out`.

use crate::core::connection::webrtc::WebRtcFactory;
use crate::core::identity;
use crate::core::protocol::Device;
use crate::core::session::SessionOrchestrator;
use crate::core::signaling::{Identity, SignalingEvent, SignalingManager};
use crate::core::transfer::{
    DirectoryDelivery, TransferEngine, TransferEvent, TransferStatus,
};
use crate::utils::data_dir;
use crate::utils::hash::room_id_from_context;
use crate::utils::sos::SignalOfStop;
use crate::workers::args::PeerArgs;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Decides which peers get the `--send` files.
struct Outbox {
    files: Vec<PathBuf>,
    only: Option<String>,
    served: HashSet<String>,
}

impl Outbox {
    fn new(files: Vec<PathBuf>, only: Option<String>) -> Self {
        Self {
            files,
            only,
            served: HashSet::new(),
        }
    }

    /// Peers in `peers` that have not been sent the files yet.
    fn due(&mut self, peers: &[Device]) -> Vec<String> {
        if self.files.is_empty() {
            return Vec::new();
        }
        peers
            .iter()
            .map(|d| d.device_id.clone())
            .filter(|id| self.only.as_ref().map_or(true, |only| only == id))
            .filter(|id| self.served.insert(id.clone()))
            .collect()
    }
}

pub async fn run(args: PeerArgs, sos: SignalOfStop) -> Result<()> {
    let device = identity::load_or_create(data_dir::get()?, args.name.as_deref())?;
    let room_id = room_id_from_context(&args.room);
    let out_dir = args.out_dir();
    info!(
        event = "peer_start",
        device = %device.device_id,
        name = %device.device_name,
        room = %room_id,
        relay = %args.signal_url(),
        out = %out_dir.display(),
        "Joining room"
    );

    let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
    let manager = SignalingManager::new(args.signal_url(), sos.clone(), signal_tx);

    let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
    let orchestrator = SessionOrchestrator::new(
        device.device_id.clone(),
        Arc::new(WebRtcFactory::new()?),
        Arc::new(manager.clone()),
        TransferEngine::new(
            device.device_id.clone(),
            Arc::new(DirectoryDelivery::new(out_dir)),
            transfer_tx,
            sos.clone(),
        ),
        sos.clone(),
    );
    let engine = orchestrator.engine();
    let ticker = engine.spawn_retry_ticker();

    manager.set_identity(Identity { room_id, device });

    let mut outbox = Outbox::new(args.send, args.to);
    let mut last_status: HashMap<Uuid, TransferStatus> = HashMap::new();

    loop {
        tokio::select! {
            _ = sos.wait() => break,
            Some(event) = signal_rx.recv() => {
                let due = match &event {
                    SignalingEvent::PeersChanged(peers) => {
                        info!(event = "peers_changed", count = peers.len(), "Room membership changed");
                        outbox.due(peers)
                    }
                    _ => Vec::new(),
                };
                orchestrator.handle_event(event).await;
                for peer_id in due {
                    for path in &outbox.files {
                        engine.send_file(&peer_id, path).await;
                    }
                }
            }
            Some(event) = transfer_rx.recv() => report(&event, &mut last_status),
        }
    }

    manager.close();
    orchestrator.shutdown().await;
    let _ = ticker.await;
    info!(event = "peer_stop", "Left room");
    Ok(())
}

fn report(event: &TransferEvent, last_status: &mut HashMap<Uuid, TransferStatus>) {
    match event {
        TransferEvent::Updated(t) => {
            if last_status.insert(t.id, t.status) == Some(t.status) {
                debug!(
                    event = "transfer_progress",
                    id = %t.id,
                    progress = format!("{:.1}%", t.progress * 100.0),
                    speed_bps = t.speed_bps as u64,
                    "Transfer progress"
                );
                return;
            }
            match t.status {
                TransferStatus::Failed => warn!(
                    event = "transfer_status",
                    id = %t.id,
                    direction = ?t.direction,
                    peer = %t.peer_id,
                    name = %t.name,
                    status = ?t.status,
                    "Transfer failed"
                ),
                _ => info!(
                    event = "transfer_status",
                    id = %t.id,
                    direction = ?t.direction,
                    peer = %t.peer_id,
                    name = %t.name,
                    status = ?t.status,
                    "Transfer status changed"
                ),
            }
        }
        TransferEvent::Delivered { transfer, path } => {
            info!(
                event = "file_saved",
                id = %transfer.id,
                from = %transfer.peer_id,
                path = %path.display(),
                "Saved received file"
            );
        }
    }
}
