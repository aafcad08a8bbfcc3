//! Inbound reassembly.
//!
//! Chunks carry no transfer id: each binary frame is attributed to the open
//! assembly of the same peer while it still expects bytes. A peer has at
//! most one open assembly.

use crate::core::protocol::FileMeta;
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug)]
pub struct IncomingAssembly {
    pub peer_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub received_bytes: u64,
    pub chunks: Vec<Bytes>,
    pub started_at: Instant,
}

impl IncomingAssembly {
    fn is_incomplete(&self) -> bool {
        self.received_bytes < self.size
    }

    /// Concatenate the received chunks.
    pub fn into_bytes(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut buf = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in &self.chunks {
            buf.extend_from_slice(chunk);
        }
        buf.freeze()
    }
}

/// Progress of an assembly after a chunk was appended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkAccepted {
    pub id: Uuid,
    pub received_bytes: u64,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
pub struct Reassembler {
    assemblies: HashMap<Uuid, IncomingAssembly>,
    /// Announcement order, for chunk attribution.
    order: Vec<Uuid>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an assembly for `meta`. `None` for a duplicate id.
    ///
    /// A peer streams one file at a time, so any assembly of `peer_id` still
    /// open at this point was abandoned by the sender. Those are discarded
    /// and their ids returned.
    pub fn announce(&mut self, peer_id: &str, meta: &FileMeta) -> Option<Vec<Uuid>> {
        if self.assemblies.contains_key(&meta.id) {
            return None;
        }
        let abandoned = self.drop_peer(peer_id);
        self.assemblies.insert(
            meta.id,
            IncomingAssembly {
                peer_id: peer_id.to_string(),
                name: meta.name.clone(),
                size: meta.size,
                mime_type: meta.mime_type.clone(),
                received_bytes: 0,
                chunks: Vec::new(),
                started_at: Instant::now(),
            },
        );
        self.order.push(meta.id);
        Some(abandoned)
    }

    /// Append `data` to the first incomplete assembly of `peer_id`.
    /// `None` when that peer has nothing awaiting bytes.
    pub fn append(&mut self, peer_id: &str, data: Bytes) -> Option<ChunkAccepted> {
        let id = *self.order.iter().find(|id| {
            self.assemblies
                .get(*id)
                .is_some_and(|a| a.peer_id == peer_id && a.is_incomplete())
        })?;
        let assembly = self.assemblies.get_mut(&id)?;
        assembly.received_bytes += data.len() as u64;
        assembly.chunks.push(data);
        Some(ChunkAccepted {
            id,
            received_bytes: assembly.received_bytes,
            started_at: assembly.started_at,
        })
    }

    pub fn peer_of(&self, id: &Uuid) -> Option<&str> {
        self.assemblies.get(id).map(|a| a.peer_id.as_str())
    }

    /// Remove and return the assembly for `id`.
    pub fn complete(&mut self, id: &Uuid) -> Option<IncomingAssembly> {
        let assembly = self.assemblies.remove(id)?;
        self.order.retain(|o| o != id);
        Some(assembly)
    }

    /// Discard every assembly of `peer_id`; returns their ids.
    pub fn drop_peer(&mut self, peer_id: &str) -> Vec<Uuid> {
        let ids: Vec<Uuid> = self
            .order
            .iter()
            .filter(|id| self.peer_of(id) == Some(peer_id))
            .copied()
            .collect();
        for id in &ids {
            self.complete(id);
        }
        ids
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.assemblies.len()
    }
}
