//! Deterministic hashing helpers.
//!
//! Provides:
//! - Room id derivation from a shared phrase (SHA3-256, hex, truncated)
//! - Stable palette index for a device id

use crate::core::config::ROOM_ID_BYTES;
use sha3::{Digest, Sha3_256};

// ── Room Id ────────────────────────────────────────────────────────────────────

/// Derive the room id every peer sharing `context` ends up in.
///
/// The context is trimmed so a phrase pasted with stray whitespace still
/// lands in the same room.
pub fn room_id_from_context(context: &str) -> String {
    let digest = Sha3_256::digest(context.trim().as_bytes());
    hex::encode(&digest[..ROOM_ID_BYTES])
}

// ── Palette ────────────────────────────────────────────────────────────────────

/// Pick a stable index in `0..palette_len` for `device_id`.
pub fn palette_index(device_id: &str, palette_len: usize) -> usize {
    if palette_len == 0 {
        return 0;
    }
    let digest = Sha3_256::digest(device_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % palette_len as u64) as usize
}
