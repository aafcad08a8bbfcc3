//! Centralized configuration constants for roomdrop.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format names (frame `type` tags, signal types)
//! stay in the protocol module.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Logical chunk size for outbound files (128 KiB).
///
/// Progress, throughput and backpressure are evaluated once per chunk.
pub const CHUNK_SIZE: usize = 128 * 1024;

/// High water mark for the data channel send buffer (bytes).
/// While `buffered_amount` is above this value no further chunk is queued.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024; // 4 MB

/// Poll interval while waiting for the send buffer to drain.
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sender read-ahead buffer: chunks prefetched from disk while the
/// previous ones are being handed to the channel.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 8;

/// Reconciliation attempts a queued send gets before it is marked failed.
pub const MAX_SEND_RETRIES: u32 = 5;

/// Period of the background reconciliation tick for queued sends.
/// Availability changes (channel open/close) trigger extra passes.
pub const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Label of the single data channel opened per peer.
pub const DATA_CHANNEL_LABEL: &str = "file-transfer";

/// MIME type announced when the extension is unknown.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ── Signaling ────────────────────────────────────────────────────────────────

/// First reconnect delay after an unexpected signaling disconnect.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_millis(1000);

/// Multiplier applied to the reconnect delay after every failed attempt.
pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

/// Upper bound for the reconnect delay.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_millis(10_000);

/// Relay URL used by `peer` when neither the CLI nor the config file sets one.
pub const DEFAULT_SIGNAL_URL: &str = "ws://127.0.0.1:8080";

/// Relay listening port when neither `--port` nor `$PORT` is given.
pub const DEFAULT_RELAY_PORT: u16 = 8080;

// ── Connection / Network ─────────────────────────────────────────────────────

/// STUN servers used for candidate gathering.
pub const STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Largest single SCTP message handed to webrtc-rs.
///
/// The webrtc-rs receive path reads messages into a 64 KB buffer, so binary
/// frames larger than this are split before sending. Chunk frames carry no
/// header, which makes the split invisible to the receiver.
pub const SCTP_MAX_FRAGMENT: usize = 48 * 1024;

/// Whether to gather loopback candidates (same-machine testing).
pub const SCTP_USE_LOOPBACK: bool = false;

// ── Identity ─────────────────────────────────────────────────────────────────

/// Colors assigned to devices, picked by a hash of the device id.
pub const DEVICE_COLORS: &[&str] = &[
    "#ef4444", "#f97316", "#eab308", "#22c55e", "#14b8a6", "#3b82f6", "#8b5cf6", "#ec4899",
];

/// Bytes of the SHA3-256 digest kept for a room id (hex-encoded: 32 chars).
pub const ROOM_ID_BYTES: usize = 16;
