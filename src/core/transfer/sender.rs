//! Outbound streaming: file data is read from disk with read-ahead
//! buffering and written to the data channel under backpressure.
//!
//! ```text
//! ┌──────────┐   bounded chan   ┌──────────────────────┐
//! │ DiskRead │ ────────────────►│ Send loop            │──► DataChannel
//! │ (async)  │  READ_AHEAD × 1  │ (backpressure, send) │
//! └──────────┘                  └──────────────────────┘
//! ```
//!
//! Frame order per file: `file-meta`, chunks in sequence, `file-complete`.

use crate::core::config::{
    BACKPRESSURE_POLL_INTERVAL, CHUNK_SIZE, DC_BUFFERED_AMOUNT_HIGH, DEFAULT_MIME_TYPE,
    SENDER_READ_AHEAD_CHUNKS,
};
use crate::core::connection::DataChannel;
use crate::core::protocol::{ChannelFrame, FileMeta};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, trace};

// ── Reader ─────────────────────────────────────────────────────────────────────

/// A chunk read from disk, ready to be sent.
pub struct ReadChunk {
    /// 0-based sequence number.
    pub seq: u32,
    pub data: Bytes,
}

/// Spawn a disk reader that prefetches chunks into a bounded channel.
///
/// The reader stops early once the consumer drops the receiver. A file
/// shorter than `filesize` ends the task with an error.
pub fn spawn_reader(
    file_path: PathBuf,
    filesize: u64,
    chunk_size: usize,
) -> (mpsc::Receiver<ReadChunk>, tokio::task::JoinHandle<Result<()>>) {
    let (tx, rx) = mpsc::channel(SENDER_READ_AHEAD_CHUNKS);

    let handle = tokio::spawn(async move {
        let mut file = tokio::fs::File::open(&file_path).await?;
        let total_chunks = filesize.div_ceil(chunk_size as u64);

        for seq in 0..total_chunks {
            let offset = seq * chunk_size as u64;
            let len = (chunk_size as u64).min(filesize - offset) as usize;

            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;

            let chunk = ReadChunk {
                seq: seq as u32,
                data: Bytes::from(buf),
            };
            // Stop if the consumer (send loop) has been dropped.
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
        Ok(())
    });

    (rx, handle)
}

// ── Backpressure ──────────────────────────────────────────────────────────────

/// Poll until the channel's send buffer is at or below the high-water mark.
///
/// No deadline: a stalled channel either drains or closes, and closing
/// fails the wait.
pub async fn wait_for_buffer_space(dc: &dyn DataChannel) -> Result<()> {
    let mut logged = false;
    loop {
        if !dc.is_open() {
            return Err(anyhow!(
                "DataChannel '{}' closed during backpressure wait",
                dc.label()
            ));
        }
        let buffered = dc.buffered_amount().await;
        if buffered <= DC_BUFFERED_AMOUNT_HIGH {
            return Ok(());
        }
        if !logged {
            debug!(
                event = "backpressure",
                channel = %dc.label(),
                buffered,
                high_watermark = DC_BUFFERED_AMOUNT_HIGH,
                "Applying backpressure - waiting for buffer to drain"
            );
            logged = true;
        }
        tokio::time::sleep(BACKPRESSURE_POLL_INTERVAL).await;
    }
}

// ── Streaming ─────────────────────────────────────────────────────────────────

/// Send one file: metadata, chunks, completion marker.
///
/// `on_progress` receives the cumulative number of bytes handed to the
/// channel after every chunk.
pub async fn stream_file(
    dc: &dyn DataChannel,
    path: &Path,
    meta: &FileMeta,
    mut on_progress: impl FnMut(u64) + Send,
) -> Result<()> {
    dc.send(ChannelFrame::FileMeta(meta.clone()).encode()?).await?;

    let (mut rx, reader) = spawn_reader(path.to_path_buf(), meta.size, CHUNK_SIZE);
    let mut sent: u64 = 0;

    while let Some(chunk) = rx.recv().await {
        wait_for_buffer_space(dc).await?;
        let len = chunk.data.len() as u64;
        dc.send(ChannelFrame::Chunk(chunk.data).encode()?).await?;
        sent += len;
        trace!(event = "chunk_sent", id = %meta.id, seq = chunk.seq, sent, "Chunk sent");
        on_progress(sent);
    }

    reader
        .await
        .map_err(|e| anyhow!("Reader task failed: {e}"))??;
    if sent != meta.size {
        return Err(anyhow!("Source ended after {sent} of {} bytes", meta.size));
    }

    dc.send(ChannelFrame::FileComplete { id: meta.id }.encode()?)
        .await?;
    Ok(())
}

// ── MIME ──────────────────────────────────────────────────────────────────────

/// Guess a MIME type from the file extension.
pub fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        _ => DEFAULT_MIME_TYPE,
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
