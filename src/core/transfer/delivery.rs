//! Hand-off of received files.

use crate::utils::atomic_write::atomic_write_async;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};

/// Receives every completed inbound file.
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Store `data` announced as `name`; returns where it ended up.
    async fn deliver(&self, name: &str, mime_type: &str, data: Bytes) -> Result<PathBuf>;
}

/// Writes received files into one directory.
pub struct DirectoryDelivery {
    dir: PathBuf,
}

impl DirectoryDelivery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Delivery for DirectoryDelivery {
    async fn deliver(&self, name: &str, _mime_type: &str, data: Bytes) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = unique_path(&self.dir, &sanitize_file_name(name));
        atomic_write_async(&path, &data).await?;
        Ok(path)
    }
}

/// Reduce a (possibly adversarial) announced name to a single safe file name.
///
/// - Keeps only the last path component (`/` and `\` both separate).
/// - Keeps alphanumeric chars plus `.`, `-`, `_`, `(`, `)` and ` `.
/// - Strips leading dots so nothing becomes hidden or `..`.
/// - Falls back to `"file"` when nothing is left.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | '(' | ')' | ' '))
        .collect();
    let safe = safe.trim().trim_start_matches('.').to_string();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

/// `dir/name`, or `dir/stem (n).ext` with the first free `n`.
pub fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i..]),
        _ => (name, ""),
    };
    (1..)
        .map(|n| dir.join(format!("{stem} ({n}){ext}")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
