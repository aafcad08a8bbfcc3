//! Global data directory for persistent storage.
//!
//! Defaults to `~/.roomdrop/` but can be overridden via `--conf`.
//! Holds the device identity file and the peer-mode log file.
//! Must be initialized once at startup via `init()`.

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static DATA_DIR: OnceLock<PathBuf> = OnceLock::new();

/// Resolve the data directory without touching global state.
pub fn resolve(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => dirs::home_dir()
            .map(|home| home.join(".roomdrop"))
            .ok_or_else(|| anyhow!("No home directory found; pass --conf")),
    }
}

/// Initialize the global data directory.
///
/// If `custom` is `Some`, uses that path. Otherwise falls back to `~/.roomdrop/`.
pub fn init(custom: Option<&Path>) -> Result<&'static Path> {
    let dir = resolve(custom)?;
    DATA_DIR
        .set(dir)
        .map_err(|_| anyhow!("data_dir::init() called more than once"))?;
    get()
}

/// Returns the global data directory path.
pub fn get() -> Result<&'static Path> {
    DATA_DIR
        .get()
        .map(PathBuf::as_path)
        .ok_or_else(|| anyhow!("data_dir not initialized; call data_dir::init() first"))
}
