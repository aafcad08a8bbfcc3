//! Write-to-temp-then-rename.
//!
//! Used for the device identity file and for every received file, so a
//! crash never leaves a half-written file under the final name. The temp
//! file is the `.part` sibling of the target and is removed again if the
//! rename fails. Parent directories are created as needed.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::error;

/// `name.ext` -> `name.ext.part`
fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn report(stage: &'static str, path: &Path, e: &std::io::Error) {
    error!(event = "atomic_write_failure", stage, path = %path.display(), error = %e, "Atomic write failed");
}

pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    let part = temp_path(path);

    if let Err(e) = std::fs::write(&part, content) {
        report("write", &part, &e);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&part, path) {
        report("rename", path, &e);
        let _ = std::fs::remove_file(&part);
        return Err(e.into());
    }
    Ok(())
}

/// [`atomic_write`] on the tokio blocking-aware fs API.
pub async fn atomic_write_async(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Cannot create {}", parent.display()))?;
    }
    let part = temp_path(path);

    if let Err(e) = tokio::fs::write(&part, content).await {
        report("write", &part, &e);
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&part, path).await {
        report("rename", path, &e);
        let _ = tokio::fs::remove_file(&part).await;
        return Err(e.into());
    }
    Ok(())
}
