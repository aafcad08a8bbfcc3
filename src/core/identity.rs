//! Local device identity.
//!
//! Created on first run and stored as `<data_dir>/device.json`. The id and
//! color never change afterwards; the display name may be overridden per run.

use crate::core::config::DEVICE_COLORS;
use crate::core::protocol::Device;
use crate::utils::atomic_write::atomic_write;
use crate::utils::hash::palette_index;
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

pub const DEVICE_FILE: &str = "device.json";

fn generate() -> Device {
    let device_id = Uuid::new_v4().to_string();
    let device_name = format!("Device-{}", &device_id[..4]);
    let color = color_for(&device_id);
    Device {
        device_id,
        device_name,
        color,
    }
}

fn color_for(device_id: &str) -> String {
    DEVICE_COLORS[palette_index(device_id, DEVICE_COLORS.len())].to_string()
}

/// Load the identity stored in `dir`, creating it when absent or unreadable.
///
/// `name_override` replaces the display name for this process only.
pub fn load_or_create(dir: &Path, name_override: Option<&str>) -> Result<Device> {
    let path = dir.join(DEVICE_FILE);

    let stored = match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str::<Device>(&text) {
            Ok(dev) if !dev.device_id.is_empty() => Some(dev),
            Ok(_) | Err(_) => {
                warn!(
                    event = "identity_corrupt",
                    path = %path.display(),
                    "Stored device identity is invalid, generating a new one"
                );
                None
            }
        },
        Err(_) => None,
    };

    let mut device = match stored {
        Some(dev) => dev,
        None => {
            let dev = generate();
            let json = serde_json::to_vec_pretty(&dev)?;
            atomic_write(&path, &json)
                .with_context(|| format!("Failed to persist identity to {}", path.display()))?;
            info!(
                event = "identity_created",
                device_id = %dev.device_id,
                name = %dev.device_name,
                "Created new device identity"
            );
            dev
        }
    };

    if device.color.is_empty() {
        device.color = color_for(&device.device_id);
    }
    if let Some(name) = name_override.map(str::trim).filter(|n| !n.is_empty()) {
        device.device_name = name.to_string();
    }
    Ok(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roomdrop_test").join("identity").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn created_once_then_reloaded() {
        let dir = test_dir("reload");
        let first = load_or_create(&dir, None).unwrap();
        assert!(first.device_name.starts_with("Device-"));
        assert!(DEVICE_COLORS.contains(&first.color.as_str()));

        let second = load_or_create(&dir, None).unwrap();
        assert_eq!(first, second);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn name_override_is_not_persisted() {
        let dir = test_dir("override");
        let base = load_or_create(&dir, None).unwrap();
        let renamed = load_or_create(&dir, Some("Laptop")).unwrap();
        assert_eq!(renamed.device_id, base.device_id);
        assert_eq!(renamed.device_name, "Laptop");
        assert_eq!(load_or_create(&dir, None).unwrap().device_name, base.device_name);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn corrupt_file_is_replaced() {
        let dir = test_dir("corrupt");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(DEVICE_FILE), "not json").unwrap();
        let dev = load_or_create(&dir, None).unwrap();
        assert!(!dev.device_id.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
