// Storage partition for pending firmware images and the config file

use anyhow::Result;
use esp_idf_sys::{esp, esp_vfs_spiffs_conf_t, esp_vfs_spiffs_register};
use std::ffi::CString;
use std::path::PathBuf;

pub const MOUNT_POINT: &str = "/storage";
pub const CONFIG_FILE: &str = "/storage/config.json";
const PARTITION_LABEL: &str = "storage";

/// Mount the SPIFFS partition. Returns the mount point for the scheduler's
/// storage directory.
pub fn mount() -> Result<PathBuf> {
    let base = CString::new(MOUNT_POINT)?;
    let label = CString::new(PARTITION_LABEL)?;
    let conf = esp_vfs_spiffs_conf_t {
        base_path: base.as_ptr(),
        partition_label: label.as_ptr(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    // The VFS keeps its own copies of both strings
    esp!(unsafe { esp_vfs_spiffs_register(&conf) })?;
    log::info!("Storage mounted at {}", MOUNT_POINT);
    Ok(PathBuf::from(MOUNT_POINT))
}
