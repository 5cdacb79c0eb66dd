// Firmware image inspection, matching what the station checks before
// flashing

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use station_core::ota::{AppDescriptor, HEADER_LEN};

pub struct ImageInfo {
    pub descriptor: AppDescriptor,
    pub size: usize,
    pub sha256: [u8; 32],
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn inspect(data: &[u8]) -> Result<ImageInfo> {
    if data.len() < HEADER_LEN {
        bail!("image is only {} bytes, too short to hold a descriptor", data.len());
    }
    let descriptor = AppDescriptor::parse(&data[..HEADER_LEN])
        .map_err(|e| anyhow::anyhow!("not a station firmware image: {}", e))?;
    Ok(ImageInfo {
        descriptor,
        size: data.len(),
        sha256: Sha256::digest(data).into(),
    })
}

pub fn load(path: &Path) -> Result<(Vec<u8>, ImageInfo)> {
    let data = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let info = inspect(&data)?;
    Ok((data, info))
}

/// `firmware.bin` -> `firmware.bin.sha256`, the sidecar the station reads
/// next to an image on its storage partition
pub fn digest_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

pub fn write_digest(image: &Path, info: &ImageInfo) -> Result<PathBuf> {
    let path = digest_path(image);
    fs::write(&path, format!("{}\n", hex(&info.sha256)))
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
