// Install a firmware image dropped onto mounted storage

use std::fs;
use std::path::Path;

use super::{FirmwareFlash, FwUpdater, OtaError};

pub const PENDING_IMAGE: &str = "firmware.bin";
/// Optional sidecar holding the image's hex SHA-256
pub const PENDING_DIGEST: &str = "firmware.bin.sha256";
pub const INSTALLED_IMAGE: &str = "firmware_installed.bin";
pub const REJECTED_IMAGE: &str = "firmware_rejected.bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageInstall {
    /// No image waiting
    Nothing,
    /// Flashed and selected for next boot; the caller should restart
    Installed { version: String },
    /// The image was not installed and has been moved aside
    Rejected(OtaError),
    /// The running slot is the only one; boot the factory image and retry
    NeedsFactory,
    /// Left in place to retry on a later cycle
    Deferred(OtaError),
}

fn parse_hex_digest(text: &str) -> Option<[u8; 32]> {
    let hex = text.split_whitespace().next()?;
    if hex.len() != 64 {
        return None;
    }
    let mut digest = [0u8; 32];
    for (i, byte) in digest.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(digest)
}

/// Move `from` to `to`, falling back to deleting it so the same image is
/// never flashed on every boot
fn retire(from: &Path, to: &Path) {
    if let Err(e) = fs::rename(from, to) {
        log::warn!("Could not rename {} ({}), removing it", from.display(), e);
        if let Err(e) = fs::remove_file(from) {
            log::error!("Could not remove {}: {}", from.display(), e);
        }
    }
}

pub fn install_pending_image<F: FirmwareFlash>(
    updater: &mut FwUpdater<F>,
    dir: &Path,
) -> StorageInstall {
    let image = dir.join(PENDING_IMAGE);
    let size = match fs::metadata(&image) {
        Ok(meta) if meta.is_file() => meta.len() as usize,
        _ => return StorageInstall::Nothing,
    };
    log::info!("Found firmware image {} ({} bytes)", image.display(), size);

    let digest_path = dir.join(PENDING_DIGEST);
    let digest = fs::read_to_string(&digest_path).ok().and_then(|text| {
        let digest = parse_hex_digest(&text);
        if digest.is_none() {
            log::warn!("Ignoring malformed {}", digest_path.display());
        }
        digest
    });

    let result = updater.begin(size).and_then(|()| {
        if let Some(digest) = digest {
            updater.expect_sha256(digest)?;
        }
        updater.write_from_file(&image)?;
        let version = updater
            .candidate()
            .map(|c| c.version.clone())
            .unwrap_or_default();
        updater.end()?;
        Ok(version)
    });

    match result {
        Ok(version) => {
            log::info!("Firmware {} installed from storage", version);
            retire(&image, &dir.join(INSTALLED_IMAGE));
            let _ = fs::remove_file(&digest_path);
            StorageInstall::Installed { version }
        }
        Err(OtaError::PartitionInUse) => StorageInstall::NeedsFactory,
        Err(e @ OtaError::PendingVerify) => {
            log::warn!("Running image not yet verified, keeping {} for later", image.display());
            updater.reset();
            StorageInstall::Deferred(e)
        }
        Err(e) => {
            log::error!("Firmware from storage not installed: {} ({})", e, e.code());
            updater.reset();
            retire(&image, &dir.join(REJECTED_IMAGE));
            let _ = fs::remove_file(&digest_path);
            StorageInstall::Rejected(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::{AppDescriptor, UpdateState};
    use crate::sim::{build_image, SimFlash};
    use sha2::{Digest, Sha256};
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("station-ota-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn image(version: &str) -> Vec<u8> {
        let desc = AppDescriptor {
            version: version.to_string(),
            ..AppDescriptor::default()
        };
        build_image(&desc, 2_000)
    }

    #[test]
    fn test_nothing_pending() {
        let dir = scratch("none");
        let mut fw = FwUpdater::new(SimFlash::dual_slot());
        assert_eq!(install_pending_image(&mut fw, &dir), StorageInstall::Nothing);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_install_renames_image() {
        let dir = scratch("install");
        let bytes = image("0.9.0");
        fs::write(dir.join(PENDING_IMAGE), &bytes).unwrap();
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        fs::write(dir.join(PENDING_DIGEST), format!("{}  firmware.bin\n", hex)).unwrap();

        let flash = SimFlash::dual_slot();
        let mut fw = FwUpdater::new(flash.clone());
        let outcome = install_pending_image(&mut fw, &dir);

        assert_eq!(outcome, StorageInstall::Installed { version: "0.9.0".to_string() });
        assert_eq!(fw.state(), UpdateState::Committed);
        assert_eq!(flash.contents("ota_1"), bytes);
        assert!(!dir.join(PENDING_IMAGE).exists());
        assert!(dir.join(INSTALLED_IMAGE).exists());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_bad_image_is_moved_aside() {
        let dir = scratch("reject");
        fs::write(dir.join(PENDING_IMAGE), b"not firmware at all").unwrap();

        let flash = SimFlash::dual_slot();
        let mut fw = FwUpdater::new(flash.clone());
        let outcome = install_pending_image(&mut fw, &dir);

        assert_eq!(outcome, StorageInstall::Rejected(OtaError::InvalidMagicByte));
        assert_eq!(fw.state(), UpdateState::Idle);
        assert!(dir.join(REJECTED_IMAGE).exists());
        assert!(flash.boot_label().is_none());
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_digest_mismatch_rejects() {
        let dir = scratch("digest");
        fs::write(dir.join(PENDING_IMAGE), image("0.9.1")).unwrap();
        fs::write(dir.join(PENDING_DIGEST), "00".repeat(32)).unwrap();

        let mut fw = FwUpdater::new(SimFlash::dual_slot());
        let outcome = install_pending_image(&mut fw, &dir);
        assert_eq!(outcome, StorageInstall::Rejected(OtaError::ChecksumFailed));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_hex_digest_parsing() {
        assert!(parse_hex_digest("abc").is_none());
        assert!(parse_hex_digest(&"zz".repeat(32)).is_none());
        assert_eq!(parse_hex_digest(&"ff".repeat(32)), Some([0xff; 32]));
    }
}
