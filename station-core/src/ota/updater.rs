// Firmware updater state machine

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::time::Duration;

use super::image::{AppDescriptor, HEADER_LEN, IMAGE_MAGIC};
use super::{FirmwareFlash, FlashError, OtaError, Partition};
use crate::network::{BasicAuth, Transport};

/// Read size for the streaming helpers
pub const CHUNK_SIZE: usize = 16 * 1024;

pub type ProgressFn = Box<dyn FnMut(usize, usize) + Send>;
/// Called with (running, candidate); returning false rejects the image
pub type ValidateFn = Box<dyn FnMut(&AppDescriptor, &AppDescriptor) -> bool + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    InProgress,
    Committed,
    Failed,
}

struct Session {
    target: Partition,
    written: usize,
    total: usize,
    /// Image bytes held back until the descriptor has been checked
    header: Vec<u8>,
    header_checked: bool,
    hasher: Sha256,
    expected_sha256: Option<[u8; 32]>,
    candidate: Option<AppDescriptor>,
}

pub struct FwUpdater<F: FirmwareFlash> {
    flash: F,
    state: UpdateState,
    session: Option<Session>,
    last_error: Option<OtaError>,
    on_progress: Option<ProgressFn>,
    on_validate: Option<ValidateFn>,
}

impl<F: FirmwareFlash> FwUpdater<F> {
    pub fn new(flash: F) -> Self {
        Self {
            flash,
            state: UpdateState::Idle,
            session: None,
            last_error: None,
            on_progress: None,
            on_validate: None,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn on_progress(&mut self, callback: ProgressFn) {
        self.on_progress = Some(callback);
    }

    pub fn on_validate(&mut self, callback: ValidateFn) {
        self.on_validate = Some(callback);
    }

    pub fn state(&self) -> UpdateState {
        self.state
    }

    pub fn error(&self) -> Option<&OtaError> {
        self.last_error.as_ref()
    }

    pub fn error_str(&self) -> &'static str {
        self.last_error.as_ref().map(OtaError::code).unwrap_or("OK")
    }

    /// (bytes written to flash, expected total)
    pub fn progress(&self) -> (usize, usize) {
        self.session
            .as_ref()
            .map(|s| (s.written, s.total))
            .unwrap_or((0, 0))
    }

    pub fn target(&self) -> Option<&Partition> {
        self.session.as_ref().map(|s| &s.target)
    }

    /// Descriptor of the image being written, once its header has arrived
    pub fn candidate(&self) -> Option<&AppDescriptor> {
        self.session.as_ref().and_then(|s| s.candidate.as_ref())
    }

    /// Open a session on the next free OTA partition. `expected_size` of 0
    /// means "up to the partition size".
    pub fn begin(&mut self, expected_size: usize) -> Result<(), OtaError> {
        match self.state {
            UpdateState::InProgress => {
                log::warn!("Update in progress, call end() or cancel() before begin()");
                return Err(OtaError::InvalidState);
            }
            UpdateState::Failed => {
                log::warn!("Previous update failed, call reset() before begin()");
                return Err(OtaError::InvalidState);
            }
            UpdateState::Idle | UpdateState::Committed => {}
        }
        self.last_error = None;

        let table = self.flash.partitions();
        let running = match self.flash.running() {
            Ok(running) => running,
            Err(e) => {
                log::error!("Cannot tell which partition is running: {}", e);
                let err = OtaError::Unspecified(e.to_string());
                self.last_error = Some(err.clone());
                return Err(err);
            }
        };
        let target = match table.next_update_partition(&running) {
            Ok(target) => target.clone(),
            Err(e) => {
                match e {
                    OtaError::PartitionInUse => {
                        log::warn!("Single OTA partition '{}' is running, reboot to factory to flash", running.label)
                    }
                    _ => log::error!("No free OTA partition, cannot update"),
                }
                self.last_error = Some(e.clone());
                return Err(e);
            }
        };

        if let Err(e) = self.flash.begin(&target, expected_size) {
            let err = match &e {
                FlashError::PendingVerify => OtaError::PendingVerify,
                other => OtaError::Unspecified(other.to_string()),
            };
            log::error!("OTA begin failed: {} ({})", err.code(), e);
            self.last_error = Some(err.clone());
            return Err(err);
        }

        let total = if expected_size > 0 {
            expected_size
        } else {
            target.size as usize
        };
        log::info!(
            "Flashing firmware to '{}' at {:#x} ({} bytes)...",
            target.label,
            target.address,
            total
        );
        self.session = Some(Session {
            target,
            written: 0,
            total,
            header: Vec::with_capacity(HEADER_LEN),
            header_checked: false,
            hasher: Sha256::new(),
            expected_sha256: None,
            candidate: None,
        });
        self.state = UpdateState::InProgress;
        Ok(())
    }

    /// Require the finished image to hash to `digest`
    pub fn expect_sha256(&mut self, digest: [u8; 32]) -> Result<(), OtaError> {
        match (self.state, self.session.as_mut()) {
            (UpdateState::InProgress, Some(session)) => {
                session.expected_sha256 = Some(digest);
                Ok(())
            }
            _ => Err(OtaError::InvalidState),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), OtaError> {
        if self.state != UpdateState::InProgress || self.session.is_none() {
            return Err(OtaError::InvalidState);
        }
        let result = self.write_inner(data);
        if let Err(e) = &result {
            self.fail(e.clone());
        }
        result
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<(), OtaError> {
        let Self {
            flash,
            session,
            on_progress,
            on_validate,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Err(OtaError::InvalidState);
        };
        if data.is_empty() {
            return Ok(());
        }

        if session.header_checked {
            return flush(flash, session, on_progress, data);
        }

        if session.header.is_empty() && data[0] != IMAGE_MAGIC {
            log::error!("OTA image has invalid magic byte {:#04x}", data[0]);
            return Err(OtaError::InvalidMagicByte);
        }
        let take = (HEADER_LEN - session.header.len()).min(data.len());
        session.header.extend_from_slice(&data[..take]);
        if session.header.len() < HEADER_LEN {
            return Ok(());
        }

        let candidate = AppDescriptor::parse(&session.header)?;
        log::info!("New image information:");
        log::info!("  Project name: {}", candidate.project_name);
        log::info!("  Version: {}", candidate.version);
        log::info!("  Compile date: {} {}", candidate.date, candidate.time);
        log::info!("  IDF version: {}", candidate.idf_version);

        if let Some(validate) = on_validate.as_mut() {
            let running = flash.running_descriptor();
            if !validate(&running, &candidate) {
                log::warn!("Image {} rejected by validation hook", candidate.version);
                return Err(OtaError::UserAborted);
            }
        }
        session.candidate = Some(candidate);
        session.header_checked = true;

        let header = std::mem::take(&mut session.header);
        flush(flash, session, on_progress, &header)?;
        flush(flash, session, on_progress, &data[take..])
    }

    /// Finalize the image and point the bootloader at it
    pub fn end(&mut self) -> Result<(), OtaError> {
        if self.state != UpdateState::InProgress {
            return Err(OtaError::InvalidState);
        }
        let Some(session) = self.session.take() else {
            return Err(OtaError::InvalidState);
        };

        if !session.header_checked {
            log::error!("Image ended after {} bytes, before its header was complete", session.header.len());
            self.flash.abort();
            return Err(self.fail(OtaError::ChecksumFailed));
        }

        if let Some(expected) = session.expected_sha256 {
            let actual: [u8; 32] = session.hasher.finalize().into();
            if actual != expected {
                log::error!("Image SHA-256 mismatch");
                self.flash.abort();
                return Err(self.fail(OtaError::ChecksumFailed));
            }
        }

        if let Err(e) = self.flash.finish() {
            log::error!("OTA end failed: {}", e);
            let err = match e {
                FlashError::ValidateFailed => OtaError::ChecksumFailed,
                other => OtaError::Unspecified(other.to_string()),
            };
            return Err(self.fail(err));
        }

        if let Err(e) = self.flash.set_boot(&session.target) {
            log::error!("Set boot partition failed: {}", e);
            return Err(self.fail(OtaError::SetBootFailed));
        }

        log::info!(
            "Firmware successfully flashed to '{}' ({} bytes)",
            session.target.label,
            session.written
        );
        self.state = UpdateState::Committed;
        self.last_error = None;
        Ok(())
    }

    /// Drop any session and return to `Idle`, clearing a failure
    pub fn reset(&mut self) {
        if self.session.take().is_some() {
            self.flash.abort();
        }
        self.state = UpdateState::Idle;
        self.last_error = None;
    }

    pub fn cancel(&mut self) {
        if self.state == UpdateState::InProgress {
            log::info!("OTA session cancelled");
        }
        self.reset();
    }

    fn fail(&mut self, err: OtaError) -> OtaError {
        if self.session.take().is_some() {
            self.flash.abort();
        }
        self.state = UpdateState::Failed;
        self.last_error = Some(err.clone());
        err
    }

    /// Stream everything from `reader` into the open session
    pub fn write_from_reader(&mut self, reader: &mut dyn Read) -> Result<usize, OtaError> {
        if self.state != UpdateState::InProgress {
            return Err(OtaError::InvalidState);
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Firmware read failed after {} bytes: {}", total, e);
                    return Err(self.fail(OtaError::ReadError(e.to_string())));
                }
            };
            self.write(&buf[..n])?;
            total += n;
        }
        Ok(total)
    }

    pub fn write_from_file(&mut self, path: &Path) -> Result<usize, OtaError> {
        if self.state != UpdateState::InProgress {
            return Err(OtaError::InvalidState);
        }
        log::info!("Reading firmware from '{}'...", path.display());
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                log::error!("Unable to open firmware file: {}", e);
                return Err(self.fail(OtaError::ReadError(e.to_string())));
            }
        };
        self.write_from_reader(&mut file)
    }

    pub fn write_from_url(
        &mut self,
        transport: &mut dyn Transport,
        url: &str,
        auth: Option<&BasicAuth>,
        timeout: Duration,
    ) -> Result<usize, OtaError> {
        if self.state != UpdateState::InProgress {
            return Err(OtaError::InvalidState);
        }
        log::info!("Reading firmware from '{}'...", url);
        let mut download = match transport.open(url, auth, timeout) {
            Ok(download) => download,
            Err(e) => {
                log::error!("Firmware download failed: {}", e);
                return Err(self.fail(OtaError::ReadError(e.to_string())));
            }
        };
        self.write_from_reader(&mut download.body)
    }

    /// Cancel the bootloader's rollback once the new image has proven
    /// itself, and free the partition it replaced. Returns true when the
    /// running image was pending verification.
    pub fn mark_app_valid(&mut self) -> bool {
        if !self.flash.rollback_possible() {
            return false;
        }
        match self.flash.mark_valid() {
            Ok(()) => {
                log::info!("The running app has been marked as valid");
                if let Err(e) = self.flash.erase_previous() {
                    log::warn!("Could not erase the previous app partition: {}", e);
                }
                true
            }
            Err(e) => {
                log::error!("Failed to mark app valid: {}", e);
                false
            }
        }
    }

    /// Give up on the running image and reboot into the previous one
    pub fn rollback(&mut self) -> Result<(), OtaError> {
        if !self.flash.rollback_possible() {
            log::warn!("Rollback requested but no previous image is pending");
            return Ok(());
        }
        self.flash
            .mark_invalid_and_reboot()
            .map_err(|e| OtaError::Unspecified(e.to_string()))
    }

    pub fn reboot_to_factory(&mut self) -> Result<(), OtaError> {
        let factory = self
            .flash
            .partitions()
            .factory()
            .cloned()
            .ok_or(OtaError::NoFreePartition)?;
        self.flash.set_boot(&factory).map_err(|e| {
            log::error!("Cannot select factory image: {}", e);
            OtaError::SetBootFailed
        })?;
        log::warn!("Rebooting to factory image");
        self.flash.restart();
        Ok(())
    }
}

fn flush<F: FirmwareFlash>(
    flash: &mut F,
    session: &mut Session,
    on_progress: &mut Option<ProgressFn>,
    data: &[u8],
) -> Result<(), OtaError> {
    if data.is_empty() {
        return Ok(());
    }
    if let Err(e) = flash.write(data) {
        log::error!(
            "Flash write failed ({} bytes at {}): {}",
            data.len(),
            session.written,
            e
        );
        return Err(OtaError::WriteFailed);
    }
    session.hasher.update(data);
    session.written += data.len();
    if let Some(progress) = on_progress.as_mut() {
        progress(session.written, session.total);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ota::{PartitionKind, PartitionTable};
    use crate::sim::{build_image, RecordingTransport, SimFlash};
    use std::sync::{Arc, Mutex};

    fn descriptor(version: &str) -> AppDescriptor {
        AppDescriptor {
            version: version.to_string(),
            project_name: "solar-station".to_string(),
            date: "Oct 16 2026".to_string(),
            time: "08:00:00".to_string(),
            ..AppDescriptor::default()
        }
    }

    fn updater() -> (FwUpdater<SimFlash>, SimFlash) {
        let flash = SimFlash::dual_slot();
        (FwUpdater::new(flash.clone()), flash)
    }

    #[test]
    fn test_full_update_commits_and_sets_boot() {
        let (mut fw, flash) = updater();
        let image = build_image(&descriptor("0.4.0"), 5_000);

        fw.begin(image.len()).unwrap();
        assert_eq!(fw.target().unwrap().label, "ota_1");
        for chunk in image.chunks(700) {
            fw.write(chunk).unwrap();
        }
        assert_eq!(fw.progress(), (image.len(), image.len()));
        fw.end().unwrap();

        assert_eq!(fw.state(), UpdateState::Committed);
        assert_eq!(flash.boot_label().as_deref(), Some("ota_1"));
        assert_eq!(flash.contents("ota_1"), image);
        assert_eq!(fw.error_str(), "OK");
    }

    #[test]
    fn test_wrong_magic_fails_without_writing() {
        let (mut fw, flash) = updater();
        fw.begin(0).unwrap();
        let err = fw.write(b"PK\x03\x04 definitely a zip").unwrap_err();
        assert_eq!(err, OtaError::InvalidMagicByte);
        assert_eq!(fw.state(), UpdateState::Failed);
        assert_eq!(fw.progress(), (0, 0));
        assert!(flash.contents("ota_1").is_empty());
        assert_eq!(fw.error_str(), "ERR_INVALID_MAGIC_BYTE");
    }

    #[test]
    fn test_failed_session_requires_reset() {
        let (mut fw, _flash) = updater();
        fw.begin(0).unwrap();
        let _ = fw.write(&[0u8; 4]);
        assert_eq!(fw.begin(0), Err(OtaError::InvalidState));
        fw.reset();
        assert!(fw.begin(0).is_ok());
    }

    #[test]
    fn test_begin_twice_is_invalid() {
        let (mut fw, _flash) = updater();
        fw.begin(0).unwrap();
        assert_eq!(fw.begin(0), Err(OtaError::InvalidState));
        assert_eq!(fw.state(), UpdateState::InProgress);
    }

    #[test]
    fn test_single_slot_running_is_in_use() {
        let table = PartitionTable::new(vec![
            Partition::new("factory", PartitionKind::Factory, 0x10000, 0x100000),
            Partition::new("ota_0", PartitionKind::Ota(0), 0x110000, 0x100000),
        ]);
        let flash = SimFlash::new(table, "ota_0");
        let mut fw = FwUpdater::new(flash.clone());
        assert_eq!(fw.begin(0), Err(OtaError::PartitionInUse));
        assert_eq!(fw.state(), UpdateState::Idle);
        assert!(flash.contents("ota_0").is_empty());
        assert_eq!(flash.begin_calls(), 0);
    }

    #[test]
    fn test_unmapped_running_partition_refuses_to_begin() {
        let table = PartitionTable::new(vec![
            Partition::new("ota_0", PartitionKind::Ota(0), 0x110000, 0x100000),
            Partition::new("ota_1", PartitionKind::Ota(1), 0x210000, 0x100000),
        ]);
        let flash = SimFlash::new(table, "test");
        let mut fw = FwUpdater::new(flash.clone());
        assert!(matches!(fw.begin(0), Err(OtaError::Unspecified(_))));
        assert_eq!(fw.state(), UpdateState::Idle);
        assert_eq!(fw.error_str(), "ERR_UNSPECIFIED");
        assert_eq!(flash.begin_calls(), 0);
    }

    #[test]
    fn test_write_from_url_streams_the_download() {
        let (mut fw, flash) = updater();
        let image = build_image(&descriptor("0.6.0"), 40_000);
        let mut transport = RecordingTransport::new();
        transport.serve("http://collector.local/fw.bin", image.clone());
        let timeout = Duration::from_secs(5);

        fw.begin(image.len()).unwrap();
        let n = fw
            .write_from_url(&mut transport, "http://collector.local/fw.bin", None, timeout)
            .unwrap();
        assert_eq!(n, image.len());
        fw.end().unwrap();
        assert_eq!(flash.contents("ota_1"), image);

        fw.begin(0).unwrap();
        let err = fw
            .write_from_url(&mut transport, "http://collector.local/missing.bin", None, timeout)
            .unwrap_err();
        assert!(matches!(err, OtaError::ReadError(_)));
        assert_eq!(fw.state(), UpdateState::Failed);
    }

    #[test]
    fn test_validation_hook_can_reject() {
        let (mut fw, flash) = updater();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_hook = seen.clone();
        fw.on_validate(Box::new(move |running, candidate| {
            *seen_in_hook.lock().unwrap() = Some((running.version.clone(), candidate.version.clone()));
            !candidate.same_build(running)
        }));

        let image = build_image(&flash.running_descriptor(), 1_000);
        fw.begin(0).unwrap();
        assert_eq!(fw.write(&image), Err(OtaError::UserAborted));
        assert!(flash.contents("ota_1").is_empty());
        let (running, candidate) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(running, candidate);
    }

    #[test]
    fn test_header_split_across_writes_is_buffered() {
        let (mut fw, flash) = updater();
        let image = build_image(&descriptor("0.5.0"), 100);
        fw.begin(0).unwrap();
        fw.write(&image[..10]).unwrap();
        fw.write(&image[10..200]).unwrap();
        assert!(flash.contents("ota_1").is_empty(), "header held back");
        assert!(fw.candidate().is_none());
        fw.write(&image[200..]).unwrap();
        assert_eq!(fw.candidate().unwrap().version, "0.5.0");
        assert_eq!(flash.contents("ota_1"), image);
    }

    #[test]
    fn test_progress_callback_sees_every_flush() {
        let (mut fw, _flash) = updater();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        fw.on_progress(Box::new(move |written, total| log.lock().unwrap().push((written, total))));

        let image = build_image(&descriptor("0.5.0"), 712);
        fw.begin(image.len()).unwrap();
        fw.write(&image[..500]).unwrap();
        fw.write(&image[500..]).unwrap();
        assert_eq!(*calls.lock().unwrap(), vec![(288, 1000), (500, 1000), (1000, 1000)]);
    }

    #[test]
    fn test_write_failure_is_session_fatal() {
        let (mut fw, flash) = updater();
        flash.fail_writes(true);
        fw.begin(0).unwrap();
        let image = build_image(&descriptor("0.5.0"), 100);
        assert_eq!(fw.write(&image), Err(OtaError::WriteFailed));
        assert_eq!(fw.state(), UpdateState::Failed);
        assert_eq!(fw.write(&image), Err(OtaError::InvalidState));
    }

    #[test]
    fn test_platform_validation_failure_is_checksum_error() {
        let (mut fw, flash) = updater();
        flash.fail_validation(true);
        fw.begin(0).unwrap();
        fw.write(&build_image(&descriptor("0.5.0"), 100)).unwrap();
        assert_eq!(fw.end(), Err(OtaError::ChecksumFailed));
        assert!(flash.boot_label().is_none());
    }

    #[test]
    fn test_sha256_expectation() {
        let image = build_image(&descriptor("0.5.0"), 300);

        let (mut fw, flash) = updater();
        fw.begin(0).unwrap();
        fw.expect_sha256(Sha256::digest(&image).into()).unwrap();
        fw.write(&image).unwrap();
        fw.end().unwrap();
        assert!(flash.boot_label().is_some());

        let (mut fw, flash) = updater();
        fw.begin(0).unwrap();
        fw.expect_sha256([0u8; 32]).unwrap();
        fw.write(&image).unwrap();
        assert_eq!(fw.end(), Err(OtaError::ChecksumFailed));
        assert!(flash.boot_label().is_none());
    }

    #[test]
    fn test_truncated_image_fails_on_end() {
        let (mut fw, _flash) = updater();
        fw.begin(0).unwrap();
        fw.write(&build_image(&descriptor("0.5.0"), 0)[..100]).unwrap();
        assert_eq!(fw.end(), Err(OtaError::ChecksumFailed));
    }

    #[test]
    fn test_set_boot_failure() {
        let (mut fw, flash) = updater();
        flash.fail_set_boot(true);
        fw.begin(0).unwrap();
        fw.write(&build_image(&descriptor("0.5.0"), 10)).unwrap();
        assert_eq!(fw.end(), Err(OtaError::SetBootFailed));
    }

    #[test]
    fn test_pending_verify_blocks_begin() {
        let (mut fw, flash) = updater();
        flash.set_pending_verify(true);
        assert_eq!(fw.begin(0), Err(OtaError::PendingVerify));
        assert!(fw.mark_app_valid());
        assert!(fw.begin(0).is_ok());
    }

    #[test]
    fn test_mark_valid_erases_previous() {
        let (mut fw, flash) = updater();
        assert!(!fw.mark_app_valid(), "nothing to verify");
        flash.set_pending_verify(true);
        assert!(fw.mark_app_valid());
        assert!(!flash.pending_verify());
        assert_eq!(flash.erased_previous(), 1);
    }

    #[test]
    fn test_rollback_only_when_pending() {
        let (mut fw, flash) = updater();
        fw.rollback().unwrap();
        assert_eq!(flash.restarts(), 0);
        flash.set_pending_verify(true);
        fw.rollback().unwrap();
        assert_eq!(flash.restarts(), 1);
        assert!(flash.running_invalidated());
    }

    #[test]
    fn test_reboot_to_factory() {
        let (mut fw, flash) = updater();
        fw.reboot_to_factory().unwrap();
        assert_eq!(flash.boot_label().as_deref(), Some("factory"));
        assert_eq!(flash.restarts(), 1);
    }

    #[test]
    fn test_read_error_from_reader() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(ErrorKind::ConnectionReset, "gone"))
            }
        }
        let (mut fw, _flash) = updater();
        fw.begin(0).unwrap();
        assert!(matches!(fw.write_from_reader(&mut Broken), Err(OtaError::ReadError(_))));
        assert_eq!(fw.state(), UpdateState::Failed);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let (mut fw, _flash) = updater();
        fw.begin(0).unwrap();
        let err = fw.write_from_file(Path::new("/nonexistent/firmware.bin")).unwrap_err();
        assert_eq!(err.code(), "ERR_READ_ERROR");
    }
}
