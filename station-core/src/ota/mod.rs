// OTA firmware updates: partition selection, image header checks, streamed
// writing and the bootloader's verify/rollback contract

mod image;
mod partition;
mod storage;
mod updater;

pub use image::{read_header, AppDescriptor, APP_DESC_MAGIC, APP_DESC_OFFSET, HEADER_LEN, IMAGE_MAGIC};
pub use partition::{Partition, PartitionKind, PartitionTable};
pub use storage::{install_pending_image, StorageInstall, INSTALLED_IMAGE, PENDING_IMAGE, REJECTED_IMAGE};
pub use updater::{FwUpdater, ProgressFn, UpdateState, ValidateFn, CHUNK_SIZE};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtaError {
    #[error("no free OTA partition")]
    NoFreePartition,
    #[error("the only OTA partition is running; reboot to factory first")]
    PartitionInUse,
    #[error("image does not start with the firmware magic byte")]
    InvalidMagicByte,
    #[error("running image is still pending verification")]
    PendingVerify,
    #[error("flash write failed")]
    WriteFailed,
    #[error("could not set the boot partition")]
    SetBootFailed,
    #[error("image checksum verification failed")]
    ChecksumFailed,
    #[error("updater is in the wrong state for this call")]
    InvalidState,
    #[error("unspecified platform error: {0}")]
    Unspecified(String),
    #[error("failed to read the image source: {0}")]
    ReadError(String),
    #[error("update rejected by the validation hook")]
    UserAborted,
}

impl OtaError {
    /// Short code for status displays and logs
    pub fn code(&self) -> &'static str {
        match self {
            OtaError::NoFreePartition => "ERR_NO_FREE_OTA_PARTITION",
            OtaError::PartitionInUse => "ERR_OTA_PARTITION_IN_USE",
            OtaError::InvalidMagicByte => "ERR_INVALID_MAGIC_BYTE",
            OtaError::PendingVerify => "ERR_PENDING_VERIFY",
            OtaError::WriteFailed => "ERR_WRITE_FAILED",
            OtaError::SetBootFailed => "ERR_SET_BOOT_FAILED",
            OtaError::ChecksumFailed => "ERR_CHECKSUM_FAILED",
            OtaError::InvalidState => "ERR_INVALID_STATE",
            OtaError::Unspecified(_) => "ERR_UNSPECIFIED",
            OtaError::ReadError(_) => "ERR_READ_ERROR",
            OtaError::UserAborted => "ERR_USER_ABORT",
        }
    }
}

/// Failures reported by the flash layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("running image must be verified before another update")]
    PendingVerify,
    #[error("image validation failed")]
    ValidateFailed,
    #[error("running partition '{0}' is not in the partition table")]
    UnknownRunning(String),
    #[error("flash error {0}")]
    Platform(i32),
}

/// Everything the updater needs from the chip's flash and bootloader
pub trait FirmwareFlash {
    fn partitions(&self) -> PartitionTable;
    fn running(&self) -> Result<Partition, FlashError>;
    fn running_descriptor(&self) -> AppDescriptor;

    fn begin(&mut self, target: &Partition, size: usize) -> Result<(), FlashError>;
    fn write(&mut self, data: &[u8]) -> Result<(), FlashError>;
    /// Close the write handle; the platform validates the image here
    fn finish(&mut self) -> Result<(), FlashError>;
    fn abort(&mut self);
    fn set_boot(&mut self, target: &Partition) -> Result<(), FlashError>;

    /// True while the running image is on its unverified first boot
    fn rollback_possible(&self) -> bool;
    fn mark_valid(&mut self) -> Result<(), FlashError>;
    fn erase_previous(&mut self) -> Result<(), FlashError>;
    fn mark_invalid_and_reboot(&mut self) -> Result<(), FlashError>;
    fn restart(&mut self);
}
