// FirmwareFlash backed by the ESP-IDF OTA and partition APIs

use core::ffi::{c_void, CStr};
use esp_idf_sys::{
    esp_app_desc_t, esp_app_get_description, esp_err_t, esp_ota_abort, esp_ota_begin, esp_ota_end,
    esp_ota_erase_last_boot_app_partition, esp_ota_get_running_partition, esp_ota_get_state_partition,
    esp_ota_handle_t, esp_ota_img_states_t, esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY,
    esp_ota_mark_app_invalid_rollback_and_reboot, esp_ota_mark_app_valid_cancel_rollback,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find, esp_partition_get,
    esp_partition_next, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, esp_restart, ESP_ERR_OTA_ROLLBACK_INVALID_STATE,
    ESP_ERR_OTA_VALIDATE_FAILED, ESP_OK, OTA_SIZE_UNKNOWN,
};
use station_core::ota::{AppDescriptor, FirmwareFlash, FlashError, Partition, PartitionKind, PartitionTable};

fn check(code: esp_err_t) -> Result<(), FlashError> {
    match code {
        c if c == ESP_OK as esp_err_t => Ok(()),
        c if c == ESP_ERR_OTA_ROLLBACK_INVALID_STATE as esp_err_t => Err(FlashError::PendingVerify),
        c if c == ESP_ERR_OTA_VALIDATE_FAILED as esp_err_t => Err(FlashError::ValidateFailed),
        c => Err(FlashError::Platform(c)),
    }
}

fn c_field(chars: &[core::ffi::c_char]) -> String {
    let bytes: Vec<u8> = chars.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Safety: `raw` must point at a partition record owned by ESP-IDF, which
/// lives for the whole program
unsafe fn to_partition(raw: *const esp_partition_t) -> Option<Partition> {
    let p = raw.as_ref()?;
    let kind = if p.subtype == esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY {
        PartitionKind::Factory
    } else if (esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN
        ..esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX)
        .contains(&p.subtype)
    {
        PartitionKind::Ota((p.subtype - esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN) as u8)
    } else {
        // Test app partitions are not update targets
        return None;
    };
    let label = CStr::from_ptr(p.label.as_ptr()).to_string_lossy();
    Some(Partition::new(&label, kind, p.address, p.size))
}

/// Every app partition, in flash order, with the raw record it came from
fn app_partitions() -> Vec<(Partition, *const esp_partition_t)> {
    let mut found = Vec::new();
    unsafe {
        let mut it = esp_partition_find(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            core::ptr::null(),
        );
        while !it.is_null() {
            let raw = esp_partition_get(it);
            if let Some(partition) = to_partition(raw) {
                found.push((partition, raw));
            }
            // Releases the iterator itself once it runs out
            it = esp_partition_next(it);
        }
    }
    found.sort_by_key(|(p, _)| p.address);
    found
}

fn lookup(target: &Partition) -> Result<*const esp_partition_t, FlashError> {
    app_partitions()
        .into_iter()
        .find(|(p, _)| p.address == target.address)
        .map(|(_, raw)| raw)
        .ok_or(FlashError::Platform(esp_idf_sys::ESP_ERR_NOT_FOUND as esp_err_t))
}

fn descriptor(desc: &esp_app_desc_t) -> AppDescriptor {
    AppDescriptor {
        secure_version: desc.secure_version,
        version: c_field(&desc.version),
        project_name: c_field(&desc.project_name),
        time: c_field(&desc.time),
        date: c_field(&desc.date),
        idf_version: c_field(&desc.idf_ver),
        elf_sha256: desc.app_elf_sha256,
    }
}

pub struct EspFlash {
    handle: Option<esp_ota_handle_t>,
}

// The partition records are static and the OTA handle is only used from
// whichever thread owns the EspFlash
unsafe impl Send for EspFlash {}

impl EspFlash {
    pub fn new() -> Self {
        Self { handle: None }
    }
}

impl Default for EspFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FirmwareFlash for EspFlash {
    fn partitions(&self) -> PartitionTable {
        PartitionTable::new(app_partitions().into_iter().map(|(p, _)| p).collect())
    }

    fn running(&self) -> Result<Partition, FlashError> {
        let raw = unsafe { esp_ota_get_running_partition() };
        if let Some(partition) = unsafe { to_partition(raw) } {
            return Ok(partition);
        }
        // Null or a test app slot; either way the OTA slots cannot be ranked
        let label = unsafe { raw.as_ref() }
            .map(|p| unsafe { CStr::from_ptr(p.label.as_ptr()) }.to_string_lossy().into_owned())
            .unwrap_or_default();
        Err(FlashError::UnknownRunning(label))
    }

    fn running_descriptor(&self) -> AppDescriptor {
        match unsafe { esp_app_get_description().as_ref() } {
            Some(desc) => descriptor(desc),
            None => AppDescriptor::default(),
        }
    }

    fn begin(&mut self, target: &Partition, size: usize) -> Result<(), FlashError> {
        if let Some(handle) = self.handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
        let raw = lookup(target)?;
        let size = if size == 0 { OTA_SIZE_UNKNOWN as usize } else { size };
        let mut handle: esp_ota_handle_t = 0;
        check(unsafe { esp_ota_begin(raw, size as _, &mut handle) })?;
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let handle = self.handle.ok_or(FlashError::Platform(esp_idf_sys::ESP_ERR_INVALID_STATE as esp_err_t))?;
        check(unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _) })
    }

    fn finish(&mut self) -> Result<(), FlashError> {
        let handle = self
            .handle
            .take()
            .ok_or(FlashError::Platform(esp_idf_sys::ESP_ERR_INVALID_STATE as esp_err_t))?;
        check(unsafe { esp_ota_end(handle) })
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { esp_ota_abort(handle) };
        }
    }

    fn set_boot(&mut self, target: &Partition) -> Result<(), FlashError> {
        let raw = lookup(target)?;
        check(unsafe { esp_ota_set_boot_partition(raw) })
    }

    fn rollback_possible(&self) -> bool {
        let mut state: esp_ota_img_states_t = 0;
        let code = unsafe { esp_ota_get_state_partition(esp_ota_get_running_partition(), &mut state) };
        // The factory image has no OTA state
        check(code).is_ok() && state == esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY
    }

    fn mark_valid(&mut self) -> Result<(), FlashError> {
        check(unsafe { esp_ota_mark_app_valid_cancel_rollback() })
    }

    fn erase_previous(&mut self) -> Result<(), FlashError> {
        check(unsafe { esp_ota_erase_last_boot_app_partition() })
    }

    fn mark_invalid_and_reboot(&mut self) -> Result<(), FlashError> {
        // Only returns when there is nothing to roll back to
        check(unsafe { esp_ota_mark_app_invalid_rollback_and_reboot() })
    }

    fn restart(&mut self) {
        log::warn!("Restarting");
        esp_idf_hal::delay::FreeRtos::delay_ms(500);
        unsafe { esp_restart() };
    }
}

impl Drop for EspFlash {
    fn drop(&mut self) {
        self.abort();
    }
}
