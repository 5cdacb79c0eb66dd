//! Retention memory placement
//!
//! The only place a `#[link_section = ".rtc.data"]` static lives. RTC slow
//! memory keeps its contents through deep sleep but not through power loss;
//! after a power-on the bootloader loads the initial value, and the magic
//! word in [`RetentionState`] catches anything else.

use core::sync::atomic::{AtomicBool, Ordering};
use station_core::RetentionState;

#[link_section = ".rtc.data"]
static mut RETENTION: RetentionState = RetentionState::new();

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Hand out the retention state. Only the first call gets it, so there is
/// never more than one live `&mut`.
pub fn take() -> Option<&'static mut RetentionState> {
    if TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // SAFETY: guarded by TAKEN above, and nothing else names RETENTION
    Some(unsafe { &mut *core::ptr::addr_of_mut!(RETENTION) })
}
