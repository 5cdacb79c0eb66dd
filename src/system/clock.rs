use station_core::clock::Clock;
use std::time::{SystemTime, UNIX_EPOCH};

/// The RTC-backed system clock. It keeps running through deep sleep, so
/// `now_ms` continues across wakes while `since_wake_ms` restarts at boot.
#[derive(Debug, Default)]
pub struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as i64,
            Err(e) => -(e.duration().as_millis() as i64),
        }
    }

    fn set_now_ms(&mut self, ms: i64) {
        let tv = esp_idf_sys::timeval {
            tv_sec: ms.div_euclid(1000) as _,
            tv_usec: (ms.rem_euclid(1000) * 1000) as _,
        };
        let rc = unsafe { esp_idf_sys::settimeofday(&tv, core::ptr::null()) };
        if rc != 0 {
            log::warn!("settimeofday failed ({})", rc);
        }
    }

    fn since_wake_ms(&self) -> u64 {
        (unsafe { esp_idf_sys::esp_timer_get_time() } / 1000) as u64
    }
}
