// Deep sleep entry and wake cause

use esp_idf_sys::gpio_num_t;
use station_core::scheduler::WakeCause;

pub fn wake_cause() -> WakeCause {
    use esp_idf_sys::*;
    let cause = unsafe { esp_sleep_get_wakeup_cause() };
    match cause {
        c if c == esp_sleep_source_t_ESP_SLEEP_WAKEUP_TIMER => WakeCause::Timer,
        c if c == esp_sleep_source_t_ESP_SLEEP_WAKEUP_EXT0 => WakeCause::Button,
        // Power-on, reset, or a restart after an update
        _ => WakeCause::ColdBoot,
    }
}

/// Sleep for `duration_ms`, or until the action button pulls `button` low
pub fn deep_sleep(duration_ms: u64, button: gpio_num_t) -> ! {
    log::info!("Entering deep sleep for {} ms", duration_ms);
    unsafe {
        esp_idf_sys::esp_sleep_enable_ext0_wakeup(button, 0);
        esp_idf_sys::esp_sleep_enable_timer_wakeup(duration_ms.saturating_mul(1000));
        esp_idf_sys::esp_deep_sleep_start();
    }
}
