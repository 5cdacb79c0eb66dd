use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::gpio::{AnyIOPin, Input, PinDriver, Pull};
use std::time::{Duration, Instant};

const DEBOUNCE_TIME: Duration = Duration::from_millis(50);

/// The single action button, active low
pub struct ActionButton {
    pin: PinDriver<'static, AnyIOPin, Input>,
    pressed_at: Option<Instant>,
    last_change: Instant,
}

impl ActionButton {
    pub fn new(pin: impl Into<AnyIOPin> + 'static) -> Result<Self> {
        let mut pin = PinDriver::input(pin.into())?;
        pin.set_pull(Pull::Up)?;
        Ok(Self {
            pin,
            pressed_at: None,
            last_change: Instant::now(),
        })
    }

    pub fn is_pressed(&self) -> bool {
        self.pin.is_low()
    }

    /// Block while the button stays down, up to `limit`. Returns how long
    /// it was held in ms.
    pub fn measure_hold(&self, limit: Duration) -> u64 {
        let start = Instant::now();
        while self.is_pressed() && start.elapsed() < limit {
            FreeRtos::delay_ms(10);
        }
        start.elapsed().as_millis() as u64
    }

    /// Non-blocking poll. Returns the hold time once a press is released.
    pub fn poll_release(&mut self) -> Option<u64> {
        let now = Instant::now();
        if now.duration_since(self.last_change) < DEBOUNCE_TIME {
            return None;
        }
        match (self.is_pressed(), self.pressed_at) {
            (true, None) => {
                self.pressed_at = Some(now);
                self.last_change = now;
                None
            }
            (false, Some(at)) => {
                self.pressed_at = None;
                self.last_change = now;
                Some(now.duration_since(at).as_millis() as u64)
            }
            _ => None,
        }
    }
}
