// On-board sensor drivers: four ADC channels (battery, solar, two light
// sensors) and the interrupt-fed anemometer. The I2C/DHT sensor drivers are
// not fitted on this board, so their values report as invalid.

use anyhow::Result;
use core::ffi::c_void;
use esp_idf_hal::adc::attenuation::DB_11;
use esp_idf_hal::adc::oneshot::config::AdcChannelConfig;
use esp_idf_hal::adc::oneshot::{AdcChannelDriver, AdcDriver};
use esp_idf_hal::adc::ADC1;
use esp_idf_hal::gpio::{Gpio1, Gpio2, Gpio3, Gpio4};
use esp_idf_sys::{esp, gpio_num_t};
use std::sync::Arc;
use std::time::Instant;

use station_core::sensors::{
    Anemometer, DriverId, PollContext, PulseCounter, Reading, SensorDriver, SensorError, MIN_WIND_WINDOW_MS,
};

const ADC_MAX: f32 = 4095.0;
const ADC_VREF: f32 = 3.3;

/// Edges seen on the anemometer pin since the counter was armed
static WIND_PULSES: PulseCounter = PulseCounter::new();

type Adc = Arc<AdcDriver<'static, ADC1>>;

/// Battery, solar and the two light sensors, before the divider multiplier
pub struct AdcBank {
    bat: AdcChannelDriver<'static, Gpio1, Adc>,
    sol: AdcChannelDriver<'static, Gpio2, Adc>,
    l1: AdcChannelDriver<'static, Gpio3, Adc>,
    l2: AdcChannelDriver<'static, Gpio4, Adc>,
}

impl AdcBank {
    pub fn new(adc1: ADC1, bat: Gpio1, sol: Gpio2, l1: Gpio3, l2: Gpio4) -> Result<Self> {
        let adc = Arc::new(AdcDriver::new(adc1)?);
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        Ok(Self {
            bat: AdcChannelDriver::new(adc.clone(), bat, &config)?,
            sol: AdcChannelDriver::new(adc.clone(), sol, &config)?,
            l1: AdcChannelDriver::new(adc.clone(), l1, &config)?,
            l2: AdcChannelDriver::new(adc, l2, &config)?,
        })
    }
}

fn volts(raw: u16) -> f32 {
    f32::from(raw) / ADC_MAX * ADC_VREF
}

fn bus(e: esp_idf_sys::EspError) -> SensorError {
    SensorError::Bus(format!("ADC: {}", e))
}

impl SensorDriver for AdcBank {
    fn id(&self) -> DriverId {
        DriverId::Adc
    }

    fn read(&mut self, _ctx: &PollContext) -> Result<Reading, SensorError> {
        let raw = [
            self.bat.read_raw().map_err(bus)?,
            self.sol.read_raw().map_err(bus)?,
            self.l1.read_raw().map_err(bus)?,
            self.l2.read_raw().map_err(bus)?,
        ];
        log::trace!("ADC raw {:?}", raw);
        Ok(raw.iter().map(|r| volts(*r)).collect())
    }
}

unsafe extern "C" fn on_wind_edge(_arg: *mut c_void) {
    WIND_PULSES.record_edge();
}

/// Counts anemometer edges while the CPU is awake. Deep sleep stops the
/// ISR and clears RAM, so the window is the time since `start()` on cold boot
/// and timer wakes find the counter stopped. Windows shorter than
/// [`MIN_WIND_WINDOW_MS`] are reported invalid rather than as a speed.
// TODO: count edges on the ULP coprocessor so the window spans deep sleep
pub struct WindSensor {
    inner: Anemometer,
    armed_at: Option<Instant>,
}

impl WindSensor {
    pub fn new(pin: gpio_num_t) -> Result<Self> {
        unsafe {
            use esp_idf_sys::*;
            esp!(gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_INPUT))?;
            esp!(gpio_set_pull_mode(pin, gpio_pull_mode_t_GPIO_PULLUP_ONLY))?;
            esp!(gpio_set_intr_type(pin, gpio_int_type_t_GPIO_INTR_NEGEDGE))?;
            // Already installed is fine
            let installed = gpio_install_isr_service(0);
            if installed != ESP_OK && installed != ESP_ERR_INVALID_STATE as esp_err_t {
                esp!(installed)?;
            }
            esp!(gpio_isr_handler_add(pin, Some(on_wind_edge), core::ptr::null_mut()))?;
        }
        Ok(Self {
            inner: Anemometer::new(&WIND_PULSES),
            armed_at: None,
        })
    }
}

impl SensorDriver for WindSensor {
    fn id(&self) -> DriverId {
        DriverId::Wind
    }

    fn start(&mut self) {
        self.inner.start();
        self.armed_at = Some(Instant::now());
    }

    fn read(&mut self, ctx: &PollContext) -> Result<Reading, SensorError> {
        let armed_at = self.armed_at.ok_or(SensorError::NoResponse(DriverId::Wind))?;
        let counted_ms = armed_at.elapsed().as_millis() as u64;
        if counted_ms < MIN_WIND_WINDOW_MS {
            log::debug!("Wind counted for {} ms only, not reporting it", counted_ms);
        }
        self.armed_at = Some(Instant::now());
        self.inner.read(&PollContext {
            window_ms: counted_ms,
            ..*ctx
        })
    }
}
