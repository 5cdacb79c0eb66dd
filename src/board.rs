// One wake of the physical station: bring up the hardware, then either run
// the operator session (long press at wake) or a single station cycle, and
// go back to sleep.

use anyhow::{anyhow, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::Peripherals;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_sys::gpio_num_t;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use station_core::clock::{Clock, SntpClient};
use station_core::config::{BlobStore, ConfigStore, FileStore, MemoryStore};
use station_core::network::{Connectivity, Offline};
use station_core::operator::{classify_press, ButtonGesture, ConfigSession, ServerMode, LONG_PRESS_MS};
use station_core::scheduler::{NextAction, Platform, Station, WakeCause};
use station_core::sensors::SensorBank;
use station_core::settings::{Settings, WifiDefaults};
use station_core::FwUpdater;

use crate::config::NvsBlobStore;
use crate::display::LogDisplay;
use crate::network::{EspConnectivity, EspTransport};
use crate::ota::{web_server::OperatorServer, EspFlash};
use crate::sensors::{AdcBank, WindSensor};
use crate::system::{power, storage, ActionButton, EspClock};

/// RTC-capable pin, so it can also wake the chip
const BUTTON_GPIO: gpio_num_t = 0;
const ANEMOMETER_GPIO: gpio_num_t = 13;

fn wifi_defaults() -> WifiDefaults {
    WifiDefaults {
        ssid: env!("WIFI_SSID").to_string(),
        password: env!("WIFI_PASSWORD").to_string(),
    }
}

fn quiet_wifi_driver() {
    unsafe {
        esp_idf_sys::esp_log_level_set(c"wifi".as_ptr(), esp_idf_sys::esp_log_level_t_ESP_LOG_WARN);
    }
}

pub fn run() -> Result<()> {
    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    quiet_wifi_driver();

    let cause = power::wake_cause();
    log::info!("Wake cause: {:?}", cause);
    let mut button = match ActionButton::new(peripherals.pins.gpio0) {
        Ok(button) => Some(button),
        Err(e) => {
            log::error!("Button input unavailable: {}", e);
            None
        }
    };

    let storage_dir = match storage::mount() {
        Ok(dir) => Some(dir),
        Err(e) => {
            log::warn!("No storage partition: {}", e);
            None
        }
    };
    let file = storage_dir
        .as_ref()
        .map(|_| Box::new(FileStore::new(storage::CONFIG_FILE)) as Box<dyn BlobStore + Send>);
    let kv: Box<dyn BlobStore + Send> = match NvsBlobStore::open(nvs.clone()) {
        Ok(store) => Box::new(store),
        Err(e) => {
            log::error!("NVS config namespace unavailable, settings will not persist: {}", e);
            Box::new(MemoryStore::new())
        }
    };
    let config = ConfigStore::open(file, kv);
    let mut link = match EspConnectivity::new(peripherals.modem, sys_loop, nvs) {
        Ok(link) => Some(link),
        Err(e) => {
            log::error!("WiFi driver failed to start, running offline: {}", e);
            None
        }
    };

    let operator_wake = !cfg!(feature = "no_operator") && cause != WakeCause::Timer;
    if let Some(button) = button.as_mut().filter(|b| operator_wake && b.is_pressed()) {
        let held = button.measure_hold(Duration::from_millis(LONG_PRESS_MS + 500));
        if classify_press(held) == ButtonGesture::Long {
            match link.take() {
                Some(link) => return operator_session(config, link, button),
                None => log::error!("Configuration mode needs WiFi, continuing normally"),
            }
        } else {
            log::info!("Button released after {} ms, continuing normally", held);
        }
    }

    // A driver that fails to start is left out and its sensors report invalid
    let mut sensors = SensorBank::new();
    match AdcBank::new(
        peripherals.adc1,
        peripherals.pins.gpio1,
        peripherals.pins.gpio2,
        peripherals.pins.gpio3,
        peripherals.pins.gpio4,
    ) {
        Ok(adc) => sensors.add(Box::new(adc)),
        Err(e) => log::error!("ADC setup failed: {}", e),
    }
    match WindSensor::new(ANEMOMETER_GPIO) {
        Ok(wind) => sensors.add(Box::new(wind)),
        Err(e) => log::error!("Anemometer interrupt setup failed: {}", e),
    }

    let link: Box<dyn Connectivity> = match link {
        Some(link) => Box::new(link),
        None => Box::new(Offline),
    };
    let platform = Platform {
        config,
        flash: EspFlash::new(),
        clock: Box::new(EspClock),
        sensors,
        display: Box::new(LogDisplay),
        link,
        transport: Box::new(EspTransport::new()),
        time_source: Box::new(SntpClient),
        storage_dir,
    };
    let mut station = Station::new(platform, crate::version::identity(), wifi_defaults());
    station.set_wake_cause(cause);

    let state = crate::retention::take().ok_or_else(|| anyhow!("retention state already in use"))?;
    let report = station.run_cycle(state);

    match report.next {
        NextAction::Sleep { duration_ms } => power::deep_sleep(duration_ms, BUTTON_GPIO),
        NextAction::Restart => station.updater_mut().flash_mut().restart(),
        NextAction::RestartToFactory => station
            .updater_mut()
            .reboot_to_factory()
            .map_err(|e| anyhow!("cannot boot the factory image: {}", e))?,
    }
    Ok(())
}

fn bring_up(link: &mut EspConnectivity, mode: ServerMode, settings: &Settings) -> Result<()> {
    if mode == ServerMode::Station {
        let timeout = Duration::from_secs(u64::from(settings.wifi_timeout_secs));
        match link.connect(&settings.wifi_ssid, &settings.wifi_password, timeout) {
            Ok(()) => return Ok(()),
            Err(e) => log::warn!("Cannot join '{}': {}, opening access point", settings.wifi_ssid, e),
        }
    }
    link.start_access_point(&settings.station_name)
}

/// Serve the configuration pages until the session times out, then restart
fn operator_session(mut config: ConfigStore, mut link: EspConnectivity, button: &mut ActionButton) -> Result<()> {
    let settings = Settings::load(&mut config, &wifi_defaults());
    let clock = EspClock;
    let mut session = ConfigSession::start(clock.since_wake_ms(), settings.wifi_configured());
    log::info!("Configuration mode ({:?})", session.mode());

    bring_up(&mut link, session.mode(), &settings)?;
    let _server = OperatorServer::start(
        Arc::new(Mutex::new(config)),
        Arc::new(Mutex::new(FwUpdater::new(EspFlash::new()))),
        settings.station_name.clone(),
    )?;

    while !session.expired(clock.since_wake_ms()) {
        if let Some(mode) = button.poll_release().and_then(|held| session.on_press(held)) {
            log::info!("Switching configuration server to {:?}", mode);
            link.disconnect();
            bring_up(&mut link, mode, &settings)?;
        }
        FreeRtos::delay_ms(20);
    }

    log::info!("Configuration session expired, restarting");
    unsafe { esp_idf_sys::esp_restart() };
}
