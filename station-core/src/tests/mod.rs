// Whole-cycle scenarios against the simulated platform



use std::path::PathBuf;

use crate::config::{ConfigStore, MemoryStore};
use crate::scheduler::{CycleReport, FirmwareIdentity, NextAction, Platform, RetentionState, Station, WakeCause};
use crate::sensors::{DriverId, SensorBank};
use crate::settings::WifiDefaults;
use crate::sim::{OffsetTimeSource, RecordingDisplay, RecordingTransport, SimClock, SimFlash, SimLink, SimSensor};

/// 2023-11-14 22:13:20 UTC
pub const T0: i64 = 1_700_000_000_000;
/// Simulated cost of one sensor transaction
pub const READ_MS: u64 = 50;
pub const DRIVERS: u64 = 5;

pub const NETWORKED: &str = r#"{
    "station.name": "Ridge",
    "wifi.ssid": "field-ap",
    "wifi.password": "secret",
    "http.update.url": "http://collector.local/ingest"
}"#;

pub struct Rig {
    pub station: Station<SimFlash>,
    pub state: RetentionState,
    pub clock: SimClock,
    pub flash: SimFlash,
    pub link: SimLink,
    pub transport: RecordingTransport,
    pub time: OffsetTimeSource,
    pub display: RecordingDisplay,
    pub kv: MemoryStore,
    pub adc: SimSensor,
    pub dht: SimSensor,
    pub wind: SimSensor,
}

impl Rig {
    pub fn new(config: &str) -> Self {
        Self::with(config, SimFlash::dual_slot(), None)
    }

    pub fn with(config: &str, flash: SimFlash, storage_dir: Option<PathBuf>) -> Self {
        let clock = SimClock::new(T0);
        let kv = if config.is_empty() {
            MemoryStore::new()
        } else {
            MemoryStore::with_contents(config)
        };
        let link = SimLink::up();
        let transport = RecordingTransport::new();
        let time = OffsetTimeSource::new(clock.clone(), 0);
        let display = RecordingDisplay::default();

        // Battery 3.9 V after the x2 divider, wind direction and rain missing
        let adc = SimSensor::new(DriverId::Adc, &[1.95, 2.6, 0.4, 0.3]).with_latency(&clock, READ_MS);
        let dht = SimSensor::new(DriverId::Dht, &[21.5, 48.0]).with_latency(&clock, READ_MS);
        let wind = SimSensor::new(DriverId::Wind, &[12.0]).with_latency(&clock, READ_MS);
        let sensors = SensorBank::new()
            .with_driver(Box::new(adc.clone()))
            .with_driver(Box::new(dht.clone()))
            .with_driver(Box::new(
                SimSensor::new(DriverId::Bmp, &[19.8, 101.3]).with_latency(&clock, READ_MS),
            ))
            .with_driver(Box::new(
                SimSensor::new(DriverId::Bme, &[20.1, 47.5, 101.2]).with_latency(&clock, READ_MS),
            ))
            .with_driver(Box::new(wind.clone()));

        let platform = Platform {
            config: ConfigStore::open(None, Box::new(kv.clone())),
            flash: flash.clone(),
            clock: Box::new(clock.clone()),
            sensors,
            display: Box::new(display.clone()),
            link: Box::new(link.clone()),
            transport: Box::new(transport.clone()),
            time_source: Box::new(time.clone()),
            storage_dir,
        };
        let identity = FirmwareIdentity {
            version: "0.3.2".to_string(),
            build: "test".to_string(),
        };
        let mut station = Station::new(platform, identity, WifiDefaults::default());
        station.set_wake_cause(WakeCause::ColdBoot);

        Self {
            station,
            state: RetentionState::new(),
            clock,
            flash,
            link,
            transport,
            time,
            display,
            kv,
            adc,
            dht,
            wind,
        }
    }

    /// One wake cycle, then deep sleep for as long as it asked
    pub fn cycle(&mut self) -> CycleReport {
        let report = self.station.run_cycle(&mut self.state);
        if let NextAction::Sleep { duration_ms } = report.next {
            self.clock.deep_sleep(duration_ms);
        }
        self.station.set_wake_cause(WakeCause::Timer);
        report
    }
}
