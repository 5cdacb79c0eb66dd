// Host simulator: runs wake cycles of the real scheduler against the
// in-memory platform. Driven by environment variables so it needs no
// argument parser:
//
//   STATION_CYCLES   number of wake cycles (default 20)
//   STATION_CONFIG   JSON config file, used as the file backend
//   STATION_STORAGE  directory watched for firmware.bin
//   STATION_OFFLINE  set to keep WiFi down
//   STATION_JSON     set to print one JSON line per cycle
//   STATION_LOG      log level (default info)

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use station_core::clock::Clock;
use station_core::config::{BlobStore, ConfigStore, FileStore, MemoryStore};
use station_core::scheduler::{CycleReport, NextAction, Platform, RetentionState, Station, WakeCause};
use station_core::sensors::{DriverId, SensorBank};
use station_core::settings::WifiDefaults;
use station_core::sim::{
    OffsetTimeSource, RecordingDisplay, RecordingTransport, SimClock, SimFlash, SimLink, SimSensor,
};

/// Simulated cost of one sensor transaction
const READ_MS: u64 = 40;
/// The simulated RTC loses this much against the time server every cycle
const DRIFT_PER_CYCLE_MS: i64 = 4;

#[derive(Debug, Clone)]
pub struct SimOptions {
    pub cycles: u32,
    pub config: Option<PathBuf>,
    pub storage: Option<PathBuf>,
    pub offline: bool,
    pub json: bool,
}

impl SimOptions {
    pub fn from_env() -> Result<Self> {
        let cycles = match std::env::var("STATION_CYCLES") {
            Ok(text) => text
                .parse()
                .with_context(|| format!("STATION_CYCLES must be a number, got '{}'", text))?,
            Err(_) => 20,
        };
        Ok(Self {
            cycles,
            config: std::env::var_os("STATION_CONFIG").map(PathBuf::from),
            storage: std::env::var_os("STATION_STORAGE").map(PathBuf::from),
            offline: std::env::var_os("STATION_OFFLINE").is_some(),
            json: std::env::var_os("STATION_JSON").is_some(),
        })
    }
}

#[derive(Serialize)]
struct CycleLine<'a> {
    wake: u32,
    valid_sensors: usize,
    queued: usize,
    battery: Option<f32>,
    power_save: bool,
    upload: &'a str,
    sync: &'a str,
    correction_ms: i64,
    next: &'a str,
}

/// Battery and solar readings (before the x2 divider) for a point in the day
fn solar_day(now_ms: i64) -> (f32, f32) {
    let hour = (now_ms / 3_600_000).rem_euclid(24) as f32;
    let sun = ((hour - 6.0) / 12.0 * std::f32::consts::PI).sin().max(0.0);
    let battery = 1.75 + 0.3 * sun;
    (battery, 2.9 * sun)
}

pub fn run(options: &SimOptions) -> Result<()> {
    let start_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("host clock is before 1970")?
        .as_millis() as i64;
    let clock = SimClock::new(start_ms);
    let flash = SimFlash::dual_slot();
    let link = SimLink::up();
    link.set_available(!options.offline);
    let transport = RecordingTransport::new();
    let time = OffsetTimeSource::new(clock.clone(), 0);

    let (battery, solar) = solar_day(start_ms);
    let adc = SimSensor::new(DriverId::Adc, &[battery, solar, 0.4, 0.3]).with_latency(&clock, READ_MS);
    let sensors = SensorBank::new()
        .with_driver(Box::new(adc.clone()))
        .with_driver(Box::new(
            SimSensor::new(DriverId::Dht, &[18.5, 62.0]).with_latency(&clock, READ_MS),
        ))
        .with_driver(Box::new(
            SimSensor::new(DriverId::Bmp, &[18.1, 100.9]).with_latency(&clock, READ_MS),
        ))
        .with_driver(Box::new(SimSensor::new(DriverId::Wind, &[7.5, 270.0]).with_latency(&clock, READ_MS)));

    let file = options
        .config
        .as_ref()
        .map(|path| Box::new(FileStore::new(path)) as Box<dyn BlobStore + Send>);
    let platform = Platform {
        config: ConfigStore::open(file, Box::new(MemoryStore::new())),
        flash: flash.clone(),
        clock: Box::new(clock.clone()),
        sensors,
        display: Box::new(RecordingDisplay::default()),
        link: Box::new(link.clone()),
        transport: Box::new(transport.clone()),
        time_source: Box::new(time.clone()),
        storage_dir: options.storage.clone(),
    };
    let wifi = WifiDefaults {
        ssid: env!("WIFI_SSID").to_string(),
        password: env!("WIFI_PASSWORD").to_string(),
    };
    let mut station = Station::new(platform, crate::version::identity(), wifi);
    station.set_wake_cause(WakeCause::ColdBoot);
    let mut state = RetentionState::new();

    for cycle in 0..options.cycles {
        let (battery, solar) = solar_day(clock.now_ms());
        adc.set_values(&[battery, solar, 0.4, 0.3]);
        time.set_offset_ms(DRIFT_PER_CYCLE_MS * i64::from(cycle));

        let report = station.run_cycle(&mut state);
        print_report(&report, options.json)?;

        match report.next {
            NextAction::Sleep { duration_ms } => {
                clock.deep_sleep(duration_ms);
                station.set_wake_cause(WakeCause::Timer);
            }
            NextAction::Restart => {
                log::warn!("Restarting into slot {:?}", flash.boot_label());
                flash.reboot();
                station.set_wake_cause(WakeCause::ColdBoot);
            }
            NextAction::RestartToFactory => {
                station
                    .updater_mut()
                    .reboot_to_factory()
                    .context("selecting the factory image")?;
                flash.reboot();
                station.set_wake_cause(WakeCause::ColdBoot);
            }
        }
    }

    log::info!(
        "Simulated {} cycles: {} uploads, {} records still queued, running {}",
        options.cycles,
        transport.posts().len(),
        state.queue.len(),
        flash.running_label()
    );
    Ok(())
}

fn print_report(report: &CycleReport, json: bool) -> Result<()> {
    let upload = format!("{:?}", report.upload);
    let sync = format!("{:?}", report.sync);
    let next = format!("{:?}", report.next);
    if json {
        let line = CycleLine {
            wake: report.wake_count,
            valid_sensors: report.sample.valid_count(),
            queued: report.queued,
            battery: report.battery,
            power_save: report.power_save,
            upload: &upload,
            sync: &sync,
            correction_ms: report.drift_correction_ms,
            next: &next,
        };
        println!("{}", serde_json::to_string(&line)?);
    } else {
        log::info!(
            "wake {:>4} | {:>2} sensors | {:>2} queued | upload {} | {}",
            report.wake_count,
            report.sample.valid_count(),
            report.queued,
            upload,
            next
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solar_day_is_dark_at_night() {
        // 02:00 UTC
        let (battery, solar) = solar_day(2 * 3_600_000);
        assert_eq!(solar, 0.0);
        assert!((battery - 1.75).abs() < 1e-6);
        // Noon peaks
        let (battery, solar) = solar_day(12 * 3_600_000);
        assert!(solar > 2.8);
        assert!(battery > 2.0);
    }

    #[test]
    fn test_offline_run_completes() {
        let options = SimOptions {
            cycles: 3,
            config: None,
            storage: None,
            offline: true,
            json: true,
        };
        run(&options).unwrap();
    }
}
