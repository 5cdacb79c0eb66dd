/// Sensor table, per-poll driver memoization, averaging and the wind counter
///
/// Logical sensors are fixed at build time. Several of them share one physical
/// driver (the DHT reports both `t1` and `h1`), so a poll pass reads each
/// driver at most once and caches the outcome in a small table keyed by
/// driver id.
use heapless::FnvIndexMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use thiserror::Error;

use crate::settings::ADC_CHANNELS;

pub const SENSOR_COUNT: usize = 13;
pub const MAX_CHANNELS: usize = 4;

/// Index of the battery voltage in [`SENSORS`]
pub const BATTERY: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverId {
    Adc,
    Dht,
    Bmp,
    Bme,
    Wind,
}

#[derive(Debug, Clone, Copy)]
pub struct SensorSpec {
    pub key: &'static str,
    pub label: &'static str,
    pub unit: &'static str,
    /// `None` for sensors with no hardware fitted yet
    pub driver: Option<DriverId>,
    /// Position of this value in the driver's reading
    pub channel: usize,
}

const fn spec(
    key: &'static str,
    label: &'static str,
    unit: &'static str,
    driver: Option<DriverId>,
    channel: usize,
) -> SensorSpec {
    SensorSpec {
        key,
        label,
        unit,
        driver,
        channel,
    }
}

pub const SENSORS: [SensorSpec; SENSOR_COUNT] = [
    spec("bat", "Battery", "V", Some(DriverId::Adc), 0),
    spec("sol", "Solar", "V", Some(DriverId::Adc), 1),
    spec("l1", "Light 1", "V", Some(DriverId::Adc), 2),
    spec("l2", "Light 2", "V", Some(DriverId::Adc), 3),
    spec("t1", "Temp 1", "C", Some(DriverId::Dht), 0),
    spec("t2", "Temp 2", "C", Some(DriverId::Bmp), 0),
    spec("h1", "Humidity 1", "%", Some(DriverId::Dht), 1),
    spec("h2", "Humidity 2", "%", Some(DriverId::Bme), 1),
    spec("p1", "Pressure 1", "kPa", Some(DriverId::Bmp), 1),
    spec("p2", "Pressure 2", "kPa", Some(DriverId::Bme), 2),
    spec("ws", "Wind speed", "km/h", Some(DriverId::Wind), 0),
    spec("wd", "Wind dir", "deg", Some(DriverId::Wind), 1),
    spec("rain", "Rain", "mm", None, 0),
];

pub fn sensor_index(key: &str) -> Option<usize> {
    SENSORS.iter().position(|s| s.key == key)
}

pub type Reading = heapless::Vec<f32, MAX_CHANNELS>;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{0:?} did not respond")]
    NoResponse(DriverId),
    #[error("{0:?} timed out")]
    Timeout(DriverId),
    #[error("{0:?} counted for {1} ms, too short for a reading")]
    ShortWindow(DriverId, u64),
    #[error("bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollContext {
    /// Time since the previous poll, used by rate sensors
    pub window_ms: u64,
    pub adc_multipliers: [f32; ADC_CHANNELS],
    pub anemometer_radius_cm: f32,
    pub anemometer_calibration: f32,
}

impl Default for PollContext {
    fn default() -> Self {
        Self {
            window_ms: 0,
            adc_multipliers: [2.0; ADC_CHANNELS],
            anemometer_radius_cm: 15.0,
            anemometer_calibration: 1.0,
        }
    }
}

/// One physical device; a single `read` is one hardware transaction
pub trait SensorDriver {
    fn id(&self) -> DriverId;

    /// Called once on cold boot for drivers that count in the background
    fn start(&mut self) {}

    fn read(&mut self, ctx: &PollContext) -> Result<Reading, SensorError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum DriverState {
    Pending,
    Resolved(Reading),
    Failed,
}

pub type MemoTable = FnvIndexMap<DriverId, DriverState, 8>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorSample {
    pub values: [f32; SENSOR_COUNT],
    /// Bit `i` set when sensor `i` produced no usable value
    pub status: u16,
}

impl SensorSample {
    pub const fn all_invalid() -> Self {
        Self {
            values: [0.0; SENSOR_COUNT],
            status: (1 << SENSOR_COUNT) - 1,
        }
    }

    pub fn value(&self, index: usize) -> Option<f32> {
        (self.status & (1 << index) == 0).then(|| self.values[index])
    }

    pub fn valid_count(&self) -> usize {
        SENSOR_COUNT - self.status.count_ones() as usize
    }
}

#[derive(Default)]
pub struct SensorBank {
    drivers: Vec<Box<dyn SensorDriver>>,
}

impl SensorBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, driver: Box<dyn SensorDriver>) -> Self {
        self.add(driver);
        self
    }

    pub fn add(&mut self, driver: Box<dyn SensorDriver>) {
        if self.drivers.iter().any(|d| d.id() == driver.id()) {
            log::warn!("Replacing {:?} driver", driver.id());
            self.drivers.retain(|d| d.id() != driver.id());
        }
        self.drivers.push(driver);
    }

    pub fn start_background(&mut self) {
        for driver in &mut self.drivers {
            driver.start();
        }
    }

    pub fn poll(&mut self, ctx: &PollContext) -> SensorSample {
        let mut memo = MemoTable::new();
        let mut sample = SensorSample::all_invalid();

        for (i, spec) in SENSORS.iter().enumerate() {
            let Some(driver) = spec.driver else {
                continue;
            };
            let value = self
                .resolve(&mut memo, driver, ctx)
                .and_then(|reading| reading.get(spec.channel).copied())
                .map(|raw| calibrate(spec, raw, ctx))
                .filter(|v| v.is_finite());
            if let Some(v) = value {
                sample.values[i] = v;
                sample.status &= !(1 << i);
            }
        }

        log::debug!(
            "Polled {} of {} sensors (status {:#06x})",
            sample.valid_count(),
            SENSOR_COUNT,
            sample.status
        );
        sample
    }

    fn resolve(&mut self, memo: &mut MemoTable, id: DriverId, ctx: &PollContext) -> Option<Reading> {
        match memo.get(&id) {
            Some(DriverState::Resolved(reading)) => return Some(reading.clone()),
            Some(DriverState::Pending) | Some(DriverState::Failed) => return None,
            None => {}
        }
        // The table has room for every DriverId
        let _ = memo.insert(id, DriverState::Pending);

        let state = match self.drivers.iter_mut().find(|d| d.id() == id) {
            Some(driver) => match driver.read(ctx) {
                Ok(reading) => DriverState::Resolved(reading),
                Err(e) => {
                    log::warn!("Sensor read failed: {}", e);
                    DriverState::Failed
                }
            },
            None => {
                log::debug!("No {:?} driver fitted", id);
                DriverState::Failed
            }
        };
        let reading = match &state {
            DriverState::Resolved(reading) => Some(reading.clone()),
            _ => None,
        };
        let _ = memo.insert(id, state);
        reading
    }
}

fn calibrate(spec: &SensorSpec, raw: f32, ctx: &PollContext) -> f32 {
    match spec.driver {
        Some(DriverId::Adc) => raw * ctx.adc_multipliers.get(spec.channel).copied().unwrap_or(1.0),
        _ => raw,
    }
}

/// Decaying average over roughly the last `window` samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningAverage {
    value: f32,
    count: u8,
    window: u8,
}

impl RunningAverage {
    pub const fn new(window: u8) -> Self {
        Self {
            value: 0.0,
            count: 0,
            window: if window == 0 { 1 } else { window },
        }
    }

    pub fn add(&mut self, sample: f32) -> f32 {
        if !sample.is_finite() {
            return self.value;
        }
        if self.count < self.window {
            self.count += 1;
        }
        self.value += (sample - self.value) / f32::from(self.count);
        self.value
    }

    pub fn value(&self) -> Option<f32> {
        (self.count > 0).then_some(self.value)
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
        self.count = 0;
    }
}

/// Edge counter fed from an interrupt, drained once per wake cycle
#[derive(Debug, Default)]
pub struct PulseCounter {
    edges: AtomicU32,
    running: AtomicBool,
}

impl PulseCounter {
    pub const fn new() -> Self {
        Self {
            edges: AtomicU32::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.edges.store(0, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Producer side, safe to call from an ISR
    pub fn record_edge(&self) {
        if self.is_running() {
            self.edges.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Read and reset in one step so no edge is counted twice or lost
    pub fn take(&self) -> u32 {
        self.edges.swap(0, Ordering::AcqRel)
    }
}

/// Shortest counting window that gives a usable wind speed, one sample
/// period of the pulse counter
pub const MIN_WIND_WINDOW_MS: u64 = 10_000;

/// Cup anemometer: two edges per rotation
pub fn wind_speed_kph(edges: u32, window_ms: u64, radius_cm: f32, calibration: f32) -> Option<f32> {
    if window_ms < MIN_WIND_WINDOW_MS {
        return None;
    }
    let rotations = f64::from(edges) / 2.0;
    let rpm = rotations / (window_ms as f64 / 1000.0) * 60.0;
    let circumference_km = 2.0 * std::f64::consts::PI * f64::from(radius_cm) / 100.0 / 1000.0;
    Some((rpm * 60.0 * circumference_km * f64::from(calibration)) as f32)
}

pub struct Anemometer {
    counter: &'static PulseCounter,
}

impl Anemometer {
    pub fn new(counter: &'static PulseCounter) -> Self {
        Self { counter }
    }
}

impl SensorDriver for Anemometer {
    fn id(&self) -> DriverId {
        DriverId::Wind
    }

    fn start(&mut self) {
        log::info!("Starting wind pulse counter");
        self.counter.start();
    }

    fn read(&mut self, ctx: &PollContext) -> Result<Reading, SensorError> {
        if !self.counter.is_running() {
            return Err(SensorError::NoResponse(DriverId::Wind));
        }
        let edges = self.counter.take();
        let speed = wind_speed_kph(
            edges,
            ctx.window_ms,
            ctx.anemometer_radius_cm,
            ctx.anemometer_calibration,
        )
        .ok_or(SensorError::ShortWindow(DriverId::Wind, ctx.window_ms))?;
        let mut reading = Reading::new();
        let _ = reading.push(speed);
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Fixed {
        id: DriverId,
        values: &'static [f32],
        reads: Rc<Cell<u32>>,
    }

    impl SensorDriver for Fixed {
        fn id(&self) -> DriverId {
            self.id
        }

        fn read(&mut self, _ctx: &PollContext) -> Result<Reading, SensorError> {
            self.reads.set(self.reads.get() + 1);
            Ok(Reading::from_slice(self.values).unwrap())
        }
    }

    struct Broken(DriverId);

    impl SensorDriver for Broken {
        fn id(&self) -> DriverId {
            self.0
        }

        fn read(&mut self, _ctx: &PollContext) -> Result<Reading, SensorError> {
            Err(SensorError::NoResponse(self.0))
        }
    }

    #[test]
    fn test_shared_driver_is_read_once_per_poll() {
        let reads = Rc::new(Cell::new(0));
        let mut bank = SensorBank::new().with_driver(Box::new(Fixed {
            id: DriverId::Dht,
            values: &[21.5, 48.0],
            reads: reads.clone(),
        }));

        let sample = bank.poll(&PollContext::default());
        assert_eq!(reads.get(), 1);
        assert_eq!(sample.value(sensor_index("t1").unwrap()), Some(21.5));
        assert_eq!(sample.value(sensor_index("h1").unwrap()), Some(48.0));
        assert_eq!(sample.valid_count(), 2);

        bank.poll(&PollContext::default());
        assert_eq!(reads.get(), 2);
    }

    #[test]
    fn test_failed_driver_marks_all_its_sensors_invalid() {
        let mut bank = SensorBank::new()
            .with_driver(Box::new(Broken(DriverId::Bme)))
            .with_driver(Box::new(Fixed {
                id: DriverId::Bmp,
                values: &[19.0, 101.3],
                reads: Rc::new(Cell::new(0)),
            }));
        let sample = bank.poll(&PollContext::default());
        assert_eq!(sample.value(sensor_index("h2").unwrap()), None);
        assert_eq!(sample.value(sensor_index("p2").unwrap()), None);
        assert_eq!(sample.value(sensor_index("p1").unwrap()), Some(101.3));
        assert_eq!(sample.values[sensor_index("h2").unwrap()], 0.0);
    }

    #[test]
    fn test_adc_values_are_scaled_by_multiplier() {
        let mut bank = SensorBank::new().with_driver(Box::new(Fixed {
            id: DriverId::Adc,
            values: &[1.9, 2.5, 0.5, 0.25],
            reads: Rc::new(Cell::new(0)),
        }));
        let mut ctx = PollContext::default();
        ctx.adc_multipliers = [2.0, 3.0, 1.0, 4.0];
        let sample = bank.poll(&ctx);
        assert_eq!(sample.value(BATTERY), Some(3.8));
        assert_eq!(sample.value(1), Some(7.5));
        assert_eq!(sample.value(3), Some(1.0));
    }

    #[test]
    fn test_memo_table_records_outcomes() {
        let mut bank = SensorBank::new().with_driver(Box::new(Broken(DriverId::Dht)));
        let mut memo = MemoTable::new();
        let ctx = PollContext::default();
        assert!(bank.resolve(&mut memo, DriverId::Dht, &ctx).is_none());
        assert_eq!(memo.get(&DriverId::Dht), Some(&DriverState::Failed));
        assert!(bank.resolve(&mut memo, DriverId::Adc, &ctx).is_none());
        assert_eq!(memo.len(), 2);
    }

    #[test]
    fn test_running_average_converges() {
        let mut avg = RunningAverage::new(4);
        assert_eq!(avg.value(), None);
        assert_eq!(avg.add(4.0), 4.0);
        avg.add(3.0);
        assert_eq!(avg.value(), Some(3.5));
        for _ in 0..50 {
            avg.add(3.0);
        }
        assert!((avg.value().unwrap() - 3.0).abs() < 0.01);
        avg.add(f32::NAN);
        assert!(avg.value().unwrap().is_finite());
    }

    #[test]
    fn test_pulse_counter_take_resets() {
        static COUNTER: PulseCounter = PulseCounter::new();
        COUNTER.record_edge();
        assert_eq!(COUNTER.take(), 0, "edges before start are ignored");

        COUNTER.start();
        for _ in 0..10 {
            COUNTER.record_edge();
        }
        assert_eq!(COUNTER.take(), 10);
        assert_eq!(COUNTER.take(), 0);
    }

    #[test]
    fn test_wind_speed_formula() {
        // 120 edges in 60 s = 60 rotations = 60 rpm
        let kph = wind_speed_kph(120, 60_000, 15.0, 1.0).unwrap();
        let expected = 60.0 * 60.0 * 2.0 * std::f64::consts::PI * 0.15 / 1000.0;
        assert!((f64::from(kph) - expected).abs() < 1e-4);
        assert_eq!(wind_speed_kph(10, 0, 15.0, 1.0), None);
        assert_eq!(wind_speed_kph(10, MIN_WIND_WINDOW_MS - 1, 15.0, 1.0), None);
    }

    #[test]
    fn test_short_count_window_flags_wind_invalid() {
        static COUNTER: PulseCounter = PulseCounter::new();
        let mut bank = SensorBank::new().with_driver(Box::new(Anemometer::new(&COUNTER)));
        bank.start_background();
        for _ in 0..6 {
            COUNTER.record_edge();
        }
        // A few hundred ms of counting says nothing about the wind
        let ctx = PollContext {
            window_ms: 350,
            ..PollContext::default()
        };
        let sample = bank.poll(&ctx);
        assert_eq!(sample.value(sensor_index("ws").unwrap()), None);
        assert_eq!(COUNTER.take(), 0);
    }

    #[test]
    fn test_anemometer_reports_speed_only() {
        static COUNTER: PulseCounter = PulseCounter::new();
        let mut bank = SensorBank::new().with_driver(Box::new(Anemometer::new(&COUNTER)));
        bank.start_background();
        for _ in 0..40 {
            COUNTER.record_edge();
        }
        let ctx = PollContext {
            window_ms: 10_000,
            ..PollContext::default()
        };
        let sample = bank.poll(&ctx);
        assert!(sample.value(sensor_index("ws").unwrap()).unwrap() > 0.0);
        assert_eq!(sample.value(sensor_index("wd").unwrap()), None);
        assert_eq!(sample.value(sensor_index("rain").unwrap()), None);
    }
}
