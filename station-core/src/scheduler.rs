/// The wake cycle
///
/// Every wake from deep sleep runs one straight-line cycle: load settings,
/// install firmware waiting on storage, poll the sensors, queue the record,
/// upload when due, confirm the running image and plan the next sleep. The
/// only state carried between cycles is [`RetentionState`], which the board
/// keeps in RTC memory. Failures along the way are logged and recorded in the
/// [`CycleReport`]; the cycle always ends with a [`NextAction`].
use std::path::PathBuf;
use std::time::Duration;

use crate::clock::{synchronize, Clock, ClockState, SyncOutcome, TimeSource};
use crate::config::ConfigStore;
use crate::network::{is_ack, BasicAuth, Connectivity, PostRequest, Transport};
use crate::ota::{
    install_pending_image, read_header, AppDescriptor, FirmwareFlash, FwUpdater, OtaError, StorageInstall, UpdateState,
};
use crate::power::{plan_sleep, NO_BATTERY_VOLTS};
use crate::sensors::{PollContext, RunningAverage, SensorBank, SensorSample, BATTERY, SENSOR_COUNT};
use crate::settings::{Settings, WifiDefaults};
use crate::telemetry::{encode_batch, BatchContext, TelemetryQueue, TelemetryRecord, QUEUE_CAPACITY};

/// Marks retention memory that holds a state written by this firmware
pub const RETENTION_MAGIC: u32 = 0x5354_4154;
/// Uploads may start this early so a cycle landing just before the deadline
/// does not wait a whole extra poll interval
pub const UPLOAD_LEAD_MS: i64 = 5_000;
const BATTERY_WINDOW: u8 = 8;

/// Everything that survives deep sleep
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionState {
    magic: u32,
    pub wake_count: u32,
    pub clock: ClockState,
    /// Wall-clock time the next upload is due; 0 until the first upload
    pub next_upload_ms: i64,
    pub last_poll_ms: i64,
    pub battery: RunningAverage,
    pub queue: TelemetryQueue<QUEUE_CAPACITY>,
}

impl RetentionState {
    pub const fn new() -> Self {
        Self {
            magic: RETENTION_MAGIC,
            wake_count: 0,
            clock: ClockState::new(),
            next_upload_ms: 0,
            last_poll_ms: 0,
            battery: RunningAverage::new(BATTERY_WINDOW),
            queue: TelemetryQueue::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == RETENTION_MAGIC
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for RetentionState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    ColdBoot,
    Timer,
    Button,
}

pub trait StatusDisplay {
    fn show(&mut self, text: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareIdentity {
    pub version: String,
    pub build: String,
}

/// Hardware handed to the [`Station`]
pub struct Platform<F: FirmwareFlash> {
    pub config: ConfigStore,
    pub flash: F,
    pub clock: Box<dyn Clock>,
    pub sensors: SensorBank,
    pub display: Box<dyn StatusDisplay>,
    pub link: Box<dyn Connectivity>,
    pub transport: Box<dyn Transport>,
    pub time_source: Box<dyn TimeSource>,
    /// Mount point of removable storage, if any
    pub storage_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Sleep { duration_ms: u64 },
    /// A new image was selected for boot
    Restart,
    /// A storage image needs the only OTA slot, which is running
    RestartToFactory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    NotDue,
    NotConfigured,
    LinkDown(String),
    Empty,
    Delivered { records: usize },
    Rejected { status: u16 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    NotAttempted,
    Synced(SyncOutcome),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkFirmware {
    NotChecked,
    UpToDate,
    Installed { version: String },
    Failed(OtaError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub wake_count: u32,
    pub interactive: bool,
    pub sample: SensorSample,
    /// Records waiting after this cycle's push (and upload)
    pub queued: usize,
    /// An unsent record was overwritten to make room
    pub displaced: bool,
    pub battery: Option<f32>,
    pub poll_interval_secs: u32,
    pub upload_interval_secs: u32,
    pub power_save: bool,
    pub storage: StorageInstall,
    pub upload: UploadOutcome,
    pub sync: SyncStatus,
    pub network_firmware: NetworkFirmware,
    pub marked_valid: bool,
    pub elapsed_ms: u64,
    pub drift_correction_ms: i64,
    pub next: NextAction,
}

impl CycleReport {
    fn new(wake_count: u32, interactive: bool) -> Self {
        Self {
            wake_count,
            interactive,
            sample: SensorSample::all_invalid(),
            queued: 0,
            displaced: false,
            battery: None,
            poll_interval_secs: 0,
            upload_interval_secs: 0,
            power_save: false,
            storage: StorageInstall::Nothing,
            upload: UploadOutcome::NotDue,
            sync: SyncStatus::NotAttempted,
            network_firmware: NetworkFirmware::NotChecked,
            marked_valid: false,
            elapsed_ms: 0,
            drift_correction_ms: 0,
            next: NextAction::Restart,
        }
    }
}

pub struct Station<F: FirmwareFlash> {
    config: ConfigStore,
    updater: FwUpdater<F>,
    clock: Box<dyn Clock>,
    sensors: SensorBank,
    display: Box<dyn StatusDisplay>,
    link: Box<dyn Connectivity>,
    transport: Box<dyn Transport>,
    time_source: Box<dyn TimeSource>,
    storage_dir: Option<PathBuf>,
    wake_cause: WakeCause,
    identity: FirmwareIdentity,
    wifi_defaults: WifiDefaults,
}

impl<F: FirmwareFlash> Station<F> {
    pub fn new(platform: Platform<F>, identity: FirmwareIdentity, wifi_defaults: WifiDefaults) -> Self {
        let mut updater = FwUpdater::new(platform.flash);
        updater.on_validate(Box::new(|running, candidate| {
            if candidate.same_build(running) {
                log::info!("Image {} is already running, skipping", candidate.version);
                return false;
            }
            true
        }));
        let mut last_step = 0;
        updater.on_progress(Box::new(move |written, total| {
            if total == 0 {
                return;
            }
            let step = written * 10 / total;
            if step != last_step {
                last_step = step;
                log::info!("Firmware write {}% ({} of {} bytes)", step * 10, written, total);
            }
        }));

        Self {
            config: platform.config,
            updater,
            clock: platform.clock,
            sensors: platform.sensors,
            display: platform.display,
            link: platform.link,
            transport: platform.transport,
            time_source: platform.time_source,
            storage_dir: platform.storage_dir,
            wake_cause: WakeCause::Timer,
            identity,
            wifi_defaults,
        }
    }

    pub fn set_wake_cause(&mut self, cause: WakeCause) {
        self.wake_cause = cause;
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ConfigStore {
        &mut self.config
    }

    pub fn updater(&self) -> &FwUpdater<F> {
        &self.updater
    }

    pub fn updater_mut(&mut self) -> &mut FwUpdater<F> {
        &mut self.updater
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run one wake cycle against `state`
    pub fn run_cycle(&mut self, state: &mut RetentionState) -> CycleReport {
        if !state.is_valid() {
            log::warn!("Retention memory is not ours, starting fresh");
            state.reset();
        }

        let now = self.clock.now_ms();
        if state.wake_count == 0 {
            log::info!("Cold boot, anchoring uptime at {}", now);
            state.clock.anchor_ms = now;
            state.last_poll_ms = now;
            self.sensors.start_background();
        }
        state.wake_count = state.wake_count.wrapping_add(1);
        let interactive = state.wake_count == 1 || self.wake_cause != WakeCause::Timer;
        let mut report = CycleReport::new(state.wake_count, interactive);
        log::info!(
            "Wake {} ({:?}), {} records queued",
            state.wake_count,
            self.wake_cause,
            state.queue.len()
        );

        let settings = Settings::load(&mut self.config, &self.wifi_defaults);
        if let Err(e) = self.config.save() {
            log::error!("Could not persist configuration: {}", e);
        }

        if let Some(dir) = self.storage_dir.clone() {
            report.storage = install_pending_image(&mut self.updater, &dir);
            match report.storage {
                StorageInstall::Installed { .. } => {
                    report.next = NextAction::Restart;
                    return report;
                }
                StorageInstall::NeedsFactory => {
                    report.next = NextAction::RestartToFactory;
                    return report;
                }
                _ => {}
            }
        }

        // Sample
        let ctx = PollContext {
            window_ms: (now - state.last_poll_ms).max(0) as u64,
            adc_multipliers: settings.adc_multipliers,
            anemometer_radius_cm: settings.anemometer_radius_cm,
            anemometer_calibration: settings.anemometer_calibration,
        };
        let sample = self.sensors.poll(&ctx);
        state.last_poll_ms = now;
        report.sample = sample;

        if let Some(volts) = sample.value(BATTERY).filter(|v| *v >= NO_BATTERY_VOLTS) {
            state.battery.add(volts);
        }
        let battery = state.battery.value();
        report.battery = battery;

        let record = TelemetryRecord::capture(state.clock.uptime_ms(now), state.wake_count, &sample);
        if let Some(lost) = state.queue.push(record) {
            log::warn!("Telemetry queue full, dropped record from wake {}", lost.wake_count);
            report.displaced = true;
        }

        report.poll_interval_secs = settings.power.effective_interval(settings.poll_interval_secs, battery);
        report.upload_interval_secs = settings.power.effective_interval(settings.upload_interval_secs, battery);
        report.power_save = settings.power.is_active(battery);
        if report.power_save {
            log::info!(
                "Power save: battery {:.2} V, poll every {} s, upload every {} s",
                battery.unwrap_or_default(),
                report.poll_interval_secs,
                report.upload_interval_secs
            );
        }

        if interactive {
            self.show_status(&settings, state, &report);
        }

        self.network_session(state, &settings, &mut report);
        report.queued = state.queue.len();

        report.marked_valid = self.updater.mark_app_valid();

        if let NetworkFirmware::Installed { .. } = report.network_firmware {
            report.next = NextAction::Restart;
            return report;
        }

        report.elapsed_ms = self.clock.since_wake_ms();
        let plan = plan_sleep(
            u64::from(report.poll_interval_secs) * 1000,
            report.elapsed_ms,
            settings.min_sleep_ms,
        );
        if plan.overran {
            log::warn!(
                "Cycle took {} ms of a {} s interval, sleeping a full interval",
                report.elapsed_ms,
                report.poll_interval_secs
            );
        }

        let mut duration_ms = plan.duration_ms;
        if !interactive && state.clock.time_correction != 0.0 {
            let correction = state.clock.sleep_correction_ms(duration_ms);
            duration_ms = (duration_ms as i64 - correction).max(settings.min_sleep_ms as i64) as u64;
            let now = self.clock.now_ms();
            self.clock.set_now_ms(now + correction);
            report.drift_correction_ms = correction;
            log::debug!("Drift correction {} ms, sleeping {} ms", correction, duration_ms);
        }

        report.next = NextAction::Sleep { duration_ms };
        log::info!(
            "Cycle done in {} ms: {}/{} sensors, {} queued, sleeping {} ms",
            report.elapsed_ms,
            sample.valid_count(),
            SENSOR_COUNT,
            report.queued,
            duration_ms
        );
        report
    }

    fn show_status(&mut self, settings: &Settings, state: &RetentionState, report: &CycleReport) {
        let uptime_s = state.clock.uptime_ms(self.clock.now_ms()) / 1000;
        let mut text = format!(
            "{}\nUp {}h{:02}m, wake {}\nSensors {}/{} ok, {} queued",
            settings.station_name,
            uptime_s / 3600,
            uptime_s / 60 % 60,
            state.wake_count,
            report.sample.valid_count(),
            SENSOR_COUNT,
            state.queue.len()
        );
        if let Some(volts) = report.battery {
            text.push_str(&format!("\nBattery {:.2} V", volts));
        }
        if self.updater.error().is_some() {
            text.push_str(&format!("\nOTA {}", self.updater.error_str()));
        }
        self.display.show(&text);
    }

    fn network_session(&mut self, state: &mut RetentionState, settings: &Settings, report: &mut CycleReport) {
        let now = self.clock.now_ms();
        if now < state.next_upload_ms - UPLOAD_LEAD_MS {
            report.upload = UploadOutcome::NotDue;
            return;
        }
        let wants_firmware = settings.ota_enabled && !settings.ota_url.is_empty();
        if !settings.wifi_configured() || !(settings.upload_configured() || wants_firmware) {
            log::debug!("Upload due but no network configured");
            report.upload = UploadOutcome::NotConfigured;
            return;
        }

        let wifi_timeout = Duration::from_secs(u64::from(settings.wifi_timeout_secs));
        if let Err(e) = self
            .link
            .connect(&settings.wifi_ssid, &settings.wifi_password, wifi_timeout)
        {
            // Deadline stays put so the next cycle tries again
            log::warn!("WiFi connect to '{}' failed: {}", settings.wifi_ssid, e);
            report.upload = UploadOutcome::LinkDown(e.to_string());
            return;
        }

        report.sync = match synchronize(
            &mut state.clock,
            self.clock.as_mut(),
            self.time_source.as_mut(),
            &settings.ntp_server,
        ) {
            Ok(outcome) => SyncStatus::Synced(outcome),
            Err(e) => {
                log::warn!("Time sync with {} failed: {}", settings.ntp_server, e);
                SyncStatus::Failed(e.to_string())
            }
        };

        report.upload = if settings.upload_configured() {
            self.upload(state, settings, report.power_save)
        } else {
            UploadOutcome::NotConfigured
        };

        // Measured from the start of this wake, after any clock jump
        let cycle_start = self.clock.now_ms() - self.clock.since_wake_ms() as i64;
        state.next_upload_ms = cycle_start + i64::from(report.upload_interval_secs) * 1000;

        if wants_firmware {
            report.network_firmware = self.fetch_firmware(settings);
        }

        self.link.disconnect();
    }

    fn upload(&mut self, state: &mut RetentionState, settings: &Settings, power_save: bool) -> UploadOutcome {
        if state.queue.is_empty() {
            return UploadOutcome::Empty;
        }
        let now = self.clock.now_ms();
        let ctx = BatchContext {
            station: &settings.station_name,
            group: &settings.station_group,
            version: &self.identity.version,
            build: &self.identity.build,
            anchor_ms: state.clock.anchor_ms,
            uptime_ms: state.clock.uptime_ms(now),
            cycles: state.wake_count,
            ntp_delta_ms: state.clock.last_delta_ms,
            power_save,
        };
        let batch = match encode_batch(
            settings.upload_format,
            &settings.upload_url,
            &settings.upload_database,
            &ctx,
            state.queue.iter(),
        ) {
            Ok(batch) => batch,
            Err(e) => {
                log::error!("Could not encode telemetry: {}", e);
                return UploadOutcome::Failed(e.to_string());
            }
        };

        let auth = BasicAuth::from_settings(&settings.upload_username, &settings.upload_password);
        let request = PostRequest {
            url: &batch.url,
            content_type: batch.content_type,
            body: batch.body.as_bytes(),
            auth: auth.as_ref(),
            timeout: Duration::from_secs(u64::from(settings.http_timeout_secs)),
        };
        log::info!(
            "Uploading {} records ({} bytes, {}) to {}",
            batch.records,
            batch.body.len(),
            settings.upload_format.as_str(),
            batch.url
        );
        match self.transport.post(&request) {
            Ok(status) if is_ack(status) => {
                state.queue.clear();
                UploadOutcome::Delivered { records: batch.records }
            }
            Ok(status) => {
                log::warn!("Upload rejected with HTTP {}", status);
                UploadOutcome::Rejected { status }
            }
            Err(e) => {
                log::warn!("Upload failed: {}", e);
                UploadOutcome::Failed(e.to_string())
            }
        }
    }

    /// Check the firmware URL and install what it serves. The header is
    /// read and compared with the running image before a slot is opened, so
    /// a missing or unchanged image leaves flash untouched.
    fn fetch_firmware(&mut self, settings: &Settings) -> NetworkFirmware {
        let auth = BasicAuth::from_settings(&settings.upload_username, &settings.upload_password);
        let timeout = Duration::from_secs(u64::from(settings.http_timeout_secs));
        let updater = &mut self.updater;

        log::info!("Checking {} for new firmware", settings.ota_url);
        let mut download = match self.transport.open(&settings.ota_url, auth.as_ref(), timeout) {
            Ok(download) => download,
            Err(e) => {
                log::warn!("Firmware download failed: {}", e);
                return NetworkFirmware::Failed(OtaError::ReadError(e.to_string()));
            }
        };
        let header = match read_header(&mut download.body) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Firmware header read failed: {}", e);
                return NetworkFirmware::Failed(OtaError::ReadError(e.to_string()));
            }
        };
        let candidate = match AppDescriptor::parse(&header) {
            Ok(candidate) => candidate,
            Err(e) => {
                log::warn!("{} does not serve a firmware image: {} ({})", settings.ota_url, e, e.code());
                return NetworkFirmware::Failed(e);
            }
        };
        if candidate.same_build(&updater.flash().running_descriptor()) {
            log::info!("Image {} is already running, skipping", candidate.version);
            return NetworkFirmware::UpToDate;
        }

        let result = updater.begin(download.length.unwrap_or(0)).and_then(|()| {
            updater.write(&header)?;
            updater.write_from_reader(&mut download.body)?;
            updater.end()
        });

        match result {
            Ok(()) => {
                log::info!("Firmware {} downloaded, restarting into it", candidate.version);
                NetworkFirmware::Installed {
                    version: candidate.version,
                }
            }
            Err(OtaError::UserAborted) => {
                updater.reset();
                NetworkFirmware::UpToDate
            }
            Err(e) => {
                log::warn!("Network firmware update failed: {} ({})", e, e.code());
                if updater.state() == UpdateState::Failed {
                    updater.reset();
                }
                NetworkFirmware::Failed(e)
            }
        }
    }
}
