// In-memory platform: flash, RTC, time server, sensors, WiFi, HTTP and a
// display. Used by the tests and by the host simulator binary. Every sim
// type is a cheap handle; clones share state so a test can keep one after
// handing another to the station.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use crate::clock::{Clock, SyncError, TimeSource};
use crate::network::{BasicAuth, Connectivity, Download, PostRequest, Transport, TransportError};
use crate::ota::{
    AppDescriptor, FirmwareFlash, FlashError, Partition, PartitionKind, PartitionTable, HEADER_LEN, IMAGE_MAGIC,
};
use crate::scheduler::StatusDisplay;
use crate::sensors::{DriverId, PollContext, Reading, SensorDriver, SensorError};

/// A complete image: header carrying `desc`, then `payload_len` filler bytes
pub fn build_image(desc: &AppDescriptor, payload_len: usize) -> Vec<u8> {
    let mut image = desc.to_header();
    image.extend((0..payload_len).map(|i| (i % 251) as u8));
    image
}

pub fn station_descriptor(version: &str) -> AppDescriptor {
    AppDescriptor {
        version: version.to_string(),
        project_name: "solar-station".to_string(),
        time: "06:00:00".to_string(),
        date: "Oct 16 2026".to_string(),
        idf_version: "v5.3".to_string(),
        ..AppDescriptor::default()
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FlashInner {
    table: PartitionTable,
    running: String,
    running_desc: AppDescriptor,
    contents: HashMap<String, Vec<u8>>,
    boot: Option<String>,
    writing: Option<String>,
    begin_calls: usize,
    pending_verify: bool,
    erased_previous: usize,
    restarts: usize,
    running_invalidated: bool,
    fail_writes: bool,
    fail_validation: bool,
    fail_set_boot: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SimFlash {
    inner: Rc<RefCell<FlashInner>>,
}

impl SimFlash {
    pub fn new(table: PartitionTable, running: &str) -> Self {
        let flash = Self::default();
        {
            let mut inner = flash.inner.borrow_mut();
            inner.table = table;
            inner.running = running.to_string();
            inner.running_desc = station_descriptor("0.3.2");
        }
        flash
    }

    /// Factory image plus two OTA slots, running from `ota_0`
    pub fn dual_slot() -> Self {
        Self::new(
            PartitionTable::new(vec![
                Partition::new("factory", PartitionKind::Factory, 0x10000, 0x100000),
                Partition::new("ota_0", PartitionKind::Ota(0), 0x110000, 0x100000),
                Partition::new("ota_1", PartitionKind::Ota(1), 0x210000, 0x100000),
            ]),
            "ota_0",
        )
    }

    pub fn set_running_descriptor(&self, desc: AppDescriptor) {
        self.inner.borrow_mut().running_desc = desc;
    }

    pub fn contents(&self, label: &str) -> Vec<u8> {
        self.inner.borrow().contents.get(label).cloned().unwrap_or_default()
    }

    pub fn boot_label(&self) -> Option<String> {
        self.inner.borrow().boot.clone()
    }

    pub fn running_label(&self) -> String {
        self.inner.borrow().running.clone()
    }

    pub fn begin_calls(&self) -> usize {
        self.inner.borrow().begin_calls
    }

    pub fn pending_verify(&self) -> bool {
        self.inner.borrow().pending_verify
    }

    pub fn erased_previous(&self) -> usize {
        self.inner.borrow().erased_previous
    }

    pub fn restarts(&self) -> usize {
        self.inner.borrow().restarts
    }

    pub fn running_invalidated(&self) -> bool {
        self.inner.borrow().running_invalidated
    }

    pub fn fail_writes(&self, fail: bool) {
        self.inner.borrow_mut().fail_writes = fail;
    }

    pub fn fail_validation(&self, fail: bool) {
        self.inner.borrow_mut().fail_validation = fail;
    }

    pub fn fail_set_boot(&self, fail: bool) {
        self.inner.borrow_mut().fail_set_boot = fail;
    }

    pub fn set_pending_verify(&self, pending: bool) {
        self.inner.borrow_mut().pending_verify = pending;
    }

    /// What the bootloader does on reset: switch to the selected partition
    /// and hold its image in pending-verify until it marks itself valid
    pub fn reboot(&self) {
        let mut inner = self.inner.borrow_mut();
        let Some(boot) = inner.boot.take() else {
            return;
        };
        if boot == inner.running {
            return;
        }
        let image = inner.contents.get(&boot).cloned().unwrap_or_default();
        if let Some(desc) = image.get(..HEADER_LEN).and_then(|h| AppDescriptor::parse(h).ok()) {
            inner.running_desc = desc;
        }
        inner.pending_verify = boot != "factory";
        inner.running = boot;
    }
}

impl FirmwareFlash for SimFlash {
    fn partitions(&self) -> PartitionTable {
        self.inner.borrow().table.clone()
    }

    fn running(&self) -> Result<Partition, FlashError> {
        let inner = self.inner.borrow();
        let running = inner.table.iter().find(|p| p.label == inner.running).cloned();
        match running {
            Some(partition) => Ok(partition),
            None => Err(FlashError::UnknownRunning(inner.running.clone())),
        }
    }

    fn running_descriptor(&self) -> AppDescriptor {
        self.inner.borrow().running_desc.clone()
    }

    fn begin(&mut self, target: &Partition, _size: usize) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        inner.begin_calls += 1;
        if inner.pending_verify {
            return Err(FlashError::PendingVerify);
        }
        inner.contents.insert(target.label.clone(), Vec::new());
        inner.writing = Some(target.label.clone());
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_writes {
            return Err(FlashError::Platform(-1));
        }
        let Some(label) = inner.writing.clone() else {
            return Err(FlashError::Platform(-2));
        };
        inner.contents.entry(label).or_default().extend_from_slice(data);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        let label = inner.writing.take().ok_or(FlashError::Platform(-2))?;
        let starts_ok = inner
            .contents
            .get(&label)
            .and_then(|c| c.first())
            .is_some_and(|b| *b == IMAGE_MAGIC);
        if inner.fail_validation || !starts_ok {
            return Err(FlashError::ValidateFailed);
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.inner.borrow_mut().writing = None;
    }

    fn set_boot(&mut self, target: &Partition) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        if inner.fail_set_boot {
            return Err(FlashError::Platform(-3));
        }
        inner.boot = Some(target.label.clone());
        Ok(())
    }

    fn rollback_possible(&self) -> bool {
        self.inner.borrow().pending_verify
    }

    fn mark_valid(&mut self) -> Result<(), FlashError> {
        self.inner.borrow_mut().pending_verify = false;
        Ok(())
    }

    fn erase_previous(&mut self) -> Result<(), FlashError> {
        self.inner.borrow_mut().erased_previous += 1;
        Ok(())
    }

    fn mark_invalid_and_reboot(&mut self) -> Result<(), FlashError> {
        let mut inner = self.inner.borrow_mut();
        inner.running_invalidated = true;
        inner.restarts += 1;
        Ok(())
    }

    fn restart(&mut self) {
        self.inner.borrow_mut().restarts += 1;
    }
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// RTC and wake timer. `advance` moves both; `deep_sleep` moves the RTC and
/// resets the wake timer.
#[derive(Debug, Clone)]
pub struct SimClock {
    now_ms: Rc<Cell<i64>>,
    wake_ms: Rc<Cell<u64>>,
}

impl SimClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Rc::new(Cell::new(now_ms)),
            wake_ms: Rc::new(Cell::new(0)),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms as i64);
        self.wake_ms.set(self.wake_ms.get() + ms);
    }

    pub fn deep_sleep(&self, ms: u64) {
        self.now_ms.set(self.now_ms.get() + ms as i64);
        self.wake_ms.set(0);
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.get()
    }

    fn set_now_ms(&mut self, ms: i64) {
        self.now_ms.set(ms);
    }

    fn since_wake_ms(&self) -> u64 {
        self.wake_ms.get()
    }
}

/// Time server that always answers with a fixed time, or never answers
#[derive(Debug, Clone)]
pub struct FixedTimeSource {
    server_ms: Rc<Cell<Option<i64>>>,
    queries: Rc<Cell<usize>>,
}

impl FixedTimeSource {
    pub fn new(server_ms: i64) -> Self {
        Self {
            server_ms: Rc::new(Cell::new(Some(server_ms))),
            queries: Rc::new(Cell::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            server_ms: Rc::new(Cell::new(None)),
            queries: Rc::new(Cell::new(0)),
        }
    }

    pub fn set_server_ms(&self, server_ms: i64) {
        self.server_ms.set(Some(server_ms));
    }

    pub fn queries(&self) -> usize {
        self.queries.get()
    }
}

impl TimeSource for FixedTimeSource {
    fn query(&mut self, _server: &str, _timeout: Duration) -> Result<i64, SyncError> {
        self.queries.set(self.queries.get() + 1);
        self.server_ms.get().ok_or(SyncError::Timeout)
    }
}

/// Answers with the wall time of a [`SimClock`] shifted by a fixed offset,
/// like a real server would while the RTC drifts
#[derive(Debug, Clone)]
pub struct OffsetTimeSource {
    clock: SimClock,
    offset_ms: Rc<Cell<i64>>,
    failing: Rc<Cell<bool>>,
}

impl OffsetTimeSource {
    pub fn new(clock: SimClock, offset_ms: i64) -> Self {
        Self {
            clock,
            offset_ms: Rc::new(Cell::new(offset_ms)),
            failing: Rc::new(Cell::new(false)),
        }
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.set(offset_ms);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.set(failing);
    }
}

impl TimeSource for OffsetTimeSource {
    fn query(&mut self, _server: &str, _timeout: Duration) -> Result<i64, SyncError> {
        if self.failing.get() {
            return Err(SyncError::Timeout);
        }
        Ok(self.clock.now_ms() + self.offset_ms.get())
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct SensorInner {
    values: Vec<f32>,
    failing: bool,
    reads: usize,
    starts: usize,
}

/// Driver that returns scripted values. Each read can cost simulated time.
#[derive(Debug, Clone)]
pub struct SimSensor {
    id: DriverId,
    inner: Rc<RefCell<SensorInner>>,
    latency: Option<(SimClock, u64)>,
}

impl SimSensor {
    pub fn new(id: DriverId, values: &[f32]) -> Self {
        Self {
            id,
            inner: Rc::new(RefCell::new(SensorInner {
                values: values.to_vec(),
                failing: false,
                reads: 0,
                starts: 0,
            })),
            latency: None,
        }
    }

    pub fn failing(id: DriverId) -> Self {
        let sensor = Self::new(id, &[]);
        sensor.set_failing(true);
        sensor
    }

    pub fn with_latency(mut self, clock: &SimClock, ms: u64) -> Self {
        self.latency = Some((clock.clone(), ms));
        self
    }

    pub fn set_values(&self, values: &[f32]) {
        self.inner.borrow_mut().values = values.to_vec();
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.borrow_mut().failing = failing;
    }

    pub fn reads(&self) -> usize {
        self.inner.borrow().reads
    }

    pub fn starts(&self) -> usize {
        self.inner.borrow().starts
    }
}

impl SensorDriver for SimSensor {
    fn id(&self) -> DriverId {
        self.id
    }

    fn start(&mut self) {
        self.inner.borrow_mut().starts += 1;
    }

    fn read(&mut self, _ctx: &PollContext) -> Result<Reading, SensorError> {
        if let Some((clock, ms)) = &self.latency {
            clock.advance(*ms);
        }
        let mut inner = self.inner.borrow_mut();
        inner.reads += 1;
        if inner.failing {
            return Err(SensorError::NoResponse(self.id));
        }
        let mut reading = Reading::new();
        for v in inner.values.iter().copied() {
            if reading.push(v).is_err() {
                break;
            }
        }
        Ok(reading)
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LinkInner {
    available: bool,
    connected: bool,
    connects: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimLink {
    inner: Rc<RefCell<LinkInner>>,
}

impl SimLink {
    pub fn up() -> Self {
        let link = Self::default();
        link.set_available(true);
        link
    }

    pub fn down() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.borrow_mut().available = available;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    pub fn connects(&self) -> usize {
        self.inner.borrow().connects
    }
}

impl Connectivity for SimLink {
    fn connect(&mut self, ssid: &str, _password: &str, _timeout: Duration) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.connects += 1;
        if !inner.available {
            return Err(TransportError::Timeout(ssid.to_string()));
        }
        inner.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.inner.borrow_mut().connected = false;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedPost {
    pub url: String,
    pub content_type: String,
    pub body: String,
    pub authorization: Option<String>,
}

#[derive(Debug)]
struct TransportInner {
    default_status: u16,
    scripted: VecDeque<Result<u16, String>>,
    posts: Vec<RecordedPost>,
    downloads: HashMap<String, Vec<u8>>,
    opens: usize,
}

/// HTTP double: records every POST and serves firmware images by URL
#[derive(Debug, Clone)]
pub struct RecordingTransport {
    inner: Rc<RefCell<TransportInner>>,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TransportInner {
                default_status: 204,
                scripted: VecDeque::new(),
                posts: Vec::new(),
                downloads: HashMap::new(),
                opens: 0,
            })),
        }
    }

    pub fn set_default_status(&self, status: u16) {
        self.inner.borrow_mut().default_status = status;
    }

    /// Answer the next POST with `status`
    pub fn push_status(&self, status: u16) {
        self.inner.borrow_mut().scripted.push_back(Ok(status));
    }

    /// Fail the next POST at the transport level
    pub fn push_failure(&self, reason: &str) {
        self.inner.borrow_mut().scripted.push_back(Err(reason.to_string()));
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.inner.borrow_mut().downloads.insert(url.to_string(), body);
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.inner.borrow().posts.clone()
    }

    pub fn opens(&self) -> usize {
        self.inner.borrow().opens
    }
}

impl Transport for RecordingTransport {
    fn post(&mut self, request: &PostRequest<'_>) -> Result<u16, TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.posts.push(RecordedPost {
            url: request.url.to_string(),
            content_type: request.content_type.to_string(),
            body: String::from_utf8_lossy(request.body).into_owned(),
            authorization: request.auth.map(BasicAuth::header_value),
        });
        match inner.scripted.pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(TransportError::Other(reason)),
            None => Ok(inner.default_status),
        }
    }

    fn open<'a>(
        &'a mut self,
        url: &str,
        _auth: Option<&BasicAuth>,
        _timeout: Duration,
    ) -> Result<Download<'a>, TransportError> {
        let mut inner = self.inner.borrow_mut();
        inner.opens += 1;
        match inner.downloads.get(url) {
            Some(body) => Ok(Download {
                length: Some(body.len()),
                body: Box::new(Cursor::new(body.clone())),
            }),
            None => Err(TransportError::Status(404)),
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    screens: Rc<RefCell<Vec<String>>>,
}

impl RecordingDisplay {
    pub fn screens(&self) -> Vec<String> {
        self.screens.borrow().clone()
    }
}

impl StatusDisplay for RecordingDisplay {
    fn show(&mut self, text: &str) {
        self.screens.borrow_mut().push(text.to_string());
    }
}
