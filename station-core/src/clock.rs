/// Clock drift tracking and SNTP synchronization
///
/// The RTC on these boards drifts by a few hundred ms per minute. The first
/// sync after a cold boot may jump the clock, since nothing has been uploaded
/// yet. Later syncs only accumulate a damped drift rate that the scheduler
/// spreads over the next deep sleep, so recorded timestamps never jump.
use sntpc::{NtpContext, StdTimestampGen};
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;
use thiserror::Error;

pub const NTP_PORT: u16 = 123;
pub const NTP_TIMEOUT: Duration = Duration::from_secs(2);
/// Fraction of the measured drift applied per sync
pub const DAMPING: f64 = 0.5;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("cannot resolve time server '{0}'")]
    Resolve(String),
    #[error("time server did not answer in time")]
    Timeout,
    #[error("time server reply rejected: {0}")]
    Protocol(String),
    #[error("time server I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Wall clock kept by the RTC, plus a monotonic timer since this wake
pub trait Clock {
    /// Milliseconds since the Unix epoch, as the RTC currently believes
    fn now_ms(&self) -> i64;
    fn set_now_ms(&mut self, ms: i64);
    /// Milliseconds since the CPU woke up for this cycle
    fn since_wake_ms(&self) -> u64;
}

/// One request/response exchange with an authoritative time server
pub trait TimeSource {
    /// Returns the server's transmit time in Unix milliseconds
    fn query(&mut self, server: &str, timeout: Duration) -> Result<i64, SyncError>;
}

/// Drift bookkeeping that lives in retention memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockState {
    /// Wall-clock time the station cold booted; uptime = now - anchor
    pub anchor_ms: i64,
    /// Wall-clock time of the last successful sync, 0 before the first
    pub last_adjustment_ms: i64,
    pub last_delta_ms: i64,
    /// Pending correction as a rate, ms of drift per ms of sleep
    pub time_correction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// First sync since cold boot: clock and anchor moved by the delta
    AnchorShifted { delta_ms: i64 },
    /// Later sync: only the drift rate changed
    Corrected { delta_ms: i64, time_correction: f64 },
}

impl ClockState {
    pub const fn new() -> Self {
        Self {
            anchor_ms: 0,
            last_adjustment_ms: 0,
            last_delta_ms: 0,
            time_correction: 0.0,
        }
    }

    pub fn uptime_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.anchor_ms
    }

    pub fn is_synced(&self) -> bool {
        self.last_adjustment_ms != 0
    }

    /// Fold a measured `delta_ms` (server minus local) taken at `now_ms` into
    /// the state
    pub fn record_sync(&mut self, now_ms: i64, delta_ms: i64) -> SyncOutcome {
        let outcome = if self.last_adjustment_ms == 0 {
            self.anchor_ms += delta_ms;
            SyncOutcome::AnchorShifted { delta_ms }
        } else {
            let elapsed = now_ms - self.last_adjustment_ms;
            if elapsed > 0 {
                self.time_correction += delta_ms as f64 / elapsed as f64 * DAMPING;
            }
            SyncOutcome::Corrected {
                delta_ms,
                time_correction: self.time_correction,
            }
        };
        self.last_adjustment_ms = now_ms;
        self.last_delta_ms = delta_ms;
        outcome
    }

    /// Milliseconds to nudge the clock forward over a sleep of `sleep_ms`
    pub fn sleep_correction_ms(&self, sleep_ms: u64) -> i64 {
        (self.time_correction * sleep_ms as f64).round() as i64
    }
}

impl Default for ClockState {
    fn default() -> Self {
        Self::new()
    }
}

/// Query `source` and apply the result to `clock` and `state`
pub fn synchronize(
    state: &mut ClockState,
    clock: &mut dyn Clock,
    source: &mut dyn TimeSource,
    server: &str,
) -> Result<SyncOutcome, SyncError> {
    let sent_ms = clock.now_ms();
    let server_ms = source.query(server, NTP_TIMEOUT)?;
    let received_ms = clock.now_ms();

    let half_round_trip = (received_ms - sent_ms).max(0) / 2;
    let delta_ms = server_ms - (sent_ms + half_round_trip);
    let now_ms = server_ms + half_round_trip;

    let outcome = state.record_sync(now_ms, delta_ms);
    if let SyncOutcome::AnchorShifted { .. } = outcome {
        clock.set_now_ms(received_ms + delta_ms);
    }

    log::info!(
        "NTP: clock was {} ms {} (rtt {} ms)",
        delta_ms.abs(),
        if delta_ms < 0 { "ahead" } else { "behind" },
        half_round_trip * 2
    );
    if let SyncOutcome::Corrected { time_correction, .. } = outcome {
        log::info!("NTP: drift correction now {:.6} ms/ms", time_correction);
    }
    Ok(outcome)
}

/// Unix milliseconds from whole seconds and a 32 bit binary fraction
pub fn unix_ms(seconds: u32, fraction: u32) -> i64 {
    i64::from(seconds) * 1000 + ((u64::from(fraction) * 1000) >> 32) as i64
}

/// SNTP over UDP with `sntpc`; only the server's transmit time is used, the
/// round trip is measured by [`synchronize`]
#[derive(Debug, Default)]
pub struct SntpClient;

impl TimeSource for SntpClient {
    fn query(&mut self, server: &str, timeout: Duration) -> Result<i64, SyncError> {
        let addr = (server, NTP_PORT)
            .to_socket_addrs()
            .map_err(|_| SyncError::Resolve(server.to_string()))?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| SyncError::Resolve(server.to_string()))?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_read_timeout(Some(timeout))?;
        socket.set_write_timeout(Some(timeout))?;

        let context = NtpContext::new(StdTimestampGen::default());
        match sntpc::sync::get_time(addr, &socket, context) {
            Ok(time) => Ok(unix_ms(time.sec(), time.sec_fraction())),
            Err(sntpc::Error::Network) => Err(SyncError::Timeout),
            Err(e) => Err(SyncError::Protocol(format!("{:?}", e))),
        }
    }
}
