// Telemetry records and the retention-memory ring they wait in

mod encode;

pub use encode::{encode_batch, encode_influx, encode_json, BatchContext, EncodedBatch, UploadFormat};

use crate::sensors::{SensorSample, SENSOR_COUNT};

/// Records kept while the network is unavailable. At the default 60 s poll
/// interval this covers about half an hour of missed uploads.
pub const QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryRecord {
    pub occupied: bool,
    /// Milliseconds since the epoch anchor at capture time
    pub uptime_ms: i64,
    pub wake_count: u32,
    pub values: [f32; SENSOR_COUNT],
    pub status: u16,
}

impl TelemetryRecord {
    pub const EMPTY: Self = Self {
        occupied: false,
        uptime_ms: 0,
        wake_count: 0,
        values: [0.0; SENSOR_COUNT],
        status: 0,
    };

    pub fn capture(uptime_ms: i64, wake_count: u32, sample: &SensorSample) -> Self {
        Self {
            occupied: true,
            uptime_ms,
            wake_count,
            values: sample.values,
            status: sample.status,
        }
    }

    pub fn value(&self, index: usize) -> Option<f32> {
        (self.status & (1 << index) == 0).then(|| self.values[index])
    }
}

impl Default for TelemetryRecord {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Fixed ring of records. Every push lands at `position` and advances it, so
/// once full the oldest record is overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryQueue<const N: usize> {
    slots: [TelemetryRecord; N],
    position: usize,
}

impl<const N: usize> TelemetryQueue<N> {
    pub const fn new() -> Self {
        Self {
            slots: [TelemetryRecord::EMPTY; N],
            position: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Store a record, returning the unsent one it displaced, if any
    pub fn push(&mut self, record: TelemetryRecord) -> Option<TelemetryRecord> {
        let slot = &mut self.slots[self.position];
        let displaced = slot.occupied.then_some(*slot);
        *slot = TelemetryRecord {
            occupied: true,
            ..record
        };
        self.position = (self.position + 1) % N;
        displaced
    }

    pub fn slot(&self, index: usize) -> Option<&TelemetryRecord> {
        self.slots.get(index)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|r| r.occupied).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|r| !r.occupied)
    }

    /// Occupied records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &TelemetryRecord> + '_ {
        let (newer, older) = self.slots.split_at(self.position);
        older.iter().chain(newer.iter()).filter(|r| r.occupied)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = TelemetryRecord::EMPTY;
        }
    }
}

impl<const N: usize> Default for TelemetryQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(uptime_ms: i64) -> TelemetryRecord {
        let mut sample = SensorSample::all_invalid();
        sample.values[0] = uptime_ms as f32;
        sample.status &= !1;
        TelemetryRecord::capture(uptime_ms, uptime_ms as u32, &sample)
    }

    #[test]
    fn test_push_advances_position() {
        let mut queue = TelemetryQueue::<4>::new();
        assert!(queue.is_empty());
        assert!(queue.push(record(1)).is_none());
        assert_eq!(queue.position(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.slot(0).unwrap().uptime_ms, 1);
    }

    #[test]
    fn test_wrap_overwrites_oldest() {
        let mut queue = TelemetryQueue::<3>::new();
        for t in 1..=3 {
            queue.push(record(t));
        }
        assert_eq!(queue.position(), 0);
        let displaced = queue.push(record(4)).unwrap();
        assert_eq!(displaced.uptime_ms, 1);

        let order: Vec<i64> = queue.iter().map(|r| r.uptime_ms).collect();
        assert_eq!(order, vec![2, 3, 4]);
    }

    #[test]
    fn test_zero_uptime_record_is_still_occupied() {
        let mut queue = TelemetryQueue::<4>::new();
        queue.push(record(0));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.iter().next().unwrap().uptime_ms, 0);
    }

    #[test]
    fn test_clear_empties_every_slot() {
        let mut queue = TelemetryQueue::<4>::new();
        queue.push(record(5));
        queue.push(record(6));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.iter().count(), 0);
        // Position keeps advancing after a clear
        assert_eq!(queue.position(), 2);
    }

    #[test]
    fn test_record_hides_invalid_values() {
        let r = record(9);
        assert_eq!(r.value(0), Some(9.0));
        assert_eq!(r.value(1), None);
    }

    proptest! {
        #[test]
        fn prop_queue_keeps_only_most_recent(extra in 0usize..40) {
            const N: usize = 8;
            let mut queue = TelemetryQueue::<N>::new();
            let total = N + extra;
            for t in 1..=total {
                queue.push(record(t as i64));
            }
            prop_assert_eq!(queue.len(), N);
            let kept: Vec<i64> = queue.iter().map(|r| r.uptime_ms).collect();
            let expected: Vec<i64> = ((total - N + 1)..=total).map(|t| t as i64).collect();
            prop_assert_eq!(kept, expected);
        }
    }
}
