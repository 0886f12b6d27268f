//! Per-thread buffer pair: the write-side hot path.
//!
//! Each thread owns one fixed-capacity event byte buffer and one
//! fixed-capacity string buffer. Appends check remaining capacity for the
//! whole record (and the whole argument-value batch) up front, so a record
//! never tears across two blocks. A full buffer is retired (snapshotted
//! into [`CollectorStorage`] and replaced with a fresh empty one) before
//! the new write lands.
//!
//! A single mutex per buffer pair serializes appends and retirement. The
//! owning thread is the only writer, so the lock is uncontended on the
//! common path; it only matters when a `drain_all` from another thread races
//! an overflow-triggered retire. At most one retire wins; the other sees the
//! already-fresh buffer and skips.

use std::sync::Mutex;

use crate::format::{MeasureKind, ARGS_RECORD_SIZE, END_RECORD_SIZE, NAMED_RECORD_SIZE};
use crate::storage::{CollectorStorage, StorageBlock};

/// Fixed-capacity byte buffer for encoded event records.
struct EventBuf {
    data: Vec<u8>,
    capacity: usize,
}

impl EventBuf {
    fn new(capacity: usize) -> Self {
        EventBuf {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn fits(&self, size: usize) -> bool {
        self.data.len() + size <= self.capacity
    }

    fn put_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_be_bytes());
    }
}

/// Fixed-capacity buffer for argument values, in production order.
struct StringBuf {
    values: Vec<String>,
    capacity: usize,
}

impl StringBuf {
    fn new(capacity: usize) -> Self {
        StringBuf {
            values: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn fits(&self, count: usize) -> bool {
        self.values.len() + count <= self.capacity
    }
}

struct BufferPair {
    events: EventBuf,
    strings: StringBuf,
}

/// The buffer pair owned by one thread. Created lazily on the thread's first
/// record and kept for the thread's lifetime, retiring repeatedly.
pub struct ThreadBuffers {
    thread_id: u64,
    event_capacity: usize,
    string_capacity: usize,
    inner: Mutex<BufferPair>,
}

impl ThreadBuffers {
    pub fn new(thread_id: u64, event_capacity: usize, string_capacity: usize) -> Self {
        ThreadBuffers {
            thread_id,
            event_capacity,
            string_capacity,
            inner: Mutex::new(BufferPair {
                events: EventBuf::new(event_capacity),
                strings: StringBuf::new(string_capacity),
            }),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Record a Duration or Instant event (name + timestamp).
    pub fn record_named(
        &self,
        storage: &CollectorStorage,
        kind: MeasureKind,
        name_id: u32,
        time: u64,
    ) {
        debug_assert!(!kind.has_args() && kind != MeasureKind::DurationEnd);
        let mut inner = self.inner.lock().unwrap();
        self.check_events_overflow(&mut inner, storage, NAMED_RECORD_SIZE);
        inner.events.put_u32(kind as u32);
        inner.events.put_u32(name_id);
        inner.events.put_u64(time);
    }

    /// Record an argument-bearing event. The values land in the parallel
    /// string buffer; only their count goes into the event record.
    pub fn record_with_args(
        &self,
        storage: &CollectorStorage,
        kind: MeasureKind,
        name_id: u32,
        args_id: u32,
        values: Vec<String>,
        time: u64,
    ) {
        debug_assert!(kind.has_args());
        let mut inner = self.inner.lock().unwrap();
        self.check_events_overflow(&mut inner, storage, ARGS_RECORD_SIZE);
        self.check_strings_overflow(&mut inner, storage, values.len());
        inner.events.put_u32(kind as u32);
        inner.events.put_u32(name_id);
        inner.events.put_u32(args_id);
        inner.events.put_u32(values.len() as u32);
        inner.events.put_u64(time);
        inner.strings.values.extend(values);
    }

    /// Record a DurationEnd, closing the most recent open duration on this
    /// thread.
    pub fn record_duration_end(&self, storage: &CollectorStorage, time: u64) {
        let mut inner = self.inner.lock().unwrap();
        self.check_events_overflow(&mut inner, storage, END_RECORD_SIZE);
        inner.events.put_u32(MeasureKind::DurationEnd as u32);
        inner.events.put_u64(time);
    }

    /// Retire both buffers, regardless of how full they are. Empty buffers
    /// are skipped; a racing retire already replaced them.
    pub fn retire_all(&self, storage: &CollectorStorage) {
        let mut inner = self.inner.lock().unwrap();
        self.retire_events(&mut inner, storage);
        self.retire_strings(&mut inner, storage);
    }

    fn check_events_overflow(
        &self,
        inner: &mut BufferPair,
        storage: &CollectorStorage,
        size: usize,
    ) {
        if !inner.events.fits(size) {
            self.retire_events(inner, storage);
        }
    }

    fn check_strings_overflow(
        &self,
        inner: &mut BufferPair,
        storage: &CollectorStorage,
        count: usize,
    ) {
        if !inner.strings.fits(count) {
            self.retire_strings(inner, storage);
        }
    }

    fn retire_events(&self, inner: &mut BufferPair, storage: &CollectorStorage) {
        if inner.events.data.is_empty() {
            return;
        }
        let old = std::mem::replace(&mut inner.events, EventBuf::new(self.event_capacity));
        storage.retire(StorageBlock::Events {
            thread_id: self.thread_id,
            data: old.data,
        });
    }

    fn retire_strings(&self, inner: &mut BufferPair, storage: &CollectorStorage) {
        if inner.strings.values.is_empty() {
            return;
        }
        let old = std::mem::replace(&mut inner.strings, StringBuf::new(self.string_capacity));
        storage.retire(StorageBlock::Strings {
            thread_id: self.thread_id,
            values: old.values,
        });
    }
}
