//! The collector: thread registration and the record operations.
//!
//! Threads get small sequential ids on their first record. Each registered
//! thread owns a [`ThreadBuffers`] pair, reachable both through a
//! thread-local handle (the hot path) and through a shared registry (so
//! `drain_all` can retire every thread's buffers before a flush).

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;
use dashmap::DashMap;

use crate::buffer::ThreadBuffers;
use crate::format::MeasureKind;
use crate::storage::{CollectorStorage, DEFAULT_STORAGE_BUDGET};

/// Default event buffer capacity: 512 KiB of encoded records per thread.
pub const DEFAULT_EVENT_BUFFER_BYTES: usize = 1024 * 16 * 32;
/// Default string buffer capacity, in number of argument values.
pub const DEFAULT_STRING_BUFFER_CAPACITY: usize = 1024 * 16 * 32;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_COLLECTOR_ID: AtomicU64 = AtomicU64::new(0);
static GLOBAL: OnceLock<Collector> = OnceLock::new();
static EPOCH: OnceLock<Instant> = OnceLock::new();

struct CachedBuffers {
    collector_id: u64,
    buffers: Arc<ThreadBuffers>,
}

thread_local! {
    static THREAD_ID: Cell<Option<u64>> = const { Cell::new(None) };
    static CACHED_BUFFERS: AtomicCell<Option<Box<CachedBuffers>>> = AtomicCell::new(None);
}

/// The id of the calling thread, assigned on first use.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|cell| match cell.get() {
        Some(id) => id,
        None => {
            let id = NEXT_THREAD_ID.fetch_add(1, Ordering::SeqCst);
            cell.set(Some(id));
            id
        }
    })
}

/// Nanoseconds on the process-wide monotonic clock.
pub(crate) fn now_ns() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorConfig {
    pub event_buffer_bytes: usize,
    pub string_buffer_capacity: usize,
    pub storage_budget_bytes: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            event_buffer_bytes: DEFAULT_EVENT_BUFFER_BYTES,
            string_buffer_capacity: DEFAULT_STRING_BUFFER_CAPACITY,
            storage_budget_bytes: DEFAULT_STORAGE_BUDGET,
        }
    }
}

pub struct Collector {
    id: u64,
    config: CollectorConfig,
    buffers: DashMap<u64, Arc<ThreadBuffers>>,
    storage: CollectorStorage,
}

impl Collector {
    pub fn new(config: CollectorConfig) -> Self {
        Collector {
            id: NEXT_COLLECTOR_ID.fetch_add(1, Ordering::SeqCst),
            config,
            buffers: DashMap::new(),
            storage: CollectorStorage::new(config.storage_budget_bytes),
        }
    }

    /// The process-wide collector with default configuration, created on
    /// first use. Tests that need different capacities construct their own
    /// `Collector` instead.
    pub fn global() -> &'static Collector {
        GLOBAL.get_or_init(|| Collector::new(CollectorConfig::default()))
    }

    pub fn storage(&self) -> &CollectorStorage {
        &self.storage
    }

    pub fn record_duration_start(&self, name_id: u32) {
        self.record_duration_start_at(name_id, now_ns());
    }

    pub fn record_duration_start_at(&self, name_id: u32, time: u64) {
        self.thread_buffers()
            .record_named(&self.storage, MeasureKind::Duration, name_id, time);
    }

    pub fn record_duration_start_with_args(&self, name_id: u32, args_id: u32, values: Vec<String>) {
        self.record_duration_start_with_args_at(name_id, args_id, values, now_ns());
    }

    pub fn record_duration_start_with_args_at(
        &self,
        name_id: u32,
        args_id: u32,
        values: Vec<String>,
        time: u64,
    ) {
        self.thread_buffers().record_with_args(
            &self.storage,
            MeasureKind::DurationWithArgs,
            name_id,
            args_id,
            values,
            time,
        );
    }

    pub fn record_duration_end(&self) {
        self.record_duration_end_at(now_ns());
    }

    pub fn record_duration_end_at(&self, time: u64) {
        self.thread_buffers()
            .record_duration_end(&self.storage, time);
    }

    pub fn record_instant(&self, name_id: u32) {
        self.record_instant_at(name_id, now_ns());
    }

    pub fn record_instant_at(&self, name_id: u32, time: u64) {
        self.thread_buffers()
            .record_named(&self.storage, MeasureKind::Instant, name_id, time);
    }

    pub fn record_instant_with_args(&self, name_id: u32, args_id: u32, values: Vec<String>) {
        self.record_args_at(MeasureKind::InstantWithArgs, name_id, args_id, values, now_ns());
    }

    pub fn record_counter(&self, name_id: u32, args_id: u32, values: Vec<String>) {
        self.record_args_at(MeasureKind::Counter, name_id, args_id, values, now_ns());
    }

    pub fn record_metadata(&self, name_id: u32, args_id: u32, values: Vec<String>) {
        self.record_args_at(MeasureKind::Metadata, name_id, args_id, values, now_ns());
    }

    pub fn record_args_at(
        &self,
        kind: MeasureKind,
        name_id: u32,
        args_id: u32,
        values: Vec<String>,
        time: u64,
    ) {
        self.thread_buffers()
            .record_with_args(&self.storage, kind, name_id, args_id, values, time);
    }

    /// Retire the calling thread's buffers into storage. A thread that never
    /// recorded anything has nothing to drain.
    pub fn drain(&self) {
        let tid = current_thread_id();
        if let Some(buffers) = self.buffers.get(&tid) {
            buffers.retire_all(&self.storage);
        }
    }

    /// Retire every registered thread's buffers. Racy against threads that
    /// are still recording: everything retired by the time this returns is
    /// visible, which is at-least-once visibility, not a point-in-time
    /// snapshot.
    pub fn drain_all(&self) {
        for entry in self.buffers.iter() {
            entry.value().retire_all(&self.storage);
        }
    }

    /// Drop all retired data.
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// The calling thread's buffer pair, registering it on first use.
    ///
    /// The pair is cached in a thread-local cell, keyed by collector id so
    /// that a thread recording into more than one collector never deposits
    /// into the wrong registry.
    fn thread_buffers(&self) -> Arc<ThreadBuffers> {
        CACHED_BUFFERS.with(|cell| {
            if let Some(cached) = cell.swap(None) {
                if cached.collector_id == self.id {
                    let buffers = cached.buffers.clone();
                    cell.store(Some(cached));
                    return buffers;
                }
            }
            let buffers = self.register_current_thread();
            cell.store(Some(Box::new(CachedBuffers {
                collector_id: self.id,
                buffers: buffers.clone(),
            })));
            buffers
        })
    }

    fn register_current_thread(&self) -> Arc<ThreadBuffers> {
        let tid = current_thread_id();
        self.buffers
            .entry(tid)
            .or_insert_with(|| {
                Arc::new(ThreadBuffers::new(
                    tid,
                    self.config.event_buffer_bytes,
                    self.config.string_buffer_capacity,
                ))
            })
            .clone()
    }
}
