//! Process-wide storage for retired buffer blocks.
//!
//! Blocks are kept in retirement order across all threads. Total memory is
//! bounded by a byte budget: going over budget evicts the oldest blocks one
//! at a time, each eviction reported as a non-fatal warning. Callers that
//! need durability must flush proactively.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Default storage budget: 2 GiB of retired buffers.
pub const DEFAULT_STORAGE_BUDGET: usize = 2 * 1024 * 1024 * 1024;

/// Estimated bytes per retained string, used for the size estimate of a
/// strings block.
const ESTIMATED_STRING_BYTES: usize = 32;

/// An immutable retired snapshot of one per-thread buffer.
#[derive(Debug)]
pub enum StorageBlock {
    Events { thread_id: u64, data: Vec<u8> },
    Strings { thread_id: u64, values: Vec<String> },
}

impl StorageBlock {
    pub fn thread_id(&self) -> u64 {
        match self {
            StorageBlock::Events { thread_id, .. } => *thread_id,
            StorageBlock::Strings { thread_id, .. } => *thread_id,
        }
    }

    /// Estimated memory footprint. Event blocks count their full byte
    /// capacity; string blocks count a fixed per-string estimate, since the
    /// actual string lengths are not worth summing on the retire path.
    pub fn estimated_size(&self) -> usize {
        match self {
            StorageBlock::Events { data, .. } => data.capacity(),
            StorageBlock::Strings { values, .. } => values.capacity() * ESTIMATED_STRING_BYTES,
        }
    }
}

struct StorageInner {
    blocks: VecDeque<Arc<StorageBlock>>,
    estimated_size: usize,
}

pub struct CollectorStorage {
    inner: Mutex<StorageInner>,
    budget: usize,
}

impl CollectorStorage {
    pub fn new(budget: usize) -> Self {
        CollectorStorage {
            inner: Mutex::new(StorageInner {
                blocks: VecDeque::new(),
                estimated_size: 0,
            }),
            budget,
        }
    }

    /// Append a retired block. If the size estimate exceeds the budget, the
    /// oldest blocks are dropped until it no longer does. Eviction is data
    /// loss, not a failure; each dropped block is reported via `warn!`.
    pub fn retire(&self, block: StorageBlock) {
        let mut inner = self.inner.lock().unwrap();
        inner.estimated_size += block.estimated_size();
        inner.blocks.push_back(Arc::new(block));

        while inner.estimated_size > self.budget {
            let Some(oldest) = inner.blocks.pop_front() else {
                break;
            };
            inner.estimated_size = inner.estimated_size.saturating_sub(oldest.estimated_size());
            warn!(
                thread_id = oldest.thread_id(),
                dropped_bytes = oldest.estimated_size(),
                "trace storage over budget, dropping oldest block; \
                 consider draining trace data more often"
            );
        }
    }

    /// Copy of the current block list, oldest first. Storage is unchanged.
    pub fn export_snapshot(&self) -> Vec<Arc<StorageBlock>> {
        let inner = self.inner.lock().unwrap();
        inner.blocks.iter().cloned().collect()
    }

    /// Snapshot and clear in one step. Used by the incremental flusher so
    /// that repeated appends never write the same block twice.
    pub fn take_all(&self) -> Vec<Arc<StorageBlock>> {
        let mut inner = self.inner.lock().unwrap();
        inner.estimated_size = 0;
        inner.blocks.drain(..).collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.blocks.clear();
        inner.estimated_size = 0;
    }

    pub fn estimated_size(&self) -> usize {
        self.inner.lock().unwrap().estimated_size
    }
}
