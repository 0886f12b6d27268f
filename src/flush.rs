//! Background flusher: periodic incremental export to a trace file.
//!
//! A worker thread drains all per-thread buffers on an interval (or on an
//! explicit request) and appends the retired blocks to the trace file as a
//! new TraceData block. Dropping the [`FlushGuard`] performs a final drain
//! and flush, then joins the worker.

use std::io;
use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::collector::Collector;
use crate::export::append_blocks;
use crate::intern::Interner;

enum Command {
    Flush,
    Stop,
}

/// Handle to the flusher thread. Keep it alive for as long as tracing should
/// reach the file; dropping it flushes whatever is still buffered.
pub struct FlushGuard {
    handle: Option<JoinHandle<io::Result<()>>>, // An option, so we can `take`
    sender: Sender<Command>,
}

impl FlushGuard {
    /// Ask the worker to flush now, without waiting for the next interval.
    /// Returns immediately; the flush happens on the worker thread.
    pub fn request_flush(&self) {
        let _ignore_err = self.sender.send(Command::Flush);
    }
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        // Sending fails if the worker already stopped; that case is fine.
        let _ignore_err = self.sender.send(Command::Stop);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Ok(())) => (),
                Ok(Err(io_err)) => error!("trace flusher i/o error: {io_err:?}"),
                Err(_join_err) => error!("trace flusher thread panicked"),
            }
        }
    }
}

/// Spawn a flusher for the global collector and interner.
pub fn spawn_flusher(path: impl Into<PathBuf>, interval: Duration) -> FlushGuard {
    spawn_flusher_for(Collector::global(), Interner::global(), path, interval)
}

/// Spawn a flusher for an explicit collector/interner pair.
pub fn spawn_flusher_for(
    collector: &'static Collector,
    interner: &'static Interner,
    path: impl Into<PathBuf>,
    interval: Duration,
) -> FlushGuard {
    let path = path.into();
    let (sender, receiver) = crossbeam_channel::unbounded();
    let handle =
        std::thread::spawn(move || flusher_thread(collector, interner, path, interval, receiver));
    FlushGuard {
        handle: Some(handle),
        sender,
    }
}

fn flusher_thread(
    collector: &Collector,
    interner: &Interner,
    path: PathBuf,
    interval: Duration,
    commands: Receiver<Command>,
) -> io::Result<()> {
    loop {
        let stop = match commands.recv_timeout(interval) {
            Ok(Command::Flush) | Err(RecvTimeoutError::Timeout) => false,
            Ok(Command::Stop) | Err(RecvTimeoutError::Disconnected) => true,
        };

        collector.drain_all();
        // take_all both snapshots and clears, so a block is appended at most
        // once across flush rounds.
        let blocks = collector.storage().take_all();
        if !blocks.is_empty() {
            append_blocks(&path, &interner.export(), &blocks)?;
            debug!(blocks = blocks.len(), "appended trace data to file");
        }

        if stop {
            return Ok(());
        }
    }
}
