//! A low-overhead in-process event tracer.
//!
//! Application code marks durations, instants, counters, and metadata. The
//! collector buffers events per thread with minimal synchronization: names
//! and argument lists are interned to small integers, records are appended
//! to a thread-owned byte buffer, and full buffers are retired into a
//! memory-bounded process-wide store. Retired data is written to a compact
//! binary file, either explicitly or periodically through the background
//! [`FlushGuard`] flusher, and converted into the Chrome Tracing JSON format
//! for visualization (open it in `chrome://tracing` or
//! [Perfetto](https://ui.perfetto.dev)).
//!
//! ```no_run
//! fn work(n: usize) -> usize {
//!     microtrace::trace(microtrace::current_position!(), || n * 2)
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     work(21);
//!     microtrace::instant("done");
//!
//!     microtrace::drain_all();
//!     microtrace::export_trace("out.trace.bin")?;
//!     microtrace::write_json("out.trace.bin", "out.trace.json").unwrap();
//!     Ok(())
//! }
//! ```
//!
//! Every marked region is recorded, not sampled, and nothing is correlated
//! across processes. Data does not survive a crash: durability requires a
//! flush.

use std::fmt::Display;
use std::io;
use std::path::Path;

pub mod buffer;
pub mod collector;
pub mod deserialize;
pub mod export;
pub mod flush;
pub mod format;
pub mod intern;
pub mod model;
pub mod serialize;
pub mod storage;

pub use collector::{Collector, CollectorConfig};
pub use export::{append_trace_data, convert_file, export_trace_data, write_json};
pub use flush::{spawn_flusher, spawn_flusher_for, FlushGuard};
pub use format::{FormatError, MeasureKind};
pub use intern::Interner;
pub use model::{Phase, TraceEvent, TraceRoot};

/// Intern a string in the process-wide interner.
pub fn intern(name: &str) -> u32 {
    Interner::global().intern(name)
}

/// Intern an argument-name list in the process-wide interner.
pub fn intern_args(arg_names: &[&str]) -> u32 {
    Interner::global().intern_args(arg_names)
}

/// `module::path(file:line)` for the call site, usable as an event name.
#[macro_export]
macro_rules! current_position {
    () => {
        concat!(module_path!(), "(", file!(), ":", line!(), ")")
    };
}

/// Closes the duration opened by [`duration`] when dropped.
#[must_use = "the duration ends when the guard is dropped"]
pub struct DurationGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for DurationGuard {
    fn drop(&mut self) {
        Collector::global().record_duration_end();
    }
}

fn duration_guard() -> DurationGuard {
    DurationGuard {
        _not_send: std::marker::PhantomData,
    }
}

/// Open a duration on the current thread; it closes when the returned guard
/// drops.
pub fn duration(name: &str) -> DurationGuard {
    Collector::global().record_duration_start(intern(name));
    duration_guard()
}

/// [`duration`] with named argument values.
pub fn duration_with_args(name: &str, args: &[(&str, &dyn Display)]) -> DurationGuard {
    let (args_id, values) = intern_arg_pairs(args);
    Collector::global().record_duration_start_with_args(intern(name), args_id, values);
    duration_guard()
}

/// Run `f` inside a duration named `name`.
pub fn trace<T>(name: &str, f: impl FnOnce() -> T) -> T {
    let _guard = duration(name);
    f()
}

/// Record a point-in-time event.
pub fn instant(name: &str) {
    Collector::global().record_instant(intern(name));
}

/// Record a point-in-time event with named argument values.
pub fn instant_with_args(name: &str, args: &[(&str, &dyn Display)]) {
    let (args_id, values) = intern_arg_pairs(args);
    Collector::global().record_instant_with_args(intern(name), args_id, values);
}

/// Record a counter sample; each argument becomes one counter series.
pub fn counter(name: &str, args: &[(&str, &dyn Display)]) {
    let (args_id, values) = intern_arg_pairs(args);
    Collector::global().record_counter(intern(name), args_id, values);
}

/// Record trace metadata, e.g. a process or thread name.
pub fn metadata(name: &str, args: &[(&str, &dyn Display)]) {
    let (args_id, values) = intern_arg_pairs(args);
    Collector::global().record_metadata(intern(name), args_id, values);
}

/// Retire the calling thread's buffers into storage.
pub fn drain() {
    Collector::global().drain();
}

/// Retire every thread's buffers into storage. Call before exporting so no
/// writer still holds unflushed data.
pub fn drain_all() {
    Collector::global().drain_all();
}

/// Drop all retired, unexported data.
pub fn clear() {
    Collector::global().clear();
}

/// Write everything retired so far to a fresh binary trace file.
pub fn export_trace(path: impl AsRef<Path>) -> io::Result<()> {
    export::export_trace_data(Collector::global(), Interner::global(), path)
}

/// Append everything retired so far to a binary trace file.
pub fn append_trace(path: impl AsRef<Path>) -> io::Result<()> {
    export::append_trace_data(Collector::global(), Interner::global(), path)
}

fn intern_arg_pairs(args: &[(&str, &dyn Display)]) -> (u32, Vec<String>) {
    let names: Vec<&str> = args.iter().map(|(name, _)| *name).collect();
    let values: Vec<String> = args.iter().map(|(_, value)| value.to_string()).collect();
    (intern_args(&names), values)
}

#[cfg(test)]
mod tests {
    use crate::model::Phase;

    fn fibonacci(number: usize) -> usize {
        crate::trace(crate::current_position!(), || {
            if number < 2 {
                number
            } else {
                fibonacci(number - 1) + fibonacci(number - 2)
            }
        })
    }

    // The one test that exercises the global collector end to end; everything
    // else in the crate tests against its own instances.
    #[test]
    fn global_api_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("global.trace");

        fibonacci(8);
        crate::instant("finished");
        crate::counter("fib", &[("depth", &8)]);

        crate::drain_all();
        crate::export_trace(&path).unwrap();

        let events = crate::convert_file(&path).unwrap();
        // `current_position!` names the span after its call site.
        assert!(events.iter().any(|e| e.ph == Phase::Complete
            && e.name.as_deref().is_some_and(|n| n.contains("lib.rs"))));
        assert!(events
            .iter()
            .any(|e| e.ph == Phase::Instant && e.name.as_deref() == Some("finished")));
        let counter = events
            .iter()
            .find(|e| e.ph == Phase::Counter)
            .expect("counter event present");
        assert_eq!(
            counter.args.as_ref().unwrap()["depth"],
            serde_json::Value::String("8".to_string())
        );
    }
}
