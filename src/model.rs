//! Chrome-Tracing event model and the trace model converter.
//!
//! The converter consumes the deserializer's message stream and produces
//! canonical trace events: timestamps are normalized so the first one seen
//! becomes zero, expressed in microseconds, and Duration begin/end pairs are
//! merged into single Complete (`X`) events.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::deserialize::MessageVisitor;
use crate::format::MeasureKind;

/// Chrome-Tracing event phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    #[serde(rename = "B")]
    DurationStart,
    #[serde(rename = "E")]
    DurationEnd,
    #[serde(rename = "X")]
    Complete,
    #[serde(rename = "i")]
    Instant,
    #[serde(rename = "C")]
    Counter,
    #[serde(rename = "M")]
    Metadata,
}

impl From<MeasureKind> for Phase {
    fn from(kind: MeasureKind) -> Phase {
        match kind {
            MeasureKind::Duration | MeasureKind::DurationWithArgs => Phase::DurationStart,
            MeasureKind::DurationEnd => Phase::DurationEnd,
            MeasureKind::Instant | MeasureKind::InstantWithArgs => Phase::Instant,
            MeasureKind::Counter => Phase::Counter,
            MeasureKind::Metadata => Phase::Metadata,
        }
    }
}

/// One event in the Chrome-Tracing JSON model. `ts` and `dur` are
/// microseconds relative to the first event of the trace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub ph: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cat: Option<String>,
    pub ts: f64,
    pub pid: u64,
    pub tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    /// Argument name → value, in argument-name-list order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

/// Root object of a Chrome-Tracing JSON file.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRoot {
    pub trace_events: Vec<TraceEvent>,
    pub display_time_unit: &'static str,
}

impl TraceRoot {
    pub fn new(trace_events: Vec<TraceEvent>) -> Self {
        TraceRoot {
            trace_events,
            display_time_unit: "ns",
        }
    }
}

/// Pairs begin/end messages into Complete events and forwards everything to
/// a sink, in one forward pass.
///
/// There is a single pending-span slot per converter, not one per thread:
/// a DurationEnd merges with the pending span only when both are on the same
/// thread, but interleaved begins from different threads replace each other
/// and are then flushed as plain `B` events.
pub struct TraceModelConverter<F: FnMut(TraceEvent)> {
    pid: u64,
    start_time: Option<u64>,
    pending: Option<TraceEvent>,
    sink: F,
}

impl<F: FnMut(TraceEvent)> TraceModelConverter<F> {
    pub fn new(pid: u64, sink: F) -> Self {
        TraceModelConverter {
            pid,
            start_time: None,
            pending: None,
            sink,
        }
    }

    /// Flush a still-pending begin event. Call after the last message.
    pub fn finish(mut self) {
        if let Some(pending) = self.pending.take() {
            (self.sink)(pending);
        }
    }

    fn time_micros(&mut self, time_ns: u64) -> f64 {
        let start = *self.start_time.get_or_insert(time_ns);
        (time_ns as f64 - start as f64) * 1e-3
    }

    fn emit(&mut self, event: TraceEvent) {
        if event.ph == Phase::DurationStart {
            if let Some(pending) = self.pending.take() {
                (self.sink)(pending);
            }
            self.pending = Some(event);
        } else {
            (self.sink)(event);
        }
    }
}

impl<F: FnMut(TraceEvent)> MessageVisitor for TraceModelConverter<F> {
    fn on_event(&mut self, kind: MeasureKind, thread_id: u64, time: u64) {
        let ts = self.time_micros(time);
        let matches_pending = kind == MeasureKind::DurationEnd
            && self.pending.as_ref().is_some_and(|p| p.tid == thread_id);
        if matches_pending {
            let mut span = self.pending.take().unwrap();
            span.ph = Phase::Complete;
            span.dur = Some(ts - span.ts);
            (self.sink)(span);
        } else {
            self.emit(TraceEvent {
                ph: kind.into(),
                name: None,
                cat: None,
                ts,
                pid: self.pid,
                tid: thread_id,
                dur: None,
                args: None,
            });
        }
    }

    fn on_named_event(&mut self, kind: MeasureKind, thread_id: u64, name: &str, time: u64) {
        let ts = self.time_micros(time);
        self.emit(TraceEvent {
            ph: kind.into(),
            name: Some(name.to_string()),
            cat: None,
            ts,
            pid: self.pid,
            tid: thread_id,
            dur: None,
            args: None,
        });
    }

    fn on_event_with_args(
        &mut self,
        kind: MeasureKind,
        thread_id: u64,
        name: &str,
        arg_names: &[String],
        arg_values: Vec<String>,
        time: u64,
    ) {
        let ts = self.time_micros(time);
        let args: Map<String, Value> = arg_names
            .iter()
            .cloned()
            .zip(arg_values.into_iter().map(Value::String))
            .collect();
        self.emit(TraceEvent {
            ph: kind.into(),
            name: Some(name.to_string()),
            cat: None,
            ts,
            pid: self.pid,
            tid: thread_id,
            dur: None,
            args: Some(args),
        });
    }
}
