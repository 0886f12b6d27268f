//! Wire format commons shared by the serializer and deserializer.
//!
//! All multi-byte integers in the trace file are big-endian. Strings are a
//! `u16` byte length followed by UTF-8 bytes. The overall file layout is:
//!
//! ```text
//! Header        := version_major:u32 version_minor:u32 pid:u64
//! TraceData*    := InternerData event_buffer_count:u32 Container{event_buffer_count}
//! InternerData  := name_count:u32 (name:str id:u32){name_count}
//!                  arg_list_count:u32 (arg_name_count:u32 (name:str){arg_name_count} id:u32){arg_list_count}
//! Container     := kind:u8 next_offset:u32 Body
//! Body(events)  := thread_id:u64 size:u32 raw_event_bytes[size]
//! Body(strings) := thread_id:u64 count:u32 (str){count}
//! EventRecord   := kind:u32 payload
//! ```
//!
//! `next_offset` is the absolute byte distance from the start of a container
//! to the start of the following container. It is written as a placeholder
//! and back-patched once the body size is known, which lets a reader skip any
//! container body in O(1).

use std::string::FromUtf8Error;

use thiserror::Error;

/// Version of the binary trace format, written in the file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatVersion {
    pub major: u32,
    pub minor: u32,
}

impl FormatVersion {
    pub const CURRENT: FormatVersion = FormatVersion { major: 1, minor: 1 };
}

/// File header: format version plus the id of the recording process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: FormatVersion,
    pub pid: u64,
}

/// Container kind tag for an events container (raw event records).
pub const CONTAINER_EVENTS: u8 = 0;
/// Container kind tag for a strings container (argument values).
pub const CONTAINER_STRINGS: u8 = 1;

/// Record tag for every event in an events container.
///
/// The discriminant values are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MeasureKind {
    Duration = 0,
    DurationWithArgs = 1,
    DurationEnd = 2,
    Instant = 3,
    InstantWithArgs = 4,
    Counter = 5,
    Metadata = 6,
}

impl MeasureKind {
    pub fn from_u32(raw: u32) -> Option<MeasureKind> {
        match raw {
            0 => Some(MeasureKind::Duration),
            1 => Some(MeasureKind::DurationWithArgs),
            2 => Some(MeasureKind::DurationEnd),
            3 => Some(MeasureKind::Instant),
            4 => Some(MeasureKind::InstantWithArgs),
            5 => Some(MeasureKind::Counter),
            6 => Some(MeasureKind::Metadata),
            _ => None,
        }
    }

    /// Whether records of this kind carry an argument-list id, an argument
    /// count, and argument values in the parallel string stream.
    pub fn has_args(self) -> bool {
        matches!(
            self,
            MeasureKind::DurationWithArgs
                | MeasureKind::InstantWithArgs
                | MeasureKind::Counter
                | MeasureKind::Metadata
        )
    }
}

pub(crate) const KIND_SIZE: usize = 4;
pub(crate) const NAME_SIZE: usize = 4;
pub(crate) const ARGS_SIZE: usize = 4 + 4;
pub(crate) const TIME_SIZE: usize = 8;

/// Size of a plain named record (Duration, Instant).
pub(crate) const NAMED_RECORD_SIZE: usize = KIND_SIZE + NAME_SIZE + TIME_SIZE;
/// Size of a named record with an argument-list id and count.
pub(crate) const ARGS_RECORD_SIZE: usize = KIND_SIZE + NAME_SIZE + ARGS_SIZE + TIME_SIZE;
/// Size of a DurationEnd record.
pub(crate) const END_RECORD_SIZE: usize = KIND_SIZE + TIME_SIZE;

/// Errors produced while reading a binary trace file.
///
/// Any of these aborts the read of the stream; messages already emitted to
/// the visitor remain valid.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("i/o error reading trace data")]
    Io(#[from] std::io::Error),

    #[error("unknown container kind {0}")]
    UnknownContainerKind(u8),

    #[error("container next offset points to byte {offset}, past the {len}-byte input")]
    OffsetOutOfBounds { offset: u64, len: u64 },

    #[error("unknown measure kind {0}")]
    UnknownMeasureKind(u32),

    #[error("name id {0} missing from interner table")]
    UnknownNameId(u32),

    #[error("argument list id {0} missing from interner table")]
    UnknownArgListId(u32),

    #[error(
        "cannot resolve {requested} argument value(s) for thread {thread_id}: \
         string stream exhausted"
    )]
    ArgumentStringsExhausted { thread_id: u64, requested: u32 },

    #[error("string data is not valid utf-8")]
    InvalidString(#[from] FromUtf8Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_kind_round_trips_through_wire_tag() {
        for kind in [
            MeasureKind::Duration,
            MeasureKind::DurationWithArgs,
            MeasureKind::DurationEnd,
            MeasureKind::Instant,
            MeasureKind::InstantWithArgs,
            MeasureKind::Counter,
            MeasureKind::Metadata,
        ] {
            assert_eq!(MeasureKind::from_u32(kind as u32), Some(kind));
        }
        assert_eq!(MeasureKind::from_u32(7), None);
    }

    #[test]
    fn args_only_on_argument_bearing_kinds() {
        assert!(MeasureKind::DurationWithArgs.has_args());
        assert!(MeasureKind::InstantWithArgs.has_args());
        assert!(MeasureKind::Counter.has_args());
        assert!(MeasureKind::Metadata.has_args());
        assert!(!MeasureKind::Duration.has_args());
        assert!(!MeasureKind::DurationEnd.has_args());
        assert!(!MeasureKind::Instant.has_args());
    }
}
