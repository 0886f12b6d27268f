//! Binary trace deserializer.
//!
//! Reads the container format back into a stream of typed messages, emitted
//! through a [`MessageVisitor`]. Only a lightweight positional index of
//! container headers is held in memory; bodies are visited by seeking, so
//! the whole file is never loaded at once.
//!
//! Argument values are resolved through a per-thread cursor over that
//! thread's strings containers, in file order. A record's argument pull must
//! be satisfiable within the cursor's current container; that holds for any
//! file produced by the writer, which retires a string buffer only between
//! records.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use crate::format::{
    FormatError, FormatVersion, Header, MeasureKind, CONTAINER_EVENTS, CONTAINER_STRINGS,
};

/// Receives decoded messages. One method per record shape.
pub trait MessageVisitor {
    /// A record with no name: DurationEnd.
    fn on_event(&mut self, kind: MeasureKind, thread_id: u64, time: u64);

    /// A named record without arguments: Duration, Instant.
    fn on_named_event(&mut self, kind: MeasureKind, thread_id: u64, name: &str, time: u64);

    /// A named record with resolved argument names and values.
    fn on_event_with_args(
        &mut self,
        kind: MeasureKind,
        thread_id: u64,
        name: &str,
        arg_names: &[String],
        arg_values: Vec<String>,
        time: u64,
    );
}

#[derive(Debug, Clone, Copy)]
struct ContainerEntry {
    kind: u8,
    thread_id: u64,
    /// Byte length for events containers, string count for strings
    /// containers.
    size: u32,
    /// Absolute offset of the container body (first record byte or first
    /// string).
    body_offset: u64,
}

/// Read cursor into one thread's strings-container sequence.
struct StringsCursor {
    /// Position in the strings index of the container being consumed.
    index_pos: usize,
    /// Absolute offset of the next unread string.
    offset: u64,
    consumed: u32,
}

pub struct Deserializer<R: Read + Seek> {
    input: R,
    len: u64,
}

impl<R: Read + Seek> Deserializer<R> {
    pub fn new(mut input: R) -> io::Result<Self> {
        let len = input.seek(SeekFrom::End(0))?;
        input.seek(SeekFrom::Start(0))?;
        Ok(Deserializer { input, len })
    }

    pub fn read_header(&mut self) -> Result<Header, FormatError> {
        let version = FormatVersion {
            major: self.read_u32()?,
            minor: self.read_u32()?,
        };
        let pid = self.read_u64()?;
        Ok(Header { version, pid })
    }

    /// Read TraceData blocks until the input is exhausted, emitting every
    /// decoded message to `visitor`. End of stream between blocks is a
    /// normal end, not an error.
    pub fn read_messages<V: MessageVisitor>(&mut self, visitor: &mut V) -> Result<(), FormatError> {
        while self.remaining()? > 0 {
            self.read_trace_data(visitor)?;
        }
        Ok(())
    }

    fn read_trace_data<V: MessageVisitor>(&mut self, visitor: &mut V) -> Result<(), FormatError> {
        let (names, arg_lists) = self.read_interner_data()?;
        let container_count = self.read_u32()?;

        // Index every container by position, reading headers only and using
        // the next-offset to hop over bodies.
        let mut index: Vec<ContainerEntry> = Vec::with_capacity(container_count as usize);
        let mut block_end = self.position()?;
        for _ in 0..container_count {
            let start = self.position()?;
            let kind = self.read_u8()?;
            if kind != CONTAINER_EVENTS && kind != CONTAINER_STRINGS {
                return Err(FormatError::UnknownContainerKind(kind));
            }
            let next_offset = self.read_u32()?;
            let next = start + next_offset as u64;
            if next > self.len {
                return Err(FormatError::OffsetOutOfBounds {
                    offset: next,
                    len: self.len,
                });
            }
            let thread_id = self.read_u64()?;
            let size = self.read_u32()?;
            index.push(ContainerEntry {
                kind,
                thread_id,
                size,
                body_offset: self.position()?,
            });
            self.seek_abs(next)?;
            block_end = self.position()?;
        }

        let strings_index: Vec<ContainerEntry> = index
            .iter()
            .copied()
            .filter(|e| e.kind == CONTAINER_STRINGS)
            .collect();
        let mut cursors: HashMap<u64, StringsCursor> = HashMap::new();

        for entry in index.iter().filter(|e| e.kind == CONTAINER_EVENTS) {
            self.seek_abs(entry.body_offset)?;
            self.read_event_records(
                entry,
                &names,
                &arg_lists,
                &strings_index,
                &mut cursors,
                visitor,
            )?;
        }

        self.seek_abs(block_end)?;
        Ok(())
    }

    fn read_event_records<V: MessageVisitor>(
        &mut self,
        entry: &ContainerEntry,
        names: &HashMap<u32, String>,
        arg_lists: &HashMap<u32, Vec<String>>,
        strings_index: &[ContainerEntry],
        cursors: &mut HashMap<u64, StringsCursor>,
        visitor: &mut V,
    ) -> Result<(), FormatError> {
        let end = entry.body_offset + entry.size as u64;
        while self.position()? < end {
            let raw_kind = self.read_u32()?;
            let kind =
                MeasureKind::from_u32(raw_kind).ok_or(FormatError::UnknownMeasureKind(raw_kind))?;
            match kind {
                MeasureKind::DurationEnd => {
                    let time = self.read_u64()?;
                    visitor.on_event(kind, entry.thread_id, time);
                }
                MeasureKind::Duration | MeasureKind::Instant => {
                    let name_id = self.read_u32()?;
                    let time = self.read_u64()?;
                    let name = names
                        .get(&name_id)
                        .ok_or(FormatError::UnknownNameId(name_id))?;
                    visitor.on_named_event(kind, entry.thread_id, name, time);
                }
                MeasureKind::DurationWithArgs
                | MeasureKind::InstantWithArgs
                | MeasureKind::Counter
                | MeasureKind::Metadata => {
                    let name_id = self.read_u32()?;
                    let args_id = self.read_u32()?;
                    let arg_count = self.read_u32()?;
                    let time = self.read_u64()?;
                    let name = names
                        .get(&name_id)
                        .ok_or(FormatError::UnknownNameId(name_id))?;
                    let arg_names = arg_lists
                        .get(&args_id)
                        .ok_or(FormatError::UnknownArgListId(args_id))?;
                    let arg_values =
                        self.pull_strings(entry.thread_id, arg_count, strings_index, cursors)?;
                    visitor.on_event_with_args(
                        kind,
                        entry.thread_id,
                        name,
                        arg_names,
                        arg_values,
                        time,
                    );
                }
            }
        }
        Ok(())
    }

    /// Read `count` argument values for `thread_id`, advancing that thread's
    /// cursor. Consults only strings containers belonging to the same
    /// thread.
    fn pull_strings(
        &mut self,
        thread_id: u64,
        count: u32,
        strings_index: &[ContainerEntry],
        cursors: &mut HashMap<u64, StringsCursor>,
    ) -> Result<Vec<String>, FormatError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let exhausted = |cursor: &StringsCursor| {
            cursor.consumed >= strings_index[cursor.index_pos].size
        };
        let needs_advance = match cursors.get(&thread_id) {
            Some(cursor) => exhausted(cursor),
            None => true,
        };
        if needs_advance {
            let search_from = cursors
                .get(&thread_id)
                .map(|c| c.index_pos + 1)
                .unwrap_or(0);
            let next = strings_index[search_from.min(strings_index.len())..]
                .iter()
                .position(|e| e.thread_id == thread_id)
                .map(|i| search_from + i)
                .ok_or(FormatError::ArgumentStringsExhausted {
                    thread_id,
                    requested: count,
                })?;
            cursors.insert(
                thread_id,
                StringsCursor {
                    index_pos: next,
                    offset: strings_index[next].body_offset,
                    consumed: 0,
                },
            );
        }

        let cursor = cursors.get_mut(&thread_id).unwrap();
        let remaining = strings_index[cursor.index_pos].size - cursor.consumed;
        if count > remaining {
            // A pull never spans two containers; the writer retires string
            // buffers only between records.
            return Err(FormatError::ArgumentStringsExhausted {
                thread_id,
                requested: count,
            });
        }

        let return_to = self.position()?;
        self.input.seek(SeekFrom::Start(cursor.offset))?;
        let mut values = Vec::with_capacity(count as usize);
        for _ in 0..count {
            values.push(self.read_str()?);
        }
        cursor.offset = self.position()?;
        cursor.consumed += count;
        self.input.seek(SeekFrom::Start(return_to))?;
        Ok(values)
    }

    fn read_interner_data(
        &mut self,
    ) -> Result<(HashMap<u32, String>, HashMap<u32, Vec<String>>), FormatError> {
        let name_count = self.read_u32()?;
        let mut names = HashMap::with_capacity(name_count as usize);
        for _ in 0..name_count {
            let name = self.read_str()?;
            let id = self.read_u32()?;
            names.insert(id, name);
        }
        let list_count = self.read_u32()?;
        let mut arg_lists = HashMap::with_capacity(list_count as usize);
        for _ in 0..list_count {
            let arg_count = self.read_u32()?;
            let mut args = Vec::with_capacity(arg_count as usize);
            for _ in 0..arg_count {
                args.push(self.read_str()?);
            }
            let id = self.read_u32()?;
            arg_lists.insert(id, args);
        }
        Ok((names, arg_lists))
    }

    fn remaining(&mut self) -> io::Result<u64> {
        Ok(self.len.saturating_sub(self.position()?))
    }

    fn position(&mut self) -> io::Result<u64> {
        self.input.stream_position()
    }

    fn seek_abs(&mut self, to: u64) -> io::Result<()> {
        self.input.seek(SeekFrom::Start(to))?;
        Ok(())
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.input.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.input.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.input.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn read_str(&mut self) -> Result<String, FormatError> {
        let mut len_buf = [0u8; 2];
        self.input.read_exact(&mut len_buf)?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut bytes = vec![0u8; len];
        self.input.read_exact(&mut bytes)?;
        Ok(String::from_utf8(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intern::InternerSnapshot;
    use crate::serialize::Serializer;
    use crate::storage::StorageBlock;
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum Msg {
        Plain(MeasureKind, u64, u64),
        Named(MeasureKind, u64, String, u64),
        WithArgs(MeasureKind, u64, String, Vec<String>, Vec<String>, u64),
    }

    #[derive(Default)]
    struct Collecting(Vec<Msg>);

    impl MessageVisitor for Collecting {
        fn on_event(&mut self, kind: MeasureKind, thread_id: u64, time: u64) {
            self.0.push(Msg::Plain(kind, thread_id, time));
        }
        fn on_named_event(&mut self, kind: MeasureKind, thread_id: u64, name: &str, time: u64) {
            self.0.push(Msg::Named(kind, thread_id, name.to_string(), time));
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
            self.0.push(Msg::WithArgs(
                kind,
                thread_id,
                name.to_string(),
                arg_names.to_vec(),
                arg_values,
                time,
            ));
        }
    }

    fn named_record(buf: &mut Vec<u8>, kind: MeasureKind, name_id: u32, time: u64) {
        buf.extend_from_slice(&(kind as u32).to_be_bytes());
        buf.extend_from_slice(&name_id.to_be_bytes());
        buf.extend_from_slice(&time.to_be_bytes());
    }

    fn args_record(
        buf: &mut Vec<u8>,
        kind: MeasureKind,
        name_id: u32,
        args_id: u32,
        arg_count: u32,
        time: u64,
    ) {
        buf.extend_from_slice(&(kind as u32).to_be_bytes());
        buf.extend_from_slice(&name_id.to_be_bytes());
        buf.extend_from_slice(&args_id.to_be_bytes());
        buf.extend_from_slice(&arg_count.to_be_bytes());
        buf.extend_from_slice(&time.to_be_bytes());
    }

    fn end_record(buf: &mut Vec<u8>, time: u64) {
        buf.extend_from_slice(&(MeasureKind::DurationEnd as u32).to_be_bytes());
        buf.extend_from_slice(&time.to_be_bytes());
    }

    fn interner(names: &[(&str, u32)], args: &[(&[&str], u32)]) -> InternerSnapshot {
        InternerSnapshot {
            names: names.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
            arg_lists: args
                .iter()
                .map(|(list, n)| (list.iter().map(|s| s.to_string()).collect(), *n))
                .collect(),
        }
    }

    fn serialize(interner: &InternerSnapshot, blocks: Vec<StorageBlock>) -> Vec<u8> {
        let blocks: Vec<Arc<StorageBlock>> = blocks.into_iter().map(Arc::new).collect();
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(42).unwrap();
        serializer.write_trace_data(interner, &blocks).unwrap();
        serializer.into_inner().into_inner()
    }

    fn read_all(bytes: Vec<u8>) -> Result<(Header, Vec<Msg>), FormatError> {
        let mut deserializer = Deserializer::new(Cursor::new(bytes)).unwrap();
        let header = deserializer.read_header()?;
        let mut visitor = Collecting::default();
        deserializer.read_messages(&mut visitor)?;
        Ok((header, visitor.0))
    }

    #[test]
    fn header_only_file_has_no_messages() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(42).unwrap();
        let (header, msgs) = read_all(serializer.into_inner().into_inner()).unwrap();
        assert_eq!(header.pid, 42);
        assert_eq!(header.version, FormatVersion::CURRENT);
        assert!(msgs.is_empty());
    }

    #[test]
    fn named_events_resolve_through_interner() {
        let mut events = Vec::new();
        named_record(&mut events, MeasureKind::Duration, 0, 100);
        end_record(&mut events, 200);
        named_record(&mut events, MeasureKind::Instant, 1, 300);

        let bytes = serialize(
            &interner(&[("work", 0), ("tick", 1)], &[]),
            vec![StorageBlock::Events {
                thread_id: 5,
                data: events,
            }],
        );
        let (_, msgs) = read_all(bytes).unwrap();
        assert_eq!(
            msgs,
            vec![
                Msg::Named(MeasureKind::Duration, 5, "work".into(), 100),
                Msg::Plain(MeasureKind::DurationEnd, 5, 200),
                Msg::Named(MeasureKind::Instant, 5, "tick".into(), 300),
            ]
        );
    }

    #[test]
    fn argument_values_come_from_the_owning_thread() {
        let mut events_a = Vec::new();
        args_record(&mut events_a, MeasureKind::Counter, 0, 0, 1, 10);
        let mut events_b = Vec::new();
        args_record(&mut events_b, MeasureKind::Counter, 0, 0, 1, 20);

        // Thread 2's strings container comes first in the file; thread 1
        // must still read its own.
        let bytes = serialize(
            &interner(&[("mem", 0)], &[(&["bytes"], 0)]),
            vec![
                StorageBlock::Strings {
                    thread_id: 2,
                    values: vec!["222".into()],
                },
                StorageBlock::Events {
                    thread_id: 1,
                    data: events_a,
                },
                StorageBlock::Strings {
                    thread_id: 1,
                    values: vec!["111".into()],
                },
                StorageBlock::Events {
                    thread_id: 2,
                    data: events_b,
                },
            ],
        );
        let (_, msgs) = read_all(bytes).unwrap();
        assert_eq!(
            msgs,
            vec![
                Msg::WithArgs(
                    MeasureKind::Counter,
                    1,
                    "mem".into(),
                    vec!["bytes".into()],
                    vec!["111".into()],
                    10
                ),
                Msg::WithArgs(
                    MeasureKind::Counter,
                    2,
                    "mem".into(),
                    vec!["bytes".into()],
                    vec!["222".into()],
                    20
                ),
            ]
        );
    }

    #[test]
    fn cursor_advances_across_string_containers() {
        let mut events = Vec::new();
        args_record(&mut events, MeasureKind::InstantWithArgs, 0, 0, 2, 10);
        args_record(&mut events, MeasureKind::InstantWithArgs, 0, 0, 2, 20);

        let bytes = serialize(
            &interner(&[("ev", 0)], &[(&["x", "y"], 0)]),
            vec![
                StorageBlock::Strings {
                    thread_id: 1,
                    values: vec!["a".into(), "b".into()],
                },
                StorageBlock::Strings {
                    thread_id: 1,
                    values: vec!["c".into(), "d".into()],
                },
                StorageBlock::Events {
                    thread_id: 1,
                    data: events,
                },
            ],
        );
        let (_, msgs) = read_all(bytes).unwrap();
        match &msgs[..] {
            [Msg::WithArgs(_, _, _, _, first, _), Msg::WithArgs(_, _, _, _, second, _)] => {
                assert_eq!(first, &["a".to_string(), "b".to_string()]);
                assert_eq!(second, &["c".to_string(), "d".to_string()]);
            }
            other => panic!("unexpected messages: {other:?}"),
        }
    }

    #[test]
    fn missing_argument_strings_is_an_error() {
        let mut events = Vec::new();
        args_record(&mut events, MeasureKind::Counter, 0, 0, 1, 10);
        let bytes = serialize(
            &interner(&[("mem", 0)], &[(&["bytes"], 0)]),
            vec![StorageBlock::Events {
                thread_id: 1,
                data: events,
            }],
        );
        match read_all(bytes) {
            Err(FormatError::ArgumentStringsExhausted {
                thread_id: 1,
                requested: 1,
            }) => (),
            other => panic!("expected exhausted-strings error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_container_kind_is_an_error() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(1).unwrap();
        serializer
            .write_trace_data(&InternerSnapshot::default(), &[])
            .unwrap();
        let mut bytes = serializer.into_inner().into_inner();
        // Patch the container count to one and append a bogus container.
        let count_at = bytes.len() - 4;
        bytes[count_at..].copy_from_slice(&1u32.to_be_bytes());
        bytes.push(9); // unknown kind
        bytes.extend_from_slice(&17u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        match read_all(bytes) {
            Err(FormatError::UnknownContainerKind(9)) => (),
            other => panic!("expected unknown-container error, got {other:?}"),
        }
    }

    #[test]
    fn next_offset_past_end_of_input_is_an_error() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(1).unwrap();
        serializer
            .write_trace_data(&InternerSnapshot::default(), &[])
            .unwrap();
        let mut bytes = serializer.into_inner().into_inner();
        // Patch the container count to one and append a container whose
        // next-offset points far past the end of the file.
        let count_at = bytes.len() - 4;
        bytes[count_at..].copy_from_slice(&1u32.to_be_bytes());
        bytes.push(CONTAINER_EVENTS);
        bytes.extend_from_slice(&1_000_000u32.to_be_bytes());
        bytes.extend_from_slice(&0u64.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());

        match read_all(bytes) {
            Err(FormatError::OffsetOutOfBounds { .. }) => (),
            other => panic!("expected out-of-bounds-offset error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_measure_kind_is_an_error() {
        let mut events = Vec::new();
        events.extend_from_slice(&99u32.to_be_bytes());
        events.extend_from_slice(&0u64.to_be_bytes());
        let bytes = serialize(
            &InternerSnapshot::default(),
            vec![StorageBlock::Events {
                thread_id: 1,
                data: events,
            }],
        );
        match read_all(bytes) {
            Err(FormatError::UnknownMeasureKind(99)) => (),
            other => panic!("expected unknown-measure-kind error, got {other:?}"),
        }
    }

    #[test]
    fn appended_trace_data_blocks_read_as_one_stream() {
        let snapshot = interner(&[("a", 0), ("b", 1)], &[]);
        let mut first = Vec::new();
        named_record(&mut first, MeasureKind::Instant, 0, 1);
        let mut second = Vec::new();
        named_record(&mut second, MeasureKind::Instant, 1, 2);

        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(7).unwrap();
        serializer
            .write_trace_data(
                &snapshot,
                &[Arc::new(StorageBlock::Events {
                    thread_id: 1,
                    data: first,
                })],
            )
            .unwrap();
        serializer
            .write_trace_data(
                &snapshot,
                &[Arc::new(StorageBlock::Events {
                    thread_id: 1,
                    data: second,
                })],
            )
            .unwrap();

        let (_, msgs) = read_all(serializer.into_inner().into_inner()).unwrap();
        assert_eq!(
            msgs,
            vec![
                Msg::Named(MeasureKind::Instant, 1, "a".into(), 1),
                Msg::Named(MeasureKind::Instant, 1, "b".into(), 2),
            ]
        );
    }
}
