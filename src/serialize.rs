//! Binary trace serializer.
//!
//! Streams the interner tables and retired buffer blocks into the container
//! format described in [`crate::format`]. The sink only needs `Write + Seek`:
//! container next-offsets are written as placeholders and back-patched once
//! the body size is known.

use std::io::{self, Seek, SeekFrom, Write};
use std::sync::Arc;

use crate::format::{FormatVersion, CONTAINER_EVENTS, CONTAINER_STRINGS};
use crate::intern::InternerSnapshot;
use crate::storage::StorageBlock;

pub struct Serializer<W: Write + Seek> {
    out: W,
}

impl<W: Write + Seek> Serializer<W> {
    pub fn new(out: W) -> Self {
        Serializer { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn write_header(&mut self, pid: u64) -> io::Result<()> {
        self.write_version(FormatVersion::CURRENT)?;
        self.write_u64(pid)
    }

    /// Write one TraceData block: interner snapshot, container count, then
    /// one framed container per storage block, in retirement order.
    pub fn write_trace_data(
        &mut self,
        interner: &InternerSnapshot,
        blocks: &[Arc<StorageBlock>],
    ) -> io::Result<()> {
        self.write_interner_data(interner)?;
        self.write_u32(blocks.len() as u32)?;
        for block in blocks {
            match &**block {
                StorageBlock::Events { thread_id, data } => {
                    self.write_events_container(*thread_id, data)?;
                }
                StorageBlock::Strings { thread_id, values } => {
                    self.write_strings_container(*thread_id, values)?;
                }
            }
        }
        Ok(())
    }

    fn write_events_container(&mut self, thread_id: u64, data: &[u8]) -> io::Result<()> {
        self.container(CONTAINER_EVENTS, |s| {
            s.write_u64(thread_id)?;
            s.write_u32(data.len() as u32)?;
            s.out.write_all(data)
        })
    }

    fn write_strings_container(&mut self, thread_id: u64, values: &[String]) -> io::Result<()> {
        self.container(CONTAINER_STRINGS, |s| {
            s.write_u64(thread_id)?;
            s.write_u32(values.len() as u32)?;
            for value in values {
                s.write_str(value)?;
            }
            Ok(())
        })
    }

    /// Frame a container: kind byte, a 4-byte next-offset back-patched to
    /// the distance from the container's start to the byte after its body.
    fn container(
        &mut self,
        kind: u8,
        body: impl FnOnce(&mut Self) -> io::Result<()>,
    ) -> io::Result<()> {
        let start = self.out.stream_position()?;
        self.out.write_all(&[kind])?;
        self.write_u32(0)?;
        body(self)?;
        let end = self.out.stream_position()?;
        self.out.seek(SeekFrom::Start(start + 1))?;
        self.write_u32((end - start) as u32)?;
        self.out.seek(SeekFrom::Start(end))?;
        Ok(())
    }

    fn write_interner_data(&mut self, interner: &InternerSnapshot) -> io::Result<()> {
        self.write_u32(interner.names.len() as u32)?;
        for (name, id) in &interner.names {
            self.write_str(name)?;
            self.write_u32(*id)?;
        }
        self.write_u32(interner.arg_lists.len() as u32)?;
        for (arg_names, id) in &interner.arg_lists {
            self.write_u32(arg_names.len() as u32)?;
            for name in arg_names {
                self.write_str(name)?;
            }
            self.write_u32(*id)?;
        }
        Ok(())
    }

    fn write_version(&mut self, version: FormatVersion) -> io::Result<()> {
        self.write_u32(version.major)?;
        self.write_u32(version.minor)
    }

    fn write_u32(&mut self, value: u32) -> io::Result<()> {
        self.out.write_all(&value.to_be_bytes())
    }

    fn write_u64(&mut self, value: u64) -> io::Result<()> {
        self.out.write_all(&value.to_be_bytes())
    }

    fn write_str(&mut self, value: &str) -> io::Result<()> {
        if value.len() > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "string longer than 65535 bytes",
            ));
        }
        self.out.write_all(&(value.len() as u16).to_be_bytes())?;
        self.out.write_all(value.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// version (4 + 4) + pid (8)
    const HEADER_SIZE: u64 = 16;

    #[test]
    fn header_layout_is_fixed() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer.write_header(0x1234).unwrap();
        let bytes = serializer.into_inner().into_inner();
        assert_eq!(bytes.len() as u64, HEADER_SIZE);
        assert_eq!(&bytes[0..4], &1u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_be_bytes());
        assert_eq!(&bytes[8..16], &0x1234u64.to_be_bytes());
    }

    #[test]
    fn container_next_offset_is_backpatched() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        let data = vec![0xAB; 10];
        serializer.write_events_container(7, &data).unwrap();
        let bytes = serializer.into_inner().into_inner();

        assert_eq!(bytes[0], CONTAINER_EVENTS);
        let next = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
        // kind(1) + next(4) + tid(8) + size(4) + body(10)
        assert_eq!(next as usize, bytes.len());
        assert_eq!(next, 27);
        assert_eq!(&bytes[5..13], &7u64.to_be_bytes());
        assert_eq!(&bytes[13..17], &10u32.to_be_bytes());
        assert_eq!(&bytes[17..], &data[..]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        serializer
            .write_strings_container(1, &["hi".to_string()])
            .unwrap();
        let bytes = serializer.into_inner().into_inner();
        assert_eq!(bytes[0], CONTAINER_STRINGS);
        // count
        assert_eq!(&bytes[13..17], &1u32.to_be_bytes());
        // u16 length prefix then utf-8 bytes
        assert_eq!(&bytes[17..19], &2u16.to_be_bytes());
        assert_eq!(&bytes[19..21], b"hi");
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut serializer = Serializer::new(Cursor::new(Vec::new()));
        let long = "x".repeat(70_000);
        let err = serializer
            .write_strings_container(1, &[long])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
