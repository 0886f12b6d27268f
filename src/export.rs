//! File-level export: binary trace files and their JSON conversion.
//!
//! Exporting gathers an interner snapshot and a storage snapshot and streams
//! them as one TraceData block. Append mode seeks to the end of an existing
//! file and writes another block, leaving prior blocks untouched; that is
//! what makes periodic incremental flushing cheap.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use crate::collector::Collector;
use crate::deserialize::Deserializer;
use crate::format::FormatError;
use crate::intern::{Interner, InternerSnapshot};
use crate::model::{TraceEvent, TraceModelConverter, TraceRoot};
use crate::serialize::Serializer;
use crate::storage::StorageBlock;

/// Write everything currently retired in `collector` to a fresh trace file.
///
/// Does not drain: call [`Collector::drain_all`] first if the per-thread
/// buffers should be included. Storage is left unchanged.
pub fn export_trace_data(
    collector: &Collector,
    interner: &Interner,
    path: impl AsRef<Path>,
) -> io::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let mut serializer = Serializer::new(file);
    serializer.write_header(process_id())?;
    serializer.write_trace_data(&interner.export(), &collector.storage().export_snapshot())
}

/// Append everything currently retired in `collector` as a new TraceData
/// block at the end of `path`. A missing or empty file gets a header first.
pub fn append_trace_data(
    collector: &Collector,
    interner: &Interner,
    path: impl AsRef<Path>,
) -> io::Result<()> {
    append_blocks(
        path,
        &interner.export(),
        &collector.storage().export_snapshot(),
    )
}

pub(crate) fn append_blocks(
    path: impl AsRef<Path>,
    interner: &InternerSnapshot,
    blocks: &[Arc<StorageBlock>],
) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    let end = file.seek(SeekFrom::End(0))?;
    let mut serializer = Serializer::new(file);
    if end == 0 {
        serializer.write_header(process_id())?;
    }
    serializer.write_trace_data(interner, blocks)
}

/// Read a binary trace file back into canonical Chrome-Tracing events.
pub fn convert_file(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>, FormatError> {
    let file = File::open(path)?;
    let mut deserializer = Deserializer::new(BufReader::new(file))?;
    let header = deserializer.read_header()?;

    let mut events = Vec::new();
    let mut converter = TraceModelConverter::new(header.pid, |event| events.push(event));
    deserializer.read_messages(&mut converter)?;
    converter.finish();
    Ok(events)
}

/// Convert a binary trace file into a Chrome-Tracing JSON file.
pub fn write_json(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<(), FormatError> {
    let events = convert_file(input)?;
    let out = BufWriter::new(File::create(output)?);
    serde_json::to_writer(out, &TraceRoot::new(events)).map_err(io::Error::from)?;
    Ok(())
}

fn process_id() -> u64 {
    std::process::id() as u64
}
