//! Index stream: fixed-size records locating messages.
//!
//! Record `n` lives at byte `n * 32`. All fields are little-endian:
//!
//! ```text
//! offset  size  field
//! 0       4     length (i32): message content length; <= 0 means unwritten
//! 4       8     position (i64): position of the message's length field
//! 12      4     source (i32)
//! 16      8     source sequence (i64)
//! 24      8     event time in nanos (i64)
//! ```
//!
//! The length field publishes the record: it is release-stored after every
//! other field. The message content is the `length` bytes that follow the
//! message's 8-byte length field.
//!
//! Batches publish their first record last, so a reader either sees the whole
//! batch or stops in front of it. A writer that crashed mid-batch can leave
//! published records behind an unpublished one; [`IndexWriter::open`] clears
//! them.

use crate::file::MappedFile;
use crate::reader::RegionReader;
use crate::region::{MappedRegion, RegionMode};
use crate::writer::LENGTH_FIELD_SIZE;
use std::sync::Arc;
use tracing::{error, info, warn};
use tributary_core::{Error, Result};

/// Size of one index record
pub const INDEX_RECORD_LENGTH: u64 = 32;

/// Largest addressable index ordinal. Record positions stay within a signed
/// 64-bit file offset.
pub const MAX_INDEX: u64 = i64::MAX as u64 / INDEX_RECORD_LENGTH - 1;

const POSITION_OFFSET: usize = 0;
const SOURCE_OFFSET: usize = 8;
const SOURCE_SEQ_OFFSET: usize = 12;
const EVENT_TIME_OFFSET: usize = 20;
// Fields after the 4-byte length
const BODY_LENGTH: usize = 28;

/// One decoded index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Position of the message's length field in the message stream
    pub position: u64,
    /// Message content length (unpadded)
    pub length: i32,
    /// Source of the event
    pub source: i32,
    /// Sequence number scoped to `source`
    pub source_seq: i64,
    /// Event time in nanos
    pub event_time_nanos: i64,
}

impl IndexEntry {
    /// Position of the first content byte
    pub fn content_position(&self) -> u64 {
        self.position + LENGTH_FIELD_SIZE
    }

    fn encode_body(&self) -> [u8; BODY_LENGTH] {
        let mut buf = [0u8; BODY_LENGTH];
        buf[POSITION_OFFSET..SOURCE_OFFSET].copy_from_slice(&(self.position as i64).to_le_bytes());
        buf[SOURCE_OFFSET..SOURCE_SEQ_OFFSET].copy_from_slice(&self.source.to_le_bytes());
        buf[SOURCE_SEQ_OFFSET..EVENT_TIME_OFFSET].copy_from_slice(&self.source_seq.to_le_bytes());
        buf[EVENT_TIME_OFFSET..].copy_from_slice(&self.event_time_nanos.to_le_bytes());
        buf
    }

    fn decode_body(length: i32, body: &[u8]) -> Result<Self> {
        let position = i64::from_le_bytes(field(body, POSITION_OFFSET)?);
        if position < 0 {
            return Err(Error::Corruption(format!(
                "index record points at negative position {}",
                position
            )));
        }
        Ok(IndexEntry {
            position: position as u64,
            length,
            source: i32::from_le_bytes(field(body, SOURCE_OFFSET)?),
            source_seq: i64::from_le_bytes(field(body, SOURCE_SEQ_OFFSET)?),
            event_time_nanos: i64::from_le_bytes(field(body, EVENT_TIME_OFFSET)?),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.length <= 0 {
            return Err(Error::Corruption(format!(
                "refusing to index message at {} with non-positive length {}",
                self.position, self.length
            )));
        }
        if self.position % LENGTH_FIELD_SIZE != 0 {
            return Err(Error::Misaligned {
                offset: self.position,
                align: LENGTH_FIELD_SIZE,
            });
        }
        Ok(())
    }
}

fn field<const N: usize>(body: &[u8], at: usize) -> Result<[u8; N]> {
    body.get(at..at + N)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| Error::Corruption(format!("index record truncated at offset {}", at)))
}

fn record_position(ordinal: u64) -> Result<u64> {
    if ordinal > MAX_INDEX {
        return Err(Error::IndexOutOfRange(ordinal));
    }
    Ok(ordinal * INDEX_RECORD_LENGTH)
}

/// Appends records to the index stream. One per index file.
pub struct IndexWriter {
    file: Arc<MappedFile>,
    /// Region holding the tail of the index
    current: MappedRegion,
    /// Region for publishing batch records behind the tail
    spare: MappedRegion,
    next: u64,
    closed: bool,
    /// Set when a failed batch could not be unpublished
    failed: bool,
}

impl std::fmt::Debug for IndexWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexWriter")
            .field("path", &self.file.path())
            .field("next", &self.next)
            .finish()
    }
}

impl IndexWriter {
    /// Open a writer positioned after the last contiguously published record.
    pub fn open(file: Arc<MappedFile>) -> Result<Self> {
        let mut writer = IndexWriter {
            current: MappedRegion::new(file.clone(), RegionMode::ReadWrite),
            spare: MappedRegion::new(file.clone(), RegionMode::ReadWrite),
            file,
            next: 0,
            closed: false,
            failed: false,
        };

        while writer.load_length(writer.next)? > 0 {
            writer.next += 1;
        }
        let repaired = writer.repair_torn_tail()?;
        if repaired > 0 {
            warn!(
                path = %writer.file.path().display(),
                index = writer.next,
                records = repaired,
                "Cleared records of an incomplete batch"
            );
        }
        info!(
            path = %writer.file.path().display(),
            records = writer.next,
            "Opened index writer"
        );
        Ok(writer)
    }

    fn repair_torn_tail(&mut self) -> Result<u64> {
        let mut ordinal = self.next + 1;
        while self.load_length(ordinal)? > 0 {
            let (region, offset) = self.region_for(record_position(ordinal)?)?;
            region.store_release_i32(offset, 0)?;
            ordinal += 1;
        }
        Ok(ordinal - self.next - 1)
    }

    /// Ordinal the next appended record gets
    pub fn next_index(&self) -> u64 {
        self.next
    }

    /// Append and publish one record, returning its ordinal.
    pub fn append(&mut self, entry: &IndexEntry) -> Result<u64> {
        self.ensure_not_closed()?;
        entry.validate()?;
        let ordinal = self.next;
        let position = record_position(ordinal)?;
        self.write_body(position, entry)?;
        let (region, offset) = self.region_for(position)?;
        region.store_release_i32(offset, entry.length)?;
        self.next += 1;
        Ok(ordinal)
    }

    /// Append `entries` so that readers observe all of them or none.
    ///
    /// Returns the ordinal of the first record, or `None` for an empty slice.
    pub fn append_all(&mut self, entries: &[IndexEntry]) -> Result<Option<u64>> {
        self.ensure_not_closed()?;
        let Some((head, tail)) = entries.split_first() else {
            return Ok(None);
        };
        for entry in entries {
            entry.validate()?;
        }

        let first = self.next;
        for (i, entry) in entries.iter().enumerate() {
            self.write_body(record_position(first + i as u64)?, entry)?;
        }

        let mut published = 0u64;
        let result = (|| {
            for (i, entry) in tail.iter().enumerate() {
                let position = record_position(first + 1 + i as u64)?;
                let (region, offset) = self.region_for(position)?;
                region.store_release_i32(offset, entry.length)?;
                published += 1;
            }
            let (region, offset) = self.region_for(record_position(first)?)?;
            region.store_release_i32(offset, head.length)
        })();

        if let Err(e) = result {
            self.discard_partial_batch(first + 1, published);
            return Err(e);
        }

        self.next += entries.len() as u64;
        Ok(Some(first))
    }

    /// Release all regions.
    pub fn close(&mut self) -> Result<()> {
        for region in [&mut self.current, &mut self.spare] {
            if region.is_mapped() {
                region.unmap()?;
            }
        }
        self.closed = true;
        Ok(())
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("index writer"));
        }
        if self.failed {
            return Err(Error::Corruption(format!(
                "index {} holds records of a failed batch; reopen to repair",
                self.file.path().display()
            )));
        }
        Ok(())
    }

    /// Unpublish `count` records from `first`. If that fails the records stay
    /// visible behind the unpublished batch head, so the writer refuses further
    /// appends and leaves them to the torn-tail repair of the next open.
    fn discard_partial_batch(&mut self, first: u64, count: u64) {
        let cleared = (|| {
            for ordinal in first..first + count {
                let (region, offset) = self.region_for(record_position(ordinal)?)?;
                region.store_release_i32(offset, 0)?;
            }
            Ok::<_, Error>(())
        })();
        if let Err(e) = cleared {
            error!(
                path = %self.file.path().display(),
                index = first,
                records = count,
                error = %e,
                "Failed to unpublish records of a failed batch, disabling index writer"
            );
            self.failed = true;
        }
    }

    fn load_length(&mut self, ordinal: u64) -> Result<i32> {
        let (region, offset) = self.region_for(record_position(ordinal)?)?;
        region.load_acquire_i32(offset)
    }

    fn write_body(&mut self, position: u64, entry: &IndexEntry) -> Result<()> {
        if !self.current.contains(position) {
            if self.current.is_mapped() {
                self.current.unmap()?;
            }
            self.current.map(position)?;
        }
        let offset = position - self.current.position().ok_or(Error::RegionNotMapped)?;
        self.current.write_bytes(offset + 4, &entry.encode_body())
    }

    /// Region containing `position`: the tail region when it covers it,
    /// otherwise the spare region remapped as needed.
    fn region_for(&mut self, position: u64) -> Result<(&mut MappedRegion, u64)> {
        let region = if self.current.contains(position) || !self.current.is_mapped() {
            &mut self.current
        } else {
            &mut self.spare
        };
        if !region.contains(position) {
            if region.is_mapped() {
                region.unmap()?;
            }
            region.map(position)?;
        }
        let start = region.position().ok_or(Error::RegionNotMapped)?;
        Ok((region, position - start))
    }
}

/// Reads published index records.
#[derive(Debug)]
pub struct IndexReader {
    reader: RegionReader,
}

impl IndexReader {
    /// Create a reader over `file`.
    pub fn new(file: Arc<MappedFile>) -> Self {
        IndexReader {
            reader: RegionReader::new(file),
        }
    }

    /// Read record `ordinal`, or `None` if it is not published yet.
    ///
    /// A record past the end of the index file is unpublished; the file is
    /// left for the writer to grow.
    pub fn read(&mut self, ordinal: u64) -> Result<Option<IndexEntry>> {
        let position = record_position(ordinal)?;
        if !self.reader.is_available(position)? {
            return Ok(None);
        }
        let length = self.reader.load_acquire_i32(position)?;
        if length <= 0 {
            return Ok(None);
        }
        let body = self.reader.read(position + 4, BODY_LENGTH as u64)?;
        IndexEntry::decode_body(length, body).map(Some)
    }

    /// Number of contiguously published records starting at `from`.
    pub fn count_published(&mut self, from: u64) -> Result<u64> {
        let mut ordinal = from;
        loop {
            let position = record_position(ordinal)?;
            if !self.reader.is_available(position)?
                || self.reader.load_acquire_i32(position)? <= 0
            {
                return Ok(ordinal - from);
            }
            ordinal += 1;
        }
    }

    /// Release the mapped region.
    pub fn close(&mut self) -> Result<()> {
        self.reader.close()
    }
}
