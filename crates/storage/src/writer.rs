//! Single-writer message framing.
//!
//! Messages are framed as `[length: i64][payload][padding]`. The write
//! protocol for one message is:
//!
//! 1. `start_message` reserves the 8-byte length slot. The slot already holds
//!    the `-1` sentinel written by the previous `finish_message` (or by file
//!    initialisation).
//! 2. `put_*` calls copy payload bytes, rolling to the next region whenever
//!    the write pointer reaches the end of the current one.
//! 3. `finish_message` pads to 8 bytes, stores `-1` into the slot after the
//!    padded message, and finally release-stores the length into the slot
//!    reserved in step 1.
//!
//! A reader that acquire-loads a non-negative length therefore sees the whole
//! payload and the next sentinel.
//!
//! # Region rolls
//!
//! The length slot of an open message must stay mapped until the message is
//! published, even after the write pointer rolls into later regions:
//!
//! ```text
//! Idle --start--> WriteOpen --roll--> RollPending --finish--> Idle
//!                    |                     |
//!                    +--------finish-------+
//! ```
//!
//! `RollPending` keeps the start region mapped; it is unmapped right after the
//! length store.

use crate::file::MappedFile;
use crate::region::{MappedRegion, RegionMode};
use std::sync::Arc;
use tracing::{debug, info};
use tributary_core::{Error, Result};

/// Size of the length field in front of every message
pub const LENGTH_FIELD_SIZE: u64 = 8;

/// Length value of a slot that has not been written
pub const UNWRITTEN: i64 = -1;

const ZEROS: [u8; 8] = [0; 8];

/// Location of a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageRecord {
    /// Position of the length field
    pub position: u64,
    /// Published length (payload plus padding)
    pub length: u64,
}

impl MessageRecord {
    /// Position of the first payload byte
    pub fn payload_position(&self) -> u64 {
        self.position + LENGTH_FIELD_SIZE
    }

    /// Position of the slot following this message
    pub fn end_position(&self) -> u64 {
        self.position + LENGTH_FIELD_SIZE + self.length
    }
}

enum WriteState {
    Idle,
    WriteOpen {
        start: u64,
    },
    RollPending {
        start: u64,
        start_region: MappedRegion,
    },
}

impl WriteState {
    fn start(&self) -> Option<u64> {
        match self {
            WriteState::Idle => None,
            WriteState::WriteOpen { start } | WriteState::RollPending { start, .. } => Some(*start),
        }
    }
}

/// Appends messages to a backing file.
///
/// There must be at most one `MessageWriter` per file across all processes;
/// this is not enforced here.
pub struct MessageWriter {
    file: Arc<MappedFile>,
    position: u64,
    current: MappedRegion,
    state: WriteState,
    closed: bool,
}

impl std::fmt::Debug for MessageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageWriter")
            .field("path", &self.file.path())
            .field("position", &self.position)
            .field("message_start", &self.state.start())
            .field("closed", &self.closed)
            .finish()
    }
}

impl MessageWriter {
    /// Open a writer positioned after the last published message.
    ///
    /// The resume point is found by scanning length fields from the start of
    /// the file, skipping each published message, up to the first negative
    /// length.
    pub fn open(file: Arc<MappedFile>) -> Result<Self> {
        let current = MappedRegion::new(file.clone(), RegionMode::ReadWrite);
        let mut writer = MessageWriter {
            file,
            position: 0,
            current,
            state: WriteState::Idle,
            closed: false,
        };
        let count = writer.skip_existing_messages()?;
        info!(
            path = %writer.file.path().display(),
            position = writer.position,
            messages = count,
            "Opened message writer"
        );
        Ok(writer)
    }

    fn skip_existing_messages(&mut self) -> Result<u64> {
        let mut count = 0;
        loop {
            let offset = self.map_covering(self.position)?;
            let length = self.current.load_acquire_i64(offset)?;
            if length < 0 {
                return Ok(count);
            }
            if length as u64 % LENGTH_FIELD_SIZE != 0 {
                return Err(Error::Corruption(format!(
                    "message at position {} has unpadded length {}",
                    self.position, length
                )));
            }
            self.position += LENGTH_FIELD_SIZE + length as u64;
            count += 1;
        }
    }

    /// Current write position. When no message is open this is the slot the
    /// next message's length goes into.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True while a message is open
    pub fn is_message_open(&self) -> bool {
        self.state.start().is_some()
    }

    /// The backing file
    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    /// Begin a new message.
    pub fn start_message(&mut self) -> Result<&mut Self> {
        self.ensure_not_closed()?;
        if self.is_message_open() {
            return Err(Error::MessageAlreadyStarted);
        }
        self.map_covering(self.position)?;
        self.state = WriteState::WriteOpen {
            start: self.position,
        };
        self.position += LENGTH_FIELD_SIZE;
        Ok(self)
    }

    /// Write an `i8`.
    pub fn put_i8(&mut self, value: i8) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i16`.
    pub fn put_i16(&mut self, value: i16) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i32`.
    pub fn put_i32(&mut self, value: i32) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `i64`.
    pub fn put_i64(&mut self, value: i64) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `f32`.
    pub fn put_f32(&mut self, value: f32) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian `f64`.
    pub fn put_f64(&mut self, value: f64) -> Result<&mut Self> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Write raw bytes. Values may straddle a region boundary.
    pub fn put_bytes(&mut self, mut bytes: &[u8]) -> Result<&mut Self> {
        self.ensure_not_closed()?;
        if !self.is_message_open() {
            return Err(Error::NoMessageStarted);
        }
        while !bytes.is_empty() {
            let offset = self.writable_offset()?;
            let room = (self.current.size() - offset) as usize;
            let n = room.min(bytes.len());
            self.current.write_bytes(offset, &bytes[..n])?;
            self.position += n as u64;
            bytes = &bytes[n..];
        }
        Ok(self)
    }

    /// Pad, write the next sentinel and publish the open message.
    pub fn finish_message(&mut self) -> Result<MessageRecord> {
        self.ensure_not_closed()?;
        let start = self.state.start().ok_or(Error::NoMessageStarted)?;

        let pad =
            ((LENGTH_FIELD_SIZE - self.position % LENGTH_FIELD_SIZE) % LENGTH_FIELD_SIZE) as usize;
        if pad > 0 {
            self.put_bytes(&ZEROS[..pad])?;
        }

        let sentinel = self.writable_offset()?;
        self.current.store_release_i64(sentinel, UNWRITTEN)?;

        let length = self.position - start - LENGTH_FIELD_SIZE;
        match std::mem::replace(&mut self.state, WriteState::Idle) {
            WriteState::Idle => return Err(Error::NoMessageStarted),
            WriteState::WriteOpen { start } => {
                let offset = start - self.current_start()?;
                self.current.store_release_i64(offset, length as i64)?;
            }
            WriteState::RollPending {
                start,
                mut start_region,
            } => {
                let region_start = start_region.position().ok_or(Error::RegionNotMapped)?;
                start_region.store_release_i64(start - region_start, length as i64)?;
                start_region.unmap()?;
            }
        }

        Ok(MessageRecord {
            position: start,
            length,
        })
    }

    /// Drop the open message, if any, without publishing it.
    ///
    /// Its length slot still holds the sentinel, so the bytes written so far
    /// are never observed. The write pointer is left where it is; use
    /// [`truncate_to`](Self::truncate_to) to reuse the space.
    pub fn abandon_message(&mut self) {
        self.state = WriteState::Idle;
    }

    /// Move the write pointer back to `position` and re-arm the sentinel
    /// there.
    ///
    /// Everything at or after `position` becomes unreachable for the startup
    /// scan and is overwritten by later appends. Any open message is
    /// abandoned.
    pub fn truncate_to(&mut self, position: u64) -> Result<()> {
        self.ensure_not_closed()?;
        if position % LENGTH_FIELD_SIZE != 0 || position > self.position {
            return Err(Error::OutOfBounds {
                offset: position,
                len: LENGTH_FIELD_SIZE,
                size: self.position,
            });
        }
        self.abandon_message();
        let offset = self.map_covering(position)?;
        self.current.store_release_i64(offset, UNWRITTEN)?;
        debug!(
            path = %self.file.path().display(),
            from = self.position,
            to = position,
            "Truncated message stream"
        );
        self.position = position;
        Ok(())
    }

    /// Flush the current region's dirty pages to disk.
    pub fn flush(&self) -> Result<()> {
        if self.current.is_mapped() {
            self.current.flush()?;
        }
        Ok(())
    }

    /// Publish any open message and release all regions.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.is_message_open() {
            self.finish_message()?;
        }
        if self.current.is_mapped() {
            self.current.unmap()?;
        }
        self.closed = true;
        Ok(())
    }

    /// True once closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_not_closed(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("message writer"));
        }
        Ok(())
    }

    fn current_start(&self) -> Result<u64> {
        self.current.position().ok_or(Error::RegionNotMapped)
    }

    /// Map the region containing `position` as the current region (no
    /// message open) and return the offset of `position` in it.
    fn map_covering(&mut self, position: u64) -> Result<u64> {
        if !self.current.contains(position) {
            if self.current.is_mapped() {
                self.current.unmap()?;
            }
            self.current.map(position)?;
        }
        Ok(position - self.current_start()?)
    }

    /// Offset of the write pointer in the current region, rolling first if
    /// the pointer has moved past it.
    fn writable_offset(&mut self) -> Result<u64> {
        if !self.current.contains(self.position) {
            self.roll()?;
        }
        Ok(self.position - self.current_start()?)
    }

    fn roll(&mut self) -> Result<()> {
        let mut next = MappedRegion::new(self.file.clone(), RegionMode::ReadWrite);
        next.map(self.position)?;
        let mut previous = std::mem::replace(&mut self.current, next);

        self.state = match std::mem::replace(&mut self.state, WriteState::Idle) {
            // The message's length slot lives in `previous`; keep it mapped
            // until the message is published.
            WriteState::WriteOpen { start } if previous.contains(start) => {
                WriteState::RollPending {
                    start,
                    start_region: previous,
                }
            }
            state => {
                if previous.is_mapped() {
                    previous.unmap()?;
                }
                state
            }
        };
        debug!(
            path = %self.file.path().display(),
            position = self.position,
            "Rolled to next region"
        );
        Ok(())
    }
}

impl Drop for MessageWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, "Failed to close message writer");
        }
    }
}
