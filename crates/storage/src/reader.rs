//! Read-only access to a stream by absolute position.
//!
//! A reader keeps one region mapped and remaps when asked for a position
//! outside it. Reads that cross a region boundary are assembled into an
//! internal scratch buffer; all other reads borrow the mapping directly.

use crate::file::MappedFile;
use crate::region::{MappedRegion, RegionMode};
use std::sync::Arc;
use tributary_core::{Error, Result};

/// Positional reader over a [`MappedFile`].
#[derive(Debug)]
pub struct RegionReader {
    region: MappedRegion,
    scratch: Vec<u8>,
    closed: bool,
}

impl RegionReader {
    /// Create a reader. No region is mapped until the first access.
    pub fn new(file: Arc<MappedFile>) -> Self {
        RegionReader {
            region: MappedRegion::new(file, RegionMode::ReadOnly),
            scratch: Vec::new(),
            closed: false,
        }
    }

    /// True if the backing file already covers the region holding
    /// `position`. Readers never grow the file, so a position the writer has
    /// not reached yet reads as unavailable rather than as zeroes.
    pub fn is_available(&mut self, position: u64) -> Result<bool> {
        self.ensure_open()?;
        if self.region.contains(position) {
            return Ok(true);
        }
        let file = self.region.file();
        file.covers(file.region_start(position).saturating_add(self.region.size()))
    }

    /// Acquire-load the `i64` at absolute `position`.
    pub fn load_acquire_i64(&mut self, position: u64) -> Result<i64> {
        let offset = self.seek(position)?;
        self.region.load_acquire_i64(offset)
    }

    /// Acquire-load the `i32` at absolute `position`.
    pub fn load_acquire_i32(&mut self, position: u64) -> Result<i32> {
        let offset = self.seek(position)?;
        self.region.load_acquire_i32(offset)
    }

    /// Borrow `len` bytes starting at absolute `position`.
    ///
    /// The caller must have established, through an acquire load of the
    /// publishing field, that the range has been written.
    pub fn read(&mut self, position: u64, len: u64) -> Result<&[u8]> {
        let offset = self.seek(position)?;
        if offset + len <= self.region.size() {
            return self.region.bytes(offset, len);
        }

        self.scratch.clear();
        self.scratch.reserve(len as usize);
        let mut at = position;
        let end = position + len;
        while at < end {
            let offset = self.seek(at)?;
            let n = (self.region.size() - offset).min(end - at);
            self.scratch.extend_from_slice(self.region.bytes(offset, n)?);
            at += n;
        }
        Ok(&self.scratch)
    }

    /// Release the mapped region.
    pub fn close(&mut self) -> Result<()> {
        if self.region.is_mapped() {
            self.region.unmap()?;
        }
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("region reader"));
        }
        Ok(())
    }

    fn seek(&mut self, position: u64) -> Result<u64> {
        self.ensure_open()?;
        if !self.region.contains(position) {
            if self.region.is_mapped() {
                self.region.unmap()?;
            }
            self.region.map(position)?;
        }
        Ok(position - self.region.position().ok_or(Error::RegionNotMapped)?)
    }
}
