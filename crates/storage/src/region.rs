//! Mapped regions of a backing file.
//!
//! A region is a fixed-size, page-aligned window of a [`MappedFile`]. It moves
//! through `unmapped -> mapped -> unmapped`; mapping twice or unmapping twice
//! is a usage error.
//!
//! All raw pointer access in the crate lives in this module. Every accessor
//! bounds-checks its offset against the region size, and atomic accessors
//! also check alignment, before touching the mapping.

use crate::file::MappedFile;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::trace;
use tributary_core::{Error, Result};

/// Access mode of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionMode {
    /// Reader mapping; writes are rejected
    ReadOnly,
    /// Writer mapping
    ReadWrite,
}

enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

struct Mapped {
    position: u64,
    ptr: *mut u8,
    // Keeps the mapping alive for as long as `ptr` is in use
    _mapping: Mapping,
}

/// A fixed-size window of a backing file.
pub struct MappedRegion {
    file: Arc<MappedFile>,
    mode: RegionMode,
    mapped: Option<Mapped>,
}

// SAFETY: the raw pointer refers to a mapping owned by this region and is only
// dereferenced through `&self`/`&mut self`. A region is used by one thread at
// a time; moving it to another thread is fine.
unsafe impl Send for MappedRegion {}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.file.path())
            .field("mode", &self.mode)
            .field("position", &self.position())
            .finish()
    }
}

impl MappedRegion {
    /// Create an unmapped region of `file`.
    pub fn new(file: Arc<MappedFile>, mode: RegionMode) -> Self {
        MappedRegion {
            file,
            mode,
            mapped: None,
        }
    }

    /// Access mode
    pub fn mode(&self) -> RegionMode {
        self.mode
    }

    /// Backing file
    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    /// Size of the region in bytes
    pub fn size(&self) -> u64 {
        self.file.region_size()
    }

    /// Start position in the file, if mapped
    pub fn position(&self) -> Option<u64> {
        self.mapped.as_ref().map(|m| m.position)
    }

    /// True if mapped
    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// True if mapped and `position` lies inside the region.
    pub fn contains(&self, position: u64) -> bool {
        match &self.mapped {
            Some(m) => position >= m.position && position - m.position < self.size(),
            None => false,
        }
    }

    /// Map the region containing `position`.
    ///
    /// A read-write region grows the backing file first. A read-only region
    /// never resizes the file and fails with [`Error::PastEndOfFile`] when
    /// the file does not cover it yet.
    pub fn map(&mut self, position: u64) -> Result<&mut Self> {
        if let Some(m) = &self.mapped {
            return Err(Error::RegionAlreadyMapped(m.position));
        }
        let start = self.file.region_start(position);
        let size = self.size();
        match self.mode {
            RegionMode::ReadWrite => {
                self.file.ensure_file_length(start + size)?;
            }
            RegionMode::ReadOnly => {
                if !self.file.covers(start.saturating_add(size))? {
                    return Err(Error::PastEndOfFile {
                        position: start,
                        file_len: self.file.len()?,
                    });
                }
            }
        }

        let mut options = MmapOptions::new();
        options.offset(start).len(size as usize);
        let (ptr, mapping) = match self.mode {
            RegionMode::ReadOnly => {
                // SAFETY: the file is at least `start + size` bytes long. Other
                // processes may write the mapped range; readers only consume
                // bytes after an acquire load of the publishing length field.
                let mmap = unsafe { options.map(self.file.file()) }
                    .map_err(|source| Error::Mapping {
                        position: start,
                        source,
                    })?;
                (mmap.as_ptr() as *mut u8, Mapping::ReadOnly(mmap))
            }
            RegionMode::ReadWrite => {
                // SAFETY: as above; the single writer owns all stores into
                // unpublished bytes.
                let mut mmap = unsafe { options.map_mut(self.file.file()) }
                    .map_err(|source| Error::Mapping {
                        position: start,
                        source,
                    })?;
                (mmap.as_mut_ptr(), Mapping::ReadWrite(mmap))
            }
        };
        trace!(
            path = %self.file.path().display(),
            position = start,
            mode = ?self.mode,
            "Mapped region"
        );

        self.mapped = Some(Mapped {
            position: start,
            ptr,
            _mapping: mapping,
        });
        Ok(self)
    }

    /// Unmap the region.
    pub fn unmap(&mut self) -> Result<&mut Self> {
        match self.mapped.take() {
            Some(m) => {
                trace!(
                    path = %self.file.path().display(),
                    position = m.position,
                    "Unmapped region"
                );
                Ok(self)
            }
            None => Err(Error::RegionNotMapped),
        }
    }

    /// Acquire-load the `i64` at `offset`.
    pub fn load_acquire_i64(&self, offset: u64) -> Result<i64> {
        let ptr = self.checked_ptr(offset, 8, 8)?;
        // SAFETY: in bounds and 8-byte aligned (checked above); the mapping
        // lives as long as `self`.
        let slot = unsafe { &*(ptr as *const AtomicI64) };
        Ok(slot.load(Ordering::Acquire))
    }

    /// Acquire-load the `i32` at `offset`.
    pub fn load_acquire_i32(&self, offset: u64) -> Result<i32> {
        let ptr = self.checked_ptr(offset, 4, 4)?;
        // SAFETY: in bounds and 4-byte aligned (checked above).
        let slot = unsafe { &*(ptr as *const AtomicI32) };
        Ok(slot.load(Ordering::Acquire))
    }

    /// Release-store `value` at `offset`. Every write made before this call
    /// is visible to a thread that acquire-loads the stored value.
    pub fn store_release_i64(&self, offset: u64, value: i64) -> Result<()> {
        self.ensure_writable()?;
        let ptr = self.checked_ptr(offset, 8, 8)?;
        // SAFETY: in bounds, aligned and backed by a writable mapping.
        let slot = unsafe { &*(ptr as *const AtomicI64) };
        slot.store(value, Ordering::Release);
        Ok(())
    }

    /// Release-store `value` at `offset`.
    pub fn store_release_i32(&self, offset: u64, value: i32) -> Result<()> {
        self.ensure_writable()?;
        let ptr = self.checked_ptr(offset, 4, 4)?;
        // SAFETY: in bounds, aligned and backed by a writable mapping.
        let slot = unsafe { &*(ptr as *const AtomicI32) };
        slot.store(value, Ordering::Release);
        Ok(())
    }

    /// Copy `bytes` into the region at `offset`.
    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let ptr = self.checked_ptr(offset, bytes.len() as u64, 1)?;
        // SAFETY: destination range is in bounds of a writable mapping and
        // cannot overlap a caller-owned slice.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(())
    }

    /// Borrow `len` bytes at `offset`.
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let ptr = self.checked_ptr(offset, len, 1)?;
        // SAFETY: in bounds; the slice borrows `self`, so the mapping cannot
        // be dropped while it is alive.
        Ok(unsafe { std::slice::from_raw_parts(ptr as *const u8, len as usize) })
    }

    /// Flush written pages to the backing file.
    pub fn flush(&self) -> Result<()> {
        match &self.mapped {
            Some(Mapped {
                _mapping: Mapping::ReadWrite(mmap),
                ..
            }) => Ok(mmap.flush()?),
            Some(m) => Err(Error::ReadOnlyRegion(m.position)),
            None => Err(Error::RegionNotMapped),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        match (&self.mapped, self.mode) {
            (None, _) => Err(Error::RegionNotMapped),
            (Some(m), RegionMode::ReadOnly) => Err(Error::ReadOnlyRegion(m.position)),
            (Some(_), RegionMode::ReadWrite) => Ok(()),
        }
    }

    fn checked_ptr(&self, offset: u64, len: u64, align: u64) -> Result<*mut u8> {
        let mapped = self.mapped.as_ref().ok_or(Error::RegionNotMapped)?;
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(Error::OutOfBounds { offset, len, size });
        }
        if offset % align != 0 {
            return Err(Error::Misaligned { offset, align });
        }
        // SAFETY: offset + len <= size, the length of the mapping.
        Ok(unsafe { mapped.ptr.add(offset as usize) })
    }
}
