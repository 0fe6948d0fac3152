//! Backing files and their growth policy.
//!
//! A `MappedFile` is shared (behind an `Arc`) by the writer and every reader
//! of one stream in a process. Each of them maps its own regions; the file
//! only owns the descriptor and the length bookkeeping.

use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use tributary_core::{Error, Result};

const MB: u64 = 1024 * 1024;

/// Smallest supported region size. Region offsets must be page aligned and
/// 64 KiB covers every mainstream page size.
pub const MIN_REGION_SIZE: u64 = 64 * 1024;

/// How a backing file grows when a region past its end is mapped.
///
/// Lengths double from `min_file_size` until `max_growth`, then grow
/// linearly by `max_growth`. Files never shrink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrowthPolicy {
    /// First length given to an empty file (default: 4MB)
    pub min_file_size: u64,
    /// Doubling ceiling and linear increment (default: 64MB)
    pub max_growth: u64,
}

impl Default for GrowthPolicy {
    fn default() -> Self {
        GrowthPolicy {
            min_file_size: 4 * MB,
            max_growth: 64 * MB,
        }
    }
}

impl GrowthPolicy {
    /// One growth step from `len`.
    pub fn step(&self, len: u64) -> u64 {
        if len < self.min_file_size {
            self.min_file_size
        } else if len < self.max_growth {
            len.saturating_mul(2)
        } else {
            len.saturating_add(self.max_growth)
        }
    }

    /// Length a file of `current` bytes grows to so that it holds at least
    /// `min_len` bytes.
    pub fn next_length(&self, current: u64, min_len: u64) -> u64 {
        let mut len = current;
        while len < min_len {
            len = self.step(len);
        }
        len
    }

    /// Successive lengths an empty file passes through until it holds
    /// `min_len` bytes.
    pub fn schedule(&self, min_len: u64) -> Vec<u64> {
        let mut lengths = Vec::new();
        let mut len = 0;
        while len < min_len {
            len = self.step(len);
            lengths.push(len);
        }
        lengths
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<()> {
        if self.min_file_size == 0 {
            return Err(Error::InvalidConfig(
                "min_file_size must be greater than zero".into(),
            ));
        }
        if self.max_growth < self.min_file_size {
            return Err(Error::InvalidConfig(format!(
                "max_growth ({}) must be at least min_file_size ({})",
                self.max_growth, self.min_file_size
            )));
        }
        Ok(())
    }
}

/// A growable backing file divided into fixed-size regions.
pub struct MappedFile {
    path: PathBuf,
    file: File,
    region_size: u64,
    growth: GrowthPolicy,
    /// Largest length this handle has observed or set
    known_len: AtomicU64,
    grow_lock: Mutex<()>,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("region_size", &self.region_size)
            .field("known_len", &self.known_len.load(Ordering::Relaxed))
            .finish()
    }
}

impl MappedFile {
    /// Open or create the backing file at `path`.
    ///
    /// A new file gets the unwritten sentinel at offset 0 so that a startup
    /// scan of an empty log stops immediately, and is sized by the growth
    /// policy to cover its first region.
    pub fn open(path: &Path, region_size: u64, growth: GrowthPolicy) -> Result<Self> {
        validate_region_size(region_size)?;
        growth.validate()?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        FileExt::lock_exclusive(&file)?;
        let init = Self::initialise(&file, growth.next_length(0, region_size));
        FileExt::unlock(&file)?;
        let len = init?;

        Ok(MappedFile {
            path: path.to_path_buf(),
            file,
            region_size,
            growth,
            known_len: AtomicU64::new(len),
            grow_lock: Mutex::new(()),
        })
    }

    fn initialise(file: &File, initial_len: u64) -> Result<u64> {
        let len = file.metadata()?.len();
        if len > 0 {
            return Ok(len);
        }
        let mut handle = file;
        handle.seek(SeekFrom::Start(0))?;
        handle.write_all(&(-1i64).to_le_bytes())?;
        file.set_len(initial_len)?;
        handle.sync_data()?;
        Ok(file.metadata()?.len())
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of every region mapped from this file
    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// Growth policy applied by [`ensure_file_length`](Self::ensure_file_length)
    pub fn growth(&self) -> &GrowthPolicy {
        &self.growth
    }

    /// Start of the region containing `position`.
    pub fn region_start(&self, position: u64) -> u64 {
        position & !(self.region_size - 1)
    }

    /// True if the file is at least `len` bytes long. Never resizes it.
    pub fn covers(&self, len: u64) -> Result<bool> {
        if self.known_len.load(Ordering::Acquire) >= len {
            return Ok(true);
        }
        Ok(self.len()? >= len)
    }

    /// Current length of the file on disk.
    pub fn len(&self) -> Result<u64> {
        let len = self.file.metadata()?.len();
        self.known_len.fetch_max(len, Ordering::AcqRel);
        Ok(len)
    }

    /// True if the file holds no bytes at all.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Grow the file to at least `min_len` bytes and return its length.
    ///
    /// The length is re-read under an exclusive lock (in-process mutex plus
    /// an advisory file lock), so growth never truncates a file that another
    /// handle has already grown further.
    pub fn ensure_file_length(&self, min_len: u64) -> Result<u64> {
        let known = self.known_len.load(Ordering::Acquire);
        if known >= min_len {
            return Ok(known);
        }

        let _guard = self.grow_lock.lock();
        FileExt::lock_exclusive(&self.file)?;
        let grown = self.grow_locked(min_len);
        FileExt::unlock(&self.file)?;
        let len = grown?;

        self.known_len.fetch_max(len, Ordering::AcqRel);
        Ok(len)
    }

    fn grow_locked(&self, min_len: u64) -> Result<u64> {
        let len = self.file.metadata()?.len();
        if len >= min_len {
            return Ok(len);
        }
        let new_len = self.growth.next_length(len, min_len);
        self.file.set_len(new_len)?;
        debug!(
            path = %self.path.display(),
            from = len,
            to = new_len,
            "Grew backing file"
        );
        Ok(new_len)
    }

    pub(crate) fn file(&self) -> &File {
        &self.file
    }
}

fn validate_region_size(region_size: u64) -> Result<()> {
    if !region_size.is_power_of_two() || region_size < MIN_REGION_SIZE {
        return Err(Error::InvalidConfig(format!(
            "region size {} must be a power of two of at least {} bytes",
            region_size, MIN_REGION_SIZE
        )));
    }
    Ok(())
}
