//! Storage layer for Tributary
//!
//! This crate implements the memory-mapped log primitives:
//! - MappedFile: growable backing file with the doubling-then-linear growth policy
//! - MappedRegion: fixed-size window of a backing file, the only place raw
//!   pointers are dereferenced
//! - MessageWriter: single-writer framing of length-prefixed messages with
//!   release-ordered publish and crash-safe resume
//! - RegionReader: read-side accessor that follows a cursor across regions
//! - IndexWriter / IndexReader: the fixed-width index stream written alongside
//!   the messages
//!
//! # Message layout
//!
//! ```text
//! [length: i64][payload][zero padding to 8 bytes]
//! ```
//!
//! A negative length marks the slot as unwritten. The writer stores `-1` into
//! the slot following a message before it publishes that message's length.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod file;
pub mod index;
pub mod reader;
pub mod region;
pub mod writer;

pub use file::{GrowthPolicy, MappedFile, MIN_REGION_SIZE};
pub use index::{IndexEntry, IndexReader, IndexWriter, INDEX_RECORD_LENGTH, MAX_INDEX};
pub use reader::RegionReader;
pub use region::{MappedRegion, RegionMode};
pub use writer::{MessageRecord, MessageWriter, LENGTH_FIELD_SIZE, UNWRITTEN};
