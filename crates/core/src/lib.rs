//! Core types for Tributary
//!
//! This crate defines the foundational types shared by the storage and
//! engine layers:
//! - Error: the error taxonomy (usage, mapping, data, transformation)
//! - Header: the fixed-layout event header written in front of every payload
//! - EventType: discriminates data, heartbeat and admin events

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod header;

pub use error::{Error, Result};
pub use header::{
    EventType, Header, ADMIN_SOURCE_ID, HEADER_LENGTH, HEADER_VERSION, MAX_PAYLOAD_LENGTH,
};
