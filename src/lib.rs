//! Tributary - memory-mapped event logs for single-writer pipelines
//!
//! Tributary stores events in append-only, memory-mapped logs. Each log is a
//! message stream plus a fixed-width index; pollers follow the index without
//! blocking and see an event only once it is fully published.
//!
//! # Quick Start
//!
//! ```ignore
//! use tributary::{EventPipeline, PollerOptions, QueueConfig};
//!
//! let mut pipeline = EventPipeline::builder("/var/lib/orders")
//!     .open(|event, downstream| downstream.append(0, 0, event.payload))?;
//!
//! pipeline.append(1, 1, now_nanos, b"order placed")?;
//! pipeline.processor_step()?;
//!
//! let mut poller = pipeline.create_poller(PollerOptions::new());
//! poller.poll(|event| {
//!     println!("{} bytes from source {}", event.payload.len(), event.header.source);
//!     Ok(())
//! })?;
//! ```
//!
//! # Architecture
//!
//! - `tributary-core`: errors and the event header codec
//! - `tributary-storage`: mapped files, regions, message and index streams
//! - `tributary-engine`: queues, pollers, processing state and pipelines
//!
//! The engine API is re-exported here; the lower layers are reachable through
//! [`storage`] and [`types`] for tools that work on raw streams.

pub use tributary_engine::*;

/// Raw storage primitives
pub use tributary_storage as storage;

/// Error and header types
pub use tributary_core as types;
