//! Queue and pipeline engine for Tributary
//!
//! This crate builds the user-facing API on top of the storage layer:
//! - IndexedQueue: a message stream plus its index, handing out one appender
//!   and any number of pollers
//! - Pollers: non-blocking cursors with skip/pause predicates and dispatch hooks
//! - EventProcessingState: last observed event plus per-source sequences
//! - EventPipeline: upstream queue, transformation step, downstream queue with
//!   atomic per-event batches
//! - Step: cooperative scheduling of non-blocking work
//!
//! Nothing here spawns threads. Callers drive appenders, pollers and pipeline
//! steps from their own loops.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod state;
pub mod step;

pub use config::{QueueConfig, CONFIG_FILE_NAME};
pub use pipeline::{DownstreamBatch, EventPipeline, PipelineBuilder, Transformation};
pub use poller::{Event, IndexCursor, IndexedPoller, PollPolicy, PollerOptions};
pub use queue::{AppendBatch, IndexedAppender, IndexedQueue};
pub use state::{
    EventProcessingState, NanoClock, SharedState, StateTracking, SystemNanoClock, MISSING,
    NOT_INITIALISED,
};
pub use step::{run_until_idle, Step};

pub use tributary_core::{Error, EventType, Header, Result, ADMIN_SOURCE_ID};
pub use tributary_storage::{GrowthPolicy, IndexEntry, MAX_INDEX};
