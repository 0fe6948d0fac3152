//! Two-log event processing pipeline
//!
//! Producers append to the upstream queue. Each [`EventPipeline::processor_step`]
//! polls at most one upstream event, runs the transformation on it and
//! commits whatever the transformation appended to the downstream queue as one
//! atomic batch. Downstream pollers see all of a batch or none of it; a failed
//! transformation leaves nothing behind and the same upstream event is
//! offered again on the next step.
//!
//! The pipeline keeps three [`EventProcessingState`]s:
//! - upstream before: updated right before the transformation runs
//! - upstream after: updated once the transformation and commit succeeded
//! - downstream: the last committed downstream event, rebuilt at open by
//!   replaying the downstream queue
//!
//! With deduplication on (the default), an upstream event is skipped when its
//! source sequence is not newer than the last one recorded for its source in
//! the upstream-after or downstream state. A reopened pipeline therefore
//! re-reads the upstream queue from the start without emitting its output
//! twice.

use crate::config::{QueueConfig, CONFIG_FILE_NAME};
use crate::poller::{Event, IndexCursor, IndexedPoller, PollPolicy, PollerOptions};
use crate::queue::{AppendBatch, IndexedAppender, IndexedQueue};
use crate::state::{EventProcessingState, NanoClock, SharedState, StateTracking, SystemNanoClock};
use parking_lot::Mutex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tributary_core::{Error, Header, Result};
use tributary_storage::IndexEntry;

/// Default name of the upstream queue
pub const DEFAULT_UPSTREAM_NAME: &str = "upstream";
/// Default name of the downstream queue
pub const DEFAULT_DOWNSTREAM_NAME: &str = "downstream";

type PausePredicate = Box<dyn Fn(u64, &IndexEntry) -> bool + Send>;

/// Turns one upstream event into zero or more downstream events.
pub trait Transformation: Send {
    /// Transform `event`, appending output to `downstream`.
    ///
    /// Returning an error discards everything appended so far.
    fn transform(&mut self, event: &Event<'_>, downstream: &mut DownstreamBatch<'_>) -> Result<()>;
}

impl<F> Transformation for F
where
    F: FnMut(&Event<'_>, &mut DownstreamBatch<'_>) -> Result<()> + Send,
{
    fn transform(&mut self, event: &Event<'_>, downstream: &mut DownstreamBatch<'_>) -> Result<()> {
        self(event, downstream)
    }
}

/// Downstream output of one upstream event.
///
/// Every appended event carries the upstream event's source, sequence and
/// event time.
#[derive(Debug)]
pub struct DownstreamBatch<'a> {
    batch: AppendBatch<'a>,
    upstream: Header,
}

impl DownstreamBatch<'_> {
    /// Append a downstream event.
    pub fn append(&mut self, subtype: i16, user_data: i32, payload: &[u8]) -> Result<()> {
        self.batch.append(
            self.upstream.source,
            self.upstream.source_seq,
            subtype,
            user_data,
            self.upstream.event_time_nanos,
            payload,
        )
    }

    /// Header of the upstream event being transformed
    pub fn upstream(&self) -> &Header {
        &self.upstream
    }

    /// Number of events appended so far
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// True if nothing was appended
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }
}

/// Builder for [`EventPipeline`].
pub struct PipelineBuilder {
    dir: PathBuf,
    upstream_name: String,
    downstream_name: String,
    config: Option<QueueConfig>,
    clock: Arc<dyn NanoClock>,
    dedup: bool,
    upstream_pause: Option<PausePredicate>,
}

impl std::fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("dir", &self.dir)
            .field("upstream_name", &self.upstream_name)
            .field("downstream_name", &self.downstream_name)
            .field("config", &self.config)
            .field("dedup", &self.dedup)
            .field("upstream_pause", &self.upstream_pause.is_some())
            .finish()
    }
}

impl PipelineBuilder {
    /// Pipeline whose queues live in `dir`.
    ///
    /// Without an explicit [`config`](Self::config), `dir/tributary.toml` is
    /// loaded if present.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        PipelineBuilder {
            dir: dir.as_ref().to_path_buf(),
            upstream_name: DEFAULT_UPSTREAM_NAME.to_string(),
            downstream_name: DEFAULT_DOWNSTREAM_NAME.to_string(),
            config: None,
            clock: Arc::new(SystemNanoClock),
            dedup: true,
            upstream_pause: None,
        }
    }

    /// Name of the upstream queue
    pub fn upstream_name(mut self, name: impl Into<String>) -> Self {
        self.upstream_name = name.into();
        self
    }

    /// Name of the downstream queue
    pub fn downstream_name(mut self, name: impl Into<String>) -> Self {
        self.downstream_name = name.into();
        self
    }

    /// Queue configuration for both queues
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Clock stamping ingestion times into the processing states
    pub fn clock(mut self, clock: Arc<dyn NanoClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Enable or disable deduplication by source sequence
    pub fn dedup(mut self, enabled: bool) -> Self {
        self.dedup = enabled;
        self
    }

    /// Hold upstream processing while `pause` returns true
    pub fn upstream_pause<F>(mut self, pause: F) -> Self
    where
        F: Fn(u64, &IndexEntry) -> bool + Send + 'static,
    {
        self.upstream_pause = Some(Box::new(pause));
        self
    }

    /// Open the pipeline with a closure transformation.
    pub fn open<F>(self, transformation: F) -> Result<EventPipeline>
    where
        F: FnMut(&Event<'_>, &mut DownstreamBatch<'_>) -> Result<()> + Send + 'static,
    {
        self.open_with(transformation)
    }

    /// Open the pipeline with a transformation object.
    pub fn open_with<T: Transformation + 'static>(
        self,
        transformation: T,
    ) -> Result<EventPipeline> {
        let config = match self.config {
            Some(config) => config,
            None => QueueConfig::load(&self.dir.join(CONFIG_FILE_NAME))?,
        };
        if self.upstream_name == self.downstream_name {
            return Err(Error::InvalidConfig(format!(
                "upstream and downstream queues must differ, both are '{}'",
                self.upstream_name
            )));
        }

        let upstream = IndexedQueue::open(&self.dir, &self.upstream_name, &config)?;
        let downstream = IndexedQueue::open(&self.dir, &self.downstream_name, &config)?;
        let downstream_appender = downstream.appender()?;

        let new_state = || Arc::new(Mutex::new(EventProcessingState::new(self.clock.clone())));
        let upstream_before = new_state();
        let upstream_after = new_state();
        let downstream_state = new_state();

        let replayed = replay_into(&downstream, &downstream_state)?;
        info!(
            dir = %self.dir.display(),
            upstream = %self.upstream_name,
            downstream = %self.downstream_name,
            replayed,
            dedup = self.dedup,
            "Opened event pipeline"
        );

        Ok(EventPipeline {
            upstream_cursor: upstream.cursor(),
            upstream,
            downstream,
            upstream_appender: None,
            downstream_appender,
            transformation: Box::new(transformation),
            upstream_before,
            upstream_after,
            downstream_state,
            dedup: self.dedup,
            upstream_pause: self.upstream_pause,
            closed: false,
        })
    }
}

/// Rebuild `state` from every published event of `queue`.
fn replay_into(queue: &IndexedQueue, state: &SharedState) -> Result<u64> {
    let mut poller = queue.poller_with(StateTracking::new().after(state.clone()));
    let mut count = 0;
    while poller.poll(|_| Ok(()))? > 0 {
        count += 1;
    }
    poller.close()?;
    Ok(count)
}

/// Upstream queue, downstream queue and the step connecting them.
pub struct EventPipeline {
    upstream: IndexedQueue,
    downstream: IndexedQueue,
    upstream_appender: Option<IndexedAppender>,
    downstream_appender: IndexedAppender,
    upstream_cursor: IndexCursor,
    transformation: Box<dyn Transformation>,
    upstream_before: SharedState,
    upstream_after: SharedState,
    downstream_state: SharedState,
    dedup: bool,
    upstream_pause: Option<PausePredicate>,
    closed: bool,
}

impl std::fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPipeline")
            .field("upstream", &self.upstream.name())
            .field("downstream", &self.downstream.name())
            .field("upstream_index", &self.upstream_cursor.current_index())
            .field("dedup", &self.dedup)
            .field("closed", &self.closed)
            .finish()
    }
}

struct UpstreamPolicy<'a> {
    before: &'a SharedState,
    after: &'a SharedState,
    downstream: &'a SharedState,
    dedup: bool,
    pause: Option<&'a (dyn Fn(u64, &IndexEntry) -> bool + Send)>,
}

impl PollPolicy for UpstreamPolicy<'_> {
    fn skip(&self, _index: u64, entry: &IndexEntry) -> bool {
        self.dedup
            && (entry.source_seq <= self.after.lock().source_seq_of(entry.source)
                || entry.source_seq <= self.downstream.lock().source_seq_of(entry.source))
    }

    fn pause(&self, index: u64, entry: &IndexEntry) -> bool {
        self.pause.map_or(false, |pause| pause(index, entry))
    }

    fn before_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        self.before.lock().accept_entry(index, entry);
    }

    fn after_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        self.after.lock().accept_entry(index, entry);
    }
}

impl EventPipeline {
    /// Start building a pipeline in `dir`.
    pub fn builder(dir: impl AsRef<Path>) -> PipelineBuilder {
        PipelineBuilder::new(dir)
    }

    /// Append a data event to the upstream queue.
    pub fn append(
        &mut self,
        source: i32,
        source_seq: i64,
        event_time_nanos: i64,
        payload: &[u8],
    ) -> Result<u64> {
        self.appender()?
            .append(source, source_seq, 0, 0, event_time_nanos, payload)
    }

    /// The upstream appender, acquired on first use.
    pub fn appender(&mut self) -> Result<&mut IndexedAppender> {
        self.ensure_open()?;
        if self.upstream_appender.is_none() {
            self.upstream_appender = Some(self.upstream.appender()?);
        }
        self.upstream_appender
            .as_mut()
            .ok_or(Error::Closed("upstream appender"))
    }

    /// Process at most one upstream event. Returns the number of upstream
    /// events transformed (0 or 1).
    ///
    /// Returns 0 when no event is published yet, when the next event was
    /// skipped as a duplicate, or while the upstream pause predicate holds.
    /// A transformation error is returned as is; nothing of its output is
    /// published and the next call offers the same event again.
    pub fn processor_step(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let EventPipeline {
            upstream_cursor,
            downstream_appender,
            transformation,
            upstream_before,
            upstream_after,
            downstream_state,
            dedup,
            upstream_pause,
            ..
        } = self;

        let mut policy = UpstreamPolicy {
            before: upstream_before,
            after: upstream_after,
            downstream: downstream_state,
            dedup: *dedup,
            pause: upstream_pause.as_deref(),
        };
        let mut committed: Option<(Range<u64>, Header)> = None;
        let processed = upstream_cursor.poll_with(&mut policy, |event| {
            let mut batch = DownstreamBatch {
                batch: downstream_appender.begin_batch()?,
                upstream: event.header,
            };
            transformation.transform(event, &mut batch)?;
            if let Some(range) = batch.batch.commit()? {
                committed = Some((range, event.header));
            }
            Ok(())
        })?;

        if let Some((range, header)) = committed {
            debug!(
                upstream_index = upstream_cursor.current_index() - 1,
                downstream = ?range,
                "Committed downstream batch"
            );
            downstream_state.lock().accept(
                range.end - 1,
                header.source,
                header.source_seq,
                header.event_time_nanos,
            );
        }
        Ok(processed)
    }

    /// A poller over the downstream queue.
    pub fn create_poller(&self, options: PollerOptions) -> IndexedPoller<PollerOptions> {
        self.downstream.poller(options)
    }

    /// A poller over the downstream queue driven by a custom policy.
    pub fn create_poller_with<P: PollPolicy>(&self, policy: P) -> IndexedPoller<P> {
        self.downstream.poller_with(policy)
    }

    /// Move the upstream cursor, e.g. past an event that keeps failing.
    pub fn reposition_upstream(&mut self, index: u64) {
        debug!(
            from = self.upstream_cursor.current_index(),
            to = index,
            "Repositioned upstream cursor"
        );
        self.upstream_cursor.set_index(index);
    }

    /// Index of the next upstream event to evaluate
    pub fn upstream_index(&self) -> u64 {
        self.upstream_cursor.current_index()
    }

    /// The upstream queue
    pub fn upstream(&self) -> &IndexedQueue {
        &self.upstream
    }

    /// The downstream queue
    pub fn downstream(&self) -> &IndexedQueue {
        &self.downstream
    }

    /// State updated before each transformation
    pub fn upstream_before_state(&self) -> SharedState {
        self.upstream_before.clone()
    }

    /// State updated after each successful transformation
    pub fn upstream_after_state(&self) -> SharedState {
        self.upstream_after.clone()
    }

    /// State of the last committed downstream event
    pub fn downstream_state(&self) -> SharedState {
        self.downstream_state.clone()
    }

    /// Close appenders and the upstream cursor.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut appender) = self.upstream_appender.take() {
            appender.close()?;
        }
        self.downstream_appender.close()?;
        self.upstream_cursor.close()?;
        info!(
            upstream = %self.upstream.name(),
            downstream = %self.downstream.name(),
            "Closed event pipeline"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("event pipeline"));
        }
        Ok(())
    }
}
