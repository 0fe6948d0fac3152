//! Pollers: non-blocking read cursors over an indexed queue.
//!
//! One poll call runs a single decode/dispatch/advance cycle:
//!
//! 1. Acquire-load the index record at the cursor. Unpublished: return 0.
//! 2. Skip predicate matches: advance past the record for good, return 0.
//! 3. Pause predicate matches: return 0 without advancing. The predicate is
//!    evaluated again on the next call.
//! 4. Otherwise read the message, run the before hook, hand the event to the
//!    consumer, run the after hook and advance. Return 1.
//!
//! If the consumer fails, the after hook does not run, the cursor stays on
//! the record and the error is returned.

use std::sync::Arc;
use tributary_core::{Error, Header, Result, HEADER_LENGTH};
use tributary_storage::{IndexEntry, IndexReader, MappedFile, RegionReader};

/// An event delivered to a poll consumer.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    /// Ordinal of the event in its queue
    pub index: u64,
    /// Decoded header
    pub header: Header,
    /// Payload bytes following the header
    pub payload: &'a [u8],
}

/// Per-record decisions and hooks of a poller.
///
/// Every method has a neutral default, so implementors override only what
/// they need. `skip` and `pause` should be pure functions of their inputs;
/// the hooks may mutate state.
pub trait PollPolicy {
    /// Permanently bypass the record at `index`.
    fn skip(&self, _index: u64, _entry: &IndexEntry) -> bool {
        false
    }

    /// Hold the cursor at `index` for now.
    fn pause(&self, _index: u64, _entry: &IndexEntry) -> bool {
        false
    }

    /// Called right before the consumer sees the record.
    fn before_dispatch(&mut self, _index: u64, _entry: &IndexEntry) {}

    /// Called after the consumer accepted the record.
    fn after_dispatch(&mut self, _index: u64, _entry: &IndexEntry) {}
}

/// The neutral policy: dispatch everything.
impl PollPolicy for () {}

impl<P: PollPolicy + ?Sized> PollPolicy for &mut P {
    fn skip(&self, index: u64, entry: &IndexEntry) -> bool {
        (**self).skip(index, entry)
    }

    fn pause(&self, index: u64, entry: &IndexEntry) -> bool {
        (**self).pause(index, entry)
    }

    fn before_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        (**self).before_dispatch(index, entry)
    }

    fn after_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        (**self).after_dispatch(index, entry)
    }
}

type Predicate = Box<dyn Fn(u64, &IndexEntry) -> bool + Send>;
type Hook = Box<dyn FnMut(u64, &IndexEntry) + Send>;

/// Closure-based poll policy.
///
/// # Example
///
/// ```ignore
/// let options = PollerOptions::new()
///     .with_skip(|_, entry| entry.source == 2)
///     .with_after_dispatch(move |index, _| last.store(index, Ordering::Release));
/// ```
#[derive(Default)]
pub struct PollerOptions {
    skip: Option<Predicate>,
    pause: Option<Predicate>,
    before_dispatch: Option<Hook>,
    after_dispatch: Option<Hook>,
}

impl std::fmt::Debug for PollerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollerOptions")
            .field("skip", &self.skip.is_some())
            .field("pause", &self.pause.is_some())
            .field("before_dispatch", &self.before_dispatch.is_some())
            .field("after_dispatch", &self.after_dispatch.is_some())
            .finish()
    }
}

impl PollerOptions {
    /// Options that dispatch every record
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the skip predicate
    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(u64, &IndexEntry) -> bool + Send + 'static,
    {
        self.skip = Some(Box::new(skip));
        self
    }

    /// Set the pause predicate
    pub fn with_pause<F>(mut self, pause: F) -> Self
    where
        F: Fn(u64, &IndexEntry) -> bool + Send + 'static,
    {
        self.pause = Some(Box::new(pause));
        self
    }

    /// Set the hook run before dispatch
    pub fn with_before_dispatch<F>(mut self, hook: F) -> Self
    where
        F: FnMut(u64, &IndexEntry) + Send + 'static,
    {
        self.before_dispatch = Some(Box::new(hook));
        self
    }

    /// Set the hook run after dispatch
    pub fn with_after_dispatch<F>(mut self, hook: F) -> Self
    where
        F: FnMut(u64, &IndexEntry) + Send + 'static,
    {
        self.after_dispatch = Some(Box::new(hook));
        self
    }
}

impl PollPolicy for PollerOptions {
    fn skip(&self, index: u64, entry: &IndexEntry) -> bool {
        self.skip.as_ref().map_or(false, |f| f(index, entry))
    }

    fn pause(&self, index: u64, entry: &IndexEntry) -> bool {
        self.pause.as_ref().map_or(false, |f| f(index, entry))
    }

    fn before_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        if let Some(hook) = self.before_dispatch.as_mut() {
            hook(index, entry);
        }
    }

    fn after_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        if let Some(hook) = self.after_dispatch.as_mut() {
            hook(index, entry);
        }
    }
}

/// Read position over a queue's index and message streams.
///
/// A cursor maps its own regions and never touches writer state, so any
/// number of cursors may follow the same queue from different threads.
#[derive(Debug)]
pub struct IndexCursor {
    index: IndexReader,
    messages: RegionReader,
    current_index: u64,
}

impl IndexCursor {
    /// Create a cursor at index 0.
    pub fn new(index: Arc<MappedFile>, messages: Arc<MappedFile>) -> Self {
        IndexCursor {
            index: IndexReader::new(index),
            messages: RegionReader::new(messages),
            current_index: 0,
        }
    }

    /// Index of the next record to evaluate
    pub fn current_index(&self) -> u64 {
        self.current_index
    }

    /// Move the cursor to `index`. An index past the end of the queue polls
    /// as unpublished; one beyond [`MAX_INDEX`](crate::MAX_INDEX)
    /// fails the next poll with [`Error::IndexOutOfRange`].
    pub fn set_index(&mut self, index: u64) {
        self.current_index = index;
    }

    /// Run one poll cycle with `policy`. Returns the number of events
    /// dispatched (0 or 1).
    pub fn poll_with<P, F>(&mut self, policy: &mut P, consumer: F) -> Result<usize>
    where
        P: PollPolicy + ?Sized,
        F: FnOnce(&Event<'_>) -> Result<()>,
    {
        let index = self.current_index;
        let Some(entry) = self.index.read(index)? else {
            return Ok(0);
        };
        if policy.skip(index, &entry) {
            self.current_index += 1;
            return Ok(0);
        }
        if policy.pause(index, &entry) {
            return Ok(0);
        }

        let content = self
            .messages
            .read(entry.content_position(), entry.length as u64)?;
        let header = Header::decode(content)?;
        if header.payload_length as usize + HEADER_LENGTH != content.len() {
            return Err(Error::Corruption(format!(
                "index {} records {} content bytes but header declares a {} byte payload",
                index,
                content.len(),
                header.payload_length
            )));
        }
        let event = Event {
            index,
            header,
            payload: &content[HEADER_LENGTH..],
        };

        policy.before_dispatch(index, &entry);
        consumer(&event)?;
        policy.after_dispatch(index, &entry);
        self.current_index += 1;
        Ok(1)
    }

    /// Release mapped regions. Later polls fail.
    pub fn close(&mut self) -> Result<()> {
        self.index.close()?;
        self.messages.close()
    }
}

/// A cursor bundled with the policy that drives it.
#[derive(Debug)]
pub struct IndexedPoller<P = PollerOptions> {
    cursor: IndexCursor,
    policy: P,
}

impl<P: PollPolicy> IndexedPoller<P> {
    /// Create a poller.
    pub fn new(cursor: IndexCursor, policy: P) -> Self {
        IndexedPoller { cursor, policy }
    }

    /// Poll at most one event.
    pub fn poll<F>(&mut self, consumer: F) -> Result<usize>
    where
        F: FnOnce(&Event<'_>) -> Result<()>,
    {
        self.cursor.poll_with(&mut self.policy, consumer)
    }

    /// Reposition the cursor, e.g. to replay from a checkpoint.
    pub fn next_index(&mut self, index: u64) -> &mut Self {
        self.cursor.set_index(index);
        self
    }

    /// Index of the next record to evaluate
    pub fn current_index(&self) -> u64 {
        self.cursor.current_index()
    }

    /// The policy
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The policy, mutably
    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    /// Release mapped regions.
    pub fn close(&mut self) -> Result<()> {
        self.cursor.close()
    }
}
