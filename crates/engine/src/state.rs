//! Event processing state
//!
//! Tracks the last event observed at one point of a pipeline plus the last
//! sequence number seen per source. States are fed from poller hooks and
//! compared against each other to tell how far one stage has progressed
//! relative to another.
//!
//! Nothing here is persisted; a state is rebuilt by replaying its queue.

use crate::poller::PollPolicy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tributary_storage::IndexEntry;

/// Value of a field that has not been set
pub const NOT_INITIALISED: i64 = -1;

/// Returned by [`EventProcessingState::source_seq_of`] for unknown sources
pub const MISSING: i64 = -1;

/// Source of ingestion timestamps.
pub trait NanoClock: Send + Sync {
    /// Current time in nanos
    fn nanos(&self) -> i64;
}

impl<F> NanoClock for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn nanos(&self) -> i64 {
        self()
    }
}

/// Wall clock time in nanos since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemNanoClock;

impl NanoClock for SystemNanoClock {
    fn nanos(&self) -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
    }
}

/// Last observed event and per-source sequence table.
#[derive(Clone)]
pub struct EventProcessingState {
    id: i64,
    source: i32,
    source_seq: i64,
    event_time_nanos: i64,
    ingestion_time_nanos: i64,
    source_seqs: FxHashMap<i32, i64>,
    clock: Arc<dyn NanoClock>,
}

impl std::fmt::Debug for EventProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessingState")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("source_seq", &self.source_seq)
            .field("event_time_nanos", &self.event_time_nanos)
            .field("ingestion_time_nanos", &self.ingestion_time_nanos)
            .field("sources", &self.source_seqs.len())
            .finish()
    }
}

impl Default for EventProcessingState {
    fn default() -> Self {
        Self::new(Arc::new(SystemNanoClock))
    }
}

impl EventProcessingState {
    /// Empty state stamping ingestion times from `clock`.
    pub fn new(clock: Arc<dyn NanoClock>) -> Self {
        EventProcessingState {
            id: NOT_INITIALISED,
            source: NOT_INITIALISED as i32,
            source_seq: NOT_INITIALISED,
            event_time_nanos: 0,
            ingestion_time_nanos: NOT_INITIALISED,
            source_seqs: FxHashMap::default(),
            clock,
        }
    }

    /// Record an observed event.
    pub fn accept(&mut self, id: u64, source: i32, source_seq: i64, event_time_nanos: i64) {
        self.source_seqs.insert(source, source_seq);
        self.id = id as i64;
        self.source = source;
        self.source_seq = source_seq;
        self.event_time_nanos = event_time_nanos;
        self.ingestion_time_nanos = self.clock.nanos();
    }

    /// Record the event described by an index entry.
    pub fn accept_entry(&mut self, id: u64, entry: &IndexEntry) {
        self.accept(id, entry.source, entry.source_seq, entry.event_time_nanos);
    }

    /// Ordinal of the last event, or [`NOT_INITIALISED`]
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Source of the last event
    pub fn source(&self) -> i32 {
        self.source
    }

    /// Sequence of the last event within its source
    pub fn source_seq(&self) -> i64 {
        self.source_seq
    }

    /// Last sequence seen for `source`, or [`MISSING`]
    pub fn source_seq_of(&self, source: i32) -> i64 {
        self.source_seqs.get(&source).copied().unwrap_or(MISSING)
    }

    /// Event time of the last event
    pub fn event_time_nanos(&self) -> i64 {
        self.event_time_nanos
    }

    /// When this process observed the last event
    pub fn ingestion_time_nanos(&self) -> i64 {
        self.ingestion_time_nanos
    }

    /// Visit every `(source, last sequence)` pair.
    pub fn for_each_source_entry(&self, mut f: impl FnMut(i32, i64)) {
        for (&source, &seq) in &self.source_seqs {
            f(source, seq);
        }
    }

    /// True if both states have seen a positive sequence and this state's
    /// sequence is past what `other` recorded for this state's source.
    pub fn is_ahead_of(&self, other: &EventProcessingState) -> bool {
        self.source_seq > 0
            && other.source_seq > 0
            && self.source_seq > other.source_seq_of(self.source)
    }

    /// Same last event, compared on `(source, source_seq)` only.
    pub fn is_equal_to(&self, other: &EventProcessingState) -> bool {
        self.source_seq == other.source_seq && self.source == other.source
    }

    /// Negation of [`is_equal_to`](Self::is_equal_to)
    pub fn is_not_equal_to(&self, other: &EventProcessingState) -> bool {
        !self.is_equal_to(other)
    }
}

/// A state shared between a poller hook and its readers.
pub type SharedState = Arc<Mutex<EventProcessingState>>;

/// Poll policy that records dispatched events into shared states.
///
/// `before` is updated before the consumer runs, `after` once it succeeded.
#[derive(Debug, Clone, Default)]
pub struct StateTracking {
    before: Option<SharedState>,
    after: Option<SharedState>,
}

impl StateTracking {
    /// Track nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Update `state` before dispatch
    pub fn before(mut self, state: SharedState) -> Self {
        self.before = Some(state);
        self
    }

    /// Update `state` after dispatch
    pub fn after(mut self, state: SharedState) -> Self {
        self.after = Some(state);
        self
    }
}

impl PollPolicy for StateTracking {
    fn before_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        if let Some(state) = &self.before {
            state.lock().accept_entry(index, entry);
        }
    }

    fn after_dispatch(&mut self, index: u64, entry: &IndexEntry) {
        if let Some(state) = &self.after {
            state.lock().accept_entry(index, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn fixed_clock(nanos: i64) -> Arc<dyn NanoClock> {
        Arc::new(move || nanos)
    }

    fn state_at(source: i32, seq: i64) -> EventProcessingState {
        let mut state = EventProcessingState::new(fixed_clock(0));
        state.accept(0, source, seq, 0);
        state
    }

    #[test]
    fn test_initial_state() {
        let state = EventProcessingState::new(fixed_clock(5));
        assert_eq!(state.id(), NOT_INITIALISED);
        assert_eq!(state.source(), -1);
        assert_eq!(state.source_seq(), NOT_INITIALISED);
        assert_eq!(state.event_time_nanos(), 0);
        assert_eq!(state.ingestion_time_nanos(), NOT_INITIALISED);
        assert_eq!(state.source_seq_of(1), MISSING);
    }

    #[test]
    fn test_accept_stamps_ingestion_time() {
        let ticks = Arc::new(AtomicI64::new(100));
        let clock_ticks = ticks.clone();
        let clock: Arc<dyn NanoClock> =
            Arc::new(move || clock_ticks.fetch_add(1, Ordering::SeqCst));
        let mut state = EventProcessingState::new(clock);

        state.accept(0, 1, 10, 5_000);
        assert_eq!(state.ingestion_time_nanos(), 100);
        assert_eq!(state.event_time_nanos(), 5_000);

        state.accept(1, 2, 3, 6_000);
        assert_eq!(state.ingestion_time_nanos(), 101);
        assert_eq!(state.id(), 1);
        assert_eq!(state.source(), 2);
        assert_eq!(state.source_seq_of(1), 10);
        assert_eq!(state.source_seq_of(2), 3);

        let mut entries = Vec::new();
        state.for_each_source_entry(|source, seq| entries.push((source, seq)));
        entries.sort();
        assert_eq!(entries, vec![(1, 10), (2, 3)]);
    }

    #[test]
    fn test_is_ahead_of() {
        let a = state_at(1, 5);
        let b = state_at(1, 3);
        assert!(a.is_ahead_of(&b));

        let b = state_at(1, 5);
        assert!(!a.is_ahead_of(&b));
    }

    #[test]
    fn test_is_ahead_of_uses_other_table_for_own_source() {
        let a = state_at(1, 5);
        let mut b = state_at(1, 7);
        b.accept(1, 2, 1, 0);
        // b's latest is source 2, but its record for source 1 is 7
        assert!(!a.is_ahead_of(&b));
        assert!(!b.is_ahead_of(&a));
    }

    #[test]
    fn test_is_ahead_of_needs_positive_sequences() {
        let a = state_at(1, 5);
        let empty = EventProcessingState::new(fixed_clock(0));
        assert!(!a.is_ahead_of(&empty));
        assert!(!empty.is_ahead_of(&a));

        let zero = state_at(1, 0);
        assert!(!a.is_ahead_of(&zero));
    }

    #[test]
    fn test_equality_ignores_id_and_time() {
        let mut a = EventProcessingState::new(fixed_clock(1));
        a.accept(3, 1, 5, 100);
        let mut b = EventProcessingState::new(fixed_clock(999));
        b.accept(8, 1, 5, 200);
        assert!(a.is_equal_to(&b));
        assert!(!a.is_not_equal_to(&b));

        b.accept(9, 2, 5, 200);
        assert!(a.is_not_equal_to(&b));
    }

    #[test]
    fn test_state_tracking_policy() {
        let before: SharedState = Arc::new(Mutex::new(EventProcessingState::new(fixed_clock(0))));
        let after: SharedState = Arc::new(Mutex::new(EventProcessingState::new(fixed_clock(0))));
        let mut policy = StateTracking::new().before(before.clone()).after(after.clone());
        let entry = IndexEntry {
            position: 0,
            length: 32,
            source: 4,
            source_seq: 2,
            event_time_nanos: 9,
        };

        policy.before_dispatch(0, &entry);
        assert_eq!(before.lock().source_seq_of(4), 2);
        assert_eq!(after.lock().id(), NOT_INITIALISED);
        policy.after_dispatch(0, &entry);
        assert!(after.lock().is_equal_to(&before.lock()));
    }
}
