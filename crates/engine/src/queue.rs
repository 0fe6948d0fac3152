//! Indexed queues: a message stream plus its index stream.
//!
//! An [`IndexedQueue`] owns the two backing files of one log and hands out
//! the queue triple:
//! - one exclusive [`IndexedAppender`] at a time
//! - any number of independent pollers
//! - a size accessor
//!
//! Files are named `{name}.msg` and `{name}.idx` inside the queue directory.
//!
//! # Append protocol
//!
//! Each append frames `[header][payload]` as one message, then writes and
//! publishes its index record. Readers go through the index only, so a message
//! becomes visible when its index record is published. A message whose index
//! record never got written (crash in between) stays unreachable.

use crate::config::QueueConfig;
use crate::poller::{IndexCursor, IndexedPoller, PollPolicy, PollerOptions};
use parking_lot::Mutex;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tributary_core::{Error, Header, Result, HEADER_LENGTH};
use tributary_storage::{IndexEntry, IndexReader, IndexWriter, MappedFile, MessageWriter};

/// File extension of the message stream
pub const MESSAGE_FILE_EXTENSION: &str = "msg";
/// File extension of the index stream
pub const INDEX_FILE_EXTENSION: &str = "idx";

struct SizeTracker {
    reader: IndexReader,
    known: u64,
}

/// One log: message and index backing files.
pub struct IndexedQueue {
    name: String,
    dir: PathBuf,
    messages: Arc<MappedFile>,
    index: Arc<MappedFile>,
    appender_active: Arc<AtomicBool>,
    size: Mutex<SizeTracker>,
}

impl std::fmt::Debug for IndexedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedQueue")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .finish()
    }
}

impl IndexedQueue {
    /// Open or create the queue `name` in `dir`.
    pub fn open(dir: &Path, name: &str, config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(dir)?;

        let messages = Arc::new(MappedFile::open(
            &dir.join(format!("{}.{}", name, MESSAGE_FILE_EXTENSION)),
            config.message_region_size,
            config.growth,
        )?);
        let index = Arc::new(MappedFile::open(
            &dir.join(format!("{}.{}", name, INDEX_FILE_EXTENSION)),
            config.index_region_size,
            config.growth,
        )?);

        let queue = IndexedQueue {
            name: name.to_string(),
            dir: dir.to_path_buf(),
            size: Mutex::new(SizeTracker {
                reader: IndexReader::new(index.clone()),
                known: 0,
            }),
            messages,
            index,
            appender_active: Arc::new(AtomicBool::new(false)),
        };
        let size = queue.size()?;
        info!(
            queue = %queue.name,
            dir = %queue.dir.display(),
            size,
            "Opened queue"
        );
        Ok(queue)
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding the backing files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Acquire the queue's appender.
    ///
    /// Only one appender may be live per queue handle; a second request fails
    /// with [`Error::AppenderInUse`] until the first is closed or dropped.
    /// Exclusion across handles and processes is the caller's responsibility.
    pub fn appender(&self) -> Result<IndexedAppender> {
        if self
            .appender_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AppenderInUse(self.name.clone()));
        }

        let opened = MessageWriter::open(self.messages.clone())
            .and_then(|messages| Ok((messages, IndexWriter::open(self.index.clone())?)));
        match opened {
            Ok((messages, index)) => Ok(IndexedAppender {
                queue: self.name.clone(),
                messages,
                index,
                active: self.appender_active.clone(),
                closed: false,
            }),
            Err(e) => {
                self.appender_active.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// A raw read cursor positioned at index 0.
    pub fn cursor(&self) -> IndexCursor {
        IndexCursor::new(self.index.clone(), self.messages.clone())
    }

    /// A poller driven by closure-based options.
    pub fn poller(&self, options: PollerOptions) -> IndexedPoller<PollerOptions> {
        IndexedPoller::new(self.cursor(), options)
    }

    /// A poller driven by a custom policy.
    pub fn poller_with<P: PollPolicy>(&self, policy: P) -> IndexedPoller<P> {
        IndexedPoller::new(self.cursor(), policy)
    }

    /// Number of published records.
    pub fn size(&self) -> Result<u64> {
        let mut tracker = self.size.lock();
        let known = tracker.known;
        let more = tracker.reader.count_published(known)?;
        tracker.known = known + more;
        Ok(tracker.known)
    }
}

/// Exclusive write handle of a queue.
pub struct IndexedAppender {
    queue: String,
    messages: MessageWriter,
    index: IndexWriter,
    active: Arc<AtomicBool>,
    closed: bool,
}

impl std::fmt::Debug for IndexedAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexedAppender")
            .field("queue", &self.queue)
            .field("next_index", &self.index.next_index())
            .field("position", &self.messages.position())
            .finish()
    }
}

impl IndexedAppender {
    /// Append a data event and return its index.
    pub fn append(
        &mut self,
        source: i32,
        source_seq: i64,
        subtype: i16,
        user_data: i32,
        event_time_nanos: i64,
        payload: &[u8],
    ) -> Result<u64> {
        let header = Header::data(
            source,
            source_seq,
            subtype,
            user_data,
            event_time_nanos,
            payload.len(),
        )?;
        self.append_event(&header, payload)
    }

    /// Append a heartbeat for `source`.
    pub fn append_heartbeat(
        &mut self,
        source: i32,
        source_seq: i64,
        heartbeat_seq: i32,
        event_time_nanos: i64,
    ) -> Result<u64> {
        let header = Header::heartbeat(source, source_seq, heartbeat_seq, event_time_nanos)?;
        self.append_event(&header, &[])
    }

    /// Append an admin event.
    pub fn append_admin(
        &mut self,
        source_seq: i64,
        user_data: i32,
        event_time_nanos: i64,
    ) -> Result<u64> {
        let header = Header::admin(source_seq, user_data, event_time_nanos)?;
        self.append_event(&header, &[])
    }

    /// Append an event with a prepared header.
    ///
    /// On failure the message stream is truncated back to where the event
    /// started, so nothing of it is ever observed.
    pub fn append_event(&mut self, header: &Header, payload: &[u8]) -> Result<u64> {
        self.ensure_open()?;
        let start = self.messages.position();
        let result = write_event(&mut self.messages, header, payload)
            .and_then(|entry| self.index.append(&entry));
        if let Err(e) = &result {
            warn!(queue = %self.queue, position = start, error = %e, "Append failed, truncating");
            if let Err(te) = self.messages.truncate_to(start) {
                error!(queue = %self.queue, error = %te, "Failed to truncate after failed append");
            }
        }
        result
    }

    /// Start a batch whose events become visible together on commit.
    pub fn begin_batch(&mut self) -> Result<AppendBatch<'_>> {
        self.ensure_open()?;
        let rewind_to = self.messages.position();
        Ok(AppendBatch {
            appender: self,
            rewind_to,
            entries: Vec::new(),
            done: false,
        })
    }

    /// Index the next appended event gets
    pub fn next_index(&self) -> u64 {
        self.index.next_index()
    }

    /// Name of the queue this appender writes to
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Flush written message pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.messages.flush()
    }

    /// Release the regions and the appender slot.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = self.messages.close().and(self.index.close());
        self.active.store(false, Ordering::Release);
        debug!(queue = %self.queue, "Closed appender");
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Closed("appender"));
        }
        Ok(())
    }
}

impl Drop for IndexedAppender {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(queue = %self.queue, error = %e, "Failed to close appender");
        }
    }
}

fn write_event(
    messages: &mut MessageWriter,
    header: &Header,
    payload: &[u8],
) -> Result<IndexEntry> {
    if header.payload_length as usize != payload.len() {
        return Err(Error::InvalidHeader(format!(
            "header declares {} payload bytes, got {}",
            header.payload_length,
            payload.len()
        )));
    }
    messages
        .start_message()?
        .put_bytes(&header.encode())?
        .put_bytes(payload)?;
    let record = messages.finish_message()?;
    Ok(IndexEntry {
        position: record.position,
        length: (HEADER_LENGTH + payload.len()) as i32,
        source: header.source,
        source_seq: header.source_seq,
        event_time_nanos: header.event_time_nanos,
    })
}

/// Events appended together and published atomically.
///
/// Messages are written as they are appended; their index records are held
/// back until [`commit`](Self::commit). Dropping an uncommitted batch rolls it
/// back.
pub struct AppendBatch<'a> {
    appender: &'a mut IndexedAppender,
    rewind_to: u64,
    entries: Vec<IndexEntry>,
    done: bool,
}

impl std::fmt::Debug for AppendBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendBatch")
            .field("queue", &self.appender.queue)
            .field("len", &self.entries.len())
            .field("done", &self.done)
            .finish()
    }
}

impl AppendBatch<'_> {
    /// Add a data event.
    pub fn append(
        &mut self,
        source: i32,
        source_seq: i64,
        subtype: i16,
        user_data: i32,
        event_time_nanos: i64,
        payload: &[u8],
    ) -> Result<()> {
        let header = Header::data(
            source,
            source_seq,
            subtype,
            user_data,
            event_time_nanos,
            payload.len(),
        )?;
        self.append_event(&header, payload)
    }

    /// Add an event with a prepared header.
    pub fn append_event(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
        if self.done {
            return Err(Error::Closed("append batch"));
        }
        let entry = write_event(&mut self.appender.messages, header, payload)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Number of events in the batch
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing was appended
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish every event of the batch and return their index range, or
    /// `None` if the batch is empty.
    ///
    /// On failure nothing is published and the batch is rolled back.
    pub fn commit(mut self) -> Result<Option<Range<u64>>> {
        let published = self.appender.index.append_all(&self.entries);
        match published {
            Ok(first) => {
                self.done = true;
                Ok(first.map(|first| first..first + self.entries.len() as u64))
            }
            Err(e) => {
                self.rollback_in_place()?;
                Err(e)
            }
        }
    }

    /// Discard the batch.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<()> {
        self.done = true;
        if self.appender.messages.position() == self.rewind_to {
            return Ok(());
        }
        warn!(
            queue = %self.appender.queue,
            events = self.entries.len(),
            position = self.rewind_to,
            "Rolling back append batch"
        );
        self.entries.clear();
        self.appender.messages.truncate_to(self.rewind_to)
    }
}

impl Drop for AppendBatch<'_> {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.rollback_in_place() {
                error!(
                    queue = %self.appender.queue,
                    error = %e,
                    "Failed to roll back append batch"
                );
            }
        }
    }
}
