//! Poller behaviour tests
//!
//! Skip permanence, pause transience, hooks, repositioning and concurrent
//! readers following a live writer.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use tributary_engine::{
    Error, EventProcessingState, EventType, IndexedQueue, PollPolicy, PollerOptions, QueueConfig,
    StateTracking, MAX_INDEX,
};

fn open_queue(dir: &std::path::Path) -> IndexedQueue {
    IndexedQueue::open(dir, "events", &QueueConfig::for_testing()).unwrap()
}

fn seq_payload(seq: i64) -> Vec<u8> {
    seq.to_le_bytes().to_vec()
}

#[test]
fn test_skip_is_permanent_and_pause_is_transient() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    for seq in 1..=6 {
        appender.append(1, seq, 0, 0, seq * 10, &seq_payload(seq)).unwrap();
    }

    let paused = Arc::new(AtomicBool::new(true));
    let pause_flag = paused.clone();
    let mut poller = queue.poller(
        PollerOptions::new()
            .with_skip(|_, entry| entry.source_seq == 2 || entry.source_seq == 4)
            .with_pause(move |_, entry| {
                entry.source_seq == 3 && pause_flag.load(Ordering::Acquire)
            }),
    );

    let mut dispatched = Vec::new();
    let mut poll = |poller: &mut tributary_engine::IndexedPoller| {
        poller
            .poll(|event| {
                dispatched.push(event.header.source_seq);
                Ok(())
            })
            .unwrap()
    };

    assert_eq!(poll(&mut poller), 1); // 1
    assert_eq!(poll(&mut poller), 0); // 2 skipped
    assert_eq!(poller.current_index(), 2);
    for _ in 0..5 {
        assert_eq!(poll(&mut poller), 0); // 3 paused
        assert_eq!(poller.current_index(), 2);
    }

    paused.store(false, Ordering::Release);
    assert_eq!(poll(&mut poller), 1); // 3
    assert_eq!(poll(&mut poller), 0); // 4 skipped
    assert_eq!(poll(&mut poller), 1); // 5
    assert_eq!(poll(&mut poller), 1); // 6
    assert_eq!(poll(&mut poller), 0); // nothing published
    assert_eq!(poller.current_index(), 6);

    // Skipped records never come back
    appender.append(1, 7, 0, 0, 70, &seq_payload(7)).unwrap();
    assert_eq!(poll(&mut poller), 1);
    drop(poll);
    assert_eq!(dispatched, vec![1, 3, 5, 6, 7]);
}

#[test]
fn test_hooks_surround_consumer() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    appender.append(3, 1, 0, 0, 0, b"x").unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let (before_log, after_log) = (log.clone(), log.clone());
    let mut poller = queue.poller(
        PollerOptions::new()
            .with_before_dispatch(move |index, _| {
                before_log.lock().push(format!("before {}", index))
            })
            .with_after_dispatch(move |index, _| {
                after_log.lock().push(format!("after {}", index))
            }),
    );

    poller
        .poll(|event| {
            log.lock().push(format!("consume {}", event.index));
            Ok(())
        })
        .unwrap();
    assert_eq!(*log.lock(), vec!["before 0", "consume 0", "after 0"]);
}

#[test]
fn test_failing_consumer_does_not_advance() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    appender.append(1, 1, 0, 0, 0, b"retry me").unwrap();

    let after_calls = Arc::new(AtomicU64::new(0));
    let counter = after_calls.clone();
    let mut poller = queue.poller(PollerOptions::new().with_after_dispatch(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let err = poller
        .poll(|_| Err(Error::transform("not now")))
        .unwrap_err();
    assert!(matches!(err, Error::Transform(_)));
    assert_eq!(poller.current_index(), 0);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0);

    let mut payload = Vec::new();
    assert_eq!(
        poller
            .poll(|event| {
                payload.extend_from_slice(event.payload);
                Ok(())
            })
            .unwrap(),
        1
    );
    assert_eq!(payload, b"retry me");
    assert_eq!(after_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_independent_pollers_and_next_index() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    for seq in 1..=5 {
        appender.append(1, seq, 0, 0, 0, &seq_payload(seq)).unwrap();
    }

    let mut a = queue.poller(PollerOptions::new());
    let mut b = queue.poller(PollerOptions::new());
    let mut seen_a = Vec::new();
    while a
        .poll(|e| {
            seen_a.push(e.header.source_seq);
            Ok(())
        })
        .unwrap()
        > 0
    {}
    assert_eq!(seen_a, vec![1, 2, 3, 4, 5]);
    assert_eq!(b.current_index(), 0);

    let mut seen_b = Vec::new();
    b.next_index(3);
    while b
        .poll(|e| {
            seen_b.push(e.header.source_seq);
            Ok(())
        })
        .unwrap()
        > 0
    {}
    assert_eq!(seen_b, vec![4, 5]);

    a.next_index(0);
    let mut first = None;
    a.poll(|e| {
        first = Some(e.index);
        Ok(())
    })
    .unwrap();
    assert_eq!(first, Some(0));

    // The unit policy dispatches everything
    let mut c = queue.poller_with(());
    let mut count = 0;
    while c
        .poll(|_| {
            count += 1;
            Ok(())
        })
        .unwrap()
        > 0
    {}
    assert_eq!(count, 5);
}

#[test]
fn test_event_types_round_trip_through_queue() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    appender.append(1, 1, 5, 42, 100, b"data").unwrap();
    appender.append_heartbeat(1, 2, 9, 200).unwrap();
    appender.append_admin(1, 7, 300).unwrap();

    let mut poller = queue.poller(PollerOptions::new());
    let mut events = Vec::new();
    while poller
        .poll(|e| {
            events.push((
                e.header.event_type,
                e.header.subtype,
                e.header.user_data,
                e.payload.len(),
            ));
            Ok(())
        })
        .unwrap()
        > 0
    {}
    assert_eq!(
        events,
        vec![
            (EventType::Data, 5, 42, 4),
            (EventType::Heartbeat, 0, 9, 0),
            (EventType::Admin, 0, 7, 0),
        ]
    );
}

#[test]
fn test_large_payload_spanning_regions() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    appender.append(1, 1, 0, 0, 0, &payload).unwrap();

    let mut poller = queue.poller(PollerOptions::new());
    let mut read = Vec::new();
    poller
        .poll(|e| {
            read.extend_from_slice(e.payload);
            Ok(())
        })
        .unwrap();
    assert_eq!(read, payload);
}

#[test]
fn test_state_tracking_through_borrowed_policy() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let mut appender = queue.appender().unwrap();
    appender.append(4, 10, 0, 0, 1_000, b"a").unwrap();
    appender.append(5, 20, 0, 0, 2_000, b"b").unwrap();

    let state = Arc::new(Mutex::new(EventProcessingState::default()));
    let mut tracking = StateTracking::new().after(state.clone());
    {
        let mut poller = queue.poller_with(&mut tracking);
        while poller.poll(|_| Ok(())).unwrap() > 0 {}
    }
    let state = state.lock();
    assert_eq!(state.id(), 1);
    assert_eq!(state.source(), 5);
    assert_eq!(state.source_seq_of(4), 10);
    assert_eq!(state.event_time_nanos(), 2_000);
}

/// Policy counting how often each decision is asked for.
#[derive(Default)]
struct CountingPolicy {
    pauses: Arc<AtomicU64>,
}

impl PollPolicy for CountingPolicy {
    fn pause(&self, _index: u64, _entry: &tributary_engine::IndexEntry) -> bool {
        self.pauses.fetch_add(1, Ordering::SeqCst) < 3
    }
}

#[test]
fn test_pause_reevaluated_every_call() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    queue.appender().unwrap().append(1, 1, 0, 0, 0, b"x").unwrap();

    let mut poller = queue.poller_with(CountingPolicy::default());
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 0);
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 0);
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 0);
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 1);
    assert_eq!(poller.policy().pauses.load(Ordering::SeqCst), 4);
}

#[test]
fn test_concurrent_reader_sees_complete_payloads() {
    let dir = tempdir().unwrap();
    let queue = Arc::new(open_queue(dir.path()));
    let count = 3_000i64;

    let writer_queue = queue.clone();
    let producer = thread::spawn(move || {
        let mut appender = writer_queue.appender().unwrap();
        for seq in 1..=count {
            let len = (seq % 500) as usize + 1;
            let payload: Vec<u8> = (0..len).map(|i| (seq as usize + i) as u8).collect();
            appender.append(2, seq, 0, len as i32, 0, &payload).unwrap();
        }
    });

    let readers: Vec<_> = (0..2)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut poller = queue.poller(PollerOptions::new());
                let mut expected = 1i64;
                while expected <= count {
                    let n = poller
                        .poll(|e| {
                            assert_eq!(e.header.source_seq, expected);
                            assert_eq!(e.payload.len(), e.header.user_data as usize);
                            for (i, b) in e.payload.iter().enumerate() {
                                assert_eq!(*b, (expected as usize + i) as u8);
                            }
                            Ok(())
                        })
                        .unwrap();
                    if n == 0 {
                        thread::yield_now();
                    } else {
                        expected += 1;
                    }
                }
            })
        })
        .collect();

    producer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(queue.size().unwrap(), count as u64);
}

fn index_file_len(dir: &std::path::Path) -> u64 {
    std::fs::metadata(dir.join("events.idx")).unwrap().len()
}

#[test]
fn test_next_index_past_end_does_not_grow_index() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    let before = index_file_len(dir.path());

    let mut poller = queue.poller(PollerOptions::new());
    poller.next_index(10_000_000);
    for _ in 0..3 {
        assert_eq!(poller.poll(|_| Ok(())).unwrap(), 0);
    }
    assert_eq!(poller.current_index(), 10_000_000);
    assert_eq!(index_file_len(dir.path()), before);

    // Back in range the poller sees events appended meanwhile
    queue.appender().unwrap().append(1, 1, 0, 0, 0, b"x").unwrap();
    poller.next_index(0);
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 1);
}

#[test]
fn test_next_index_beyond_addressable_range_fails_poll() {
    let dir = tempdir().unwrap();
    let queue = open_queue(dir.path());
    queue.appender().unwrap().append(1, 1, 0, 0, 0, b"x").unwrap();
    let before = index_file_len(dir.path());

    let mut poller = queue.poller(PollerOptions::new());
    for far in [1u64 << 59, MAX_INDEX + 1, u64::MAX] {
        poller.next_index(far);
        let mut dispatched = false;
        let err = poller
            .poll(|_| {
                dispatched = true;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, Error::IndexOutOfRange(n) if n == far));
        assert!(err.is_usage_error());
        assert!(!dispatched);
        assert_eq!(poller.current_index(), far);
    }
    assert_eq!(index_file_len(dir.path()), before);

    poller.next_index(0);
    assert_eq!(poller.poll(|_| Ok(())).unwrap(), 1);
}
