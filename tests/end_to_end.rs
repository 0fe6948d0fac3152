//! End-to-end: producer thread, pipeline step loop and consumer thread
//!
//! The producer appends to the upstream queue through its own queue handle,
//! the main thread drives the pipeline, and a consumer thread follows the
//! downstream queue. Every upstream event is split into two downstream events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;
use tributary::{EventPipeline, IndexedQueue, PollerOptions, QueueConfig};

const EVENTS: i64 = 2_000;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[test]
fn test_producer_pipeline_consumer() {
    init_logging();
    let dir = tempdir().unwrap();
    let config = QueueConfig::for_testing();
    config
        .write_to_file(&dir.path().join(tributary::CONFIG_FILE_NAME))
        .unwrap();

    let mut pipeline = EventPipeline::builder(dir.path())
        .open(|event, downstream| {
            let (left, right) = event.payload.split_at(event.payload.len() / 2);
            downstream.append(0, 0, left)?;
            downstream.append(1, 0, right)
        })
        .unwrap();

    let producer_dir = dir.path().to_path_buf();
    let producer = thread::spawn(move || {
        let upstream = IndexedQueue::open(&producer_dir, "upstream", &config).unwrap();
        let mut appender = upstream.appender().unwrap();
        for seq in 1..=EVENTS {
            let payload = format!("left-{:06}right-{:06}", seq, seq);
            appender.append(3, seq, 0, 0, seq * 1_000, payload.as_bytes()).unwrap();
        }
    });

    let finished = Arc::new(AtomicBool::new(false));
    let consumer_finished = finished.clone();
    let mut poller = pipeline.create_poller(PollerOptions::new());
    let consumer = thread::spawn(move || {
        let mut parts = Vec::new();
        loop {
            let done = consumer_finished.load(Ordering::Acquire);
            let n = poller
                .poll(|event| {
                    parts.push((
                        event.header.source_seq,
                        event.header.subtype,
                        String::from_utf8(event.payload.to_vec()).unwrap(),
                    ));
                    Ok(())
                })
                .unwrap();
            if n == 0 {
                if done {
                    return parts;
                }
                thread::yield_now();
            }
        }
    });

    let mut processed = 0;
    while processed < EVENTS {
        if pipeline.processor_step().unwrap() == 0 {
            thread::yield_now();
        } else {
            processed += 1;
        }
    }
    producer.join().unwrap();
    finished.store(true, Ordering::Release);

    let parts = consumer.join().unwrap();
    assert_eq!(parts.len(), 2 * EVENTS as usize);
    for (i, (seq, subtype, text)) in parts.iter().enumerate() {
        let expected_seq = i as i64 / 2 + 1;
        assert_eq!(*seq, expected_seq);
        assert_eq!(*subtype, (i % 2) as i16);
        let expected = if i % 2 == 0 {
            format!("left-{:06}", expected_seq)
        } else {
            format!("right-{:06}", expected_seq)
        };
        assert_eq!(text, &expected);
    }

    let state = pipeline.downstream_state();
    assert_eq!(state.lock().source_seq_of(3), EVENTS);
    pipeline.close().unwrap();
}
