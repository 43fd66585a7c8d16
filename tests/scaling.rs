//! Scaling tests with many messages and sessions.
//!
//! Measures the operations that grow with the log:
//! - Appending to and reopening a large log
//! - Incremental reads from a cursor
//! - Collection of a long expired prefix, plus compaction
//! - Fan-out across several sessions

use parking_lot::Mutex;
use pollcast::{
    namespace_for, Channel, ChannelOptions, FileBackend, FileStore, MessageId, MessageInput,
    MessageStore, SessionId, StoreBackend, Timestamp,
};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MESSAGE_COUNT: usize = 10_000;

/// Timing helper
struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    fn new(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    fn report(&self) {
        println!("  {} took {:.2}ms", self.name, self.elapsed_ms());
    }

    fn report_with_count(&self, count: usize) {
        let ms = self.elapsed_ms();
        let per_sec = if ms > 0.0 { count as f64 / (ms / 1000.0) } else { 0.0 };
        println!(
            "  {} took {:.2}ms ({} items, {:.0} items/sec)",
            self.name, ms, count, per_sec
        );
    }
}

fn input(n: usize, at: Timestamp) -> MessageInput {
    let body = json!({"index": n, "data": format!("message body {}", n)});
    MessageInput::json(SessionId::from("writer"), serde_json::to_vec(&body).unwrap()).at(at)
}

// =============================================================================
// Large log: append, reopen, read from cursor
// =============================================================================

#[test]
fn test_scaling_large_log() {
    println!("\n=== {} messages, one log ===", MESSAGE_COUNT);

    let dir = TempDir::new().unwrap();
    let log_dir = dir.path().join(namespace_for("large"));

    let store = FileStore::open(&log_dir, FileBackend::DEFAULT_SYNC_INTERVAL).unwrap();
    let now = Timestamp::now();

    let timer = Timer::new("Append");
    for n in 0..MESSAGE_COUNT {
        store.append(input(n, now)).unwrap();
    }
    timer.report_with_count(MESSAGE_COUNT);
    println!("  Log size: {} bytes", store.size().unwrap());
    store.close().unwrap();

    let timer = Timer::new("Reopen (rebuild index)");
    let store = FileStore::open(&log_dir, FileBackend::DEFAULT_SYNC_INTERVAL).unwrap();
    timer.report();
    assert_eq!(store.len().unwrap(), MESSAGE_COUNT);

    // A cursor near the tail only reads the tail
    let timer = Timer::new("Read last 100 from cursor");
    let tail = store
        .read_from(MessageId((MESSAGE_COUNT - 100) as u64))
        .unwrap();
    timer.report_with_count(tail.len());
    assert_eq!(tail.len(), 100);
    assert_eq!(tail[0].id, MessageId((MESSAGE_COUNT - 99) as u64));

    let timer = Timer::new("Full scan");
    let scanned = store.scan().unwrap().filter(|m| m.is_ok()).count();
    timer.report_with_count(scanned);
    assert_eq!(scanned, MESSAGE_COUNT);

    // New ids continue after the reopen
    let next = store.append(input(MESSAGE_COUNT, now)).unwrap();
    assert_eq!(next, MessageId(MESSAGE_COUNT as u64 + 1));
}

// =============================================================================
// Collection of a long expired prefix
// =============================================================================

#[test]
fn test_scaling_collect_expired_prefix() {
    println!("\n=== Collect expired prefix ===");

    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path().join("gc"), FileBackend::DEFAULT_SYNC_INTERVAL).unwrap();

    let old = Timestamp::now().saturating_sub(Duration::from_secs(600));
    let fresh = Timestamp::now();
    let expired = MESSAGE_COUNT / 2;

    for n in 0..MESSAGE_COUNT {
        let at = if n < expired { old } else { fresh };
        store.append(input(n, at)).unwrap();
    }
    let size_before = store.size().unwrap();

    let timer = Timer::new("Collect and compact");
    let report = pollcast::collect_expired(&store, Duration::from_secs(60)).unwrap();
    timer.report_with_count(report.deleted);

    assert_eq!(report.expired, expired);
    assert_eq!(report.deleted, expired);
    assert_eq!(report.failed, 0);
    assert!(report.compaction.unwrap().rewritten);
    assert!(store.size().unwrap() < size_before);
    assert_eq!(store.len().unwrap(), MESSAGE_COUNT - expired);

    // Nothing left to collect
    let again = pollcast::collect_expired(&store, Duration::from_secs(60)).unwrap();
    assert_eq!(again.expired, 0);
}

// =============================================================================
// Fan-out across sessions
// =============================================================================

#[test]
fn test_scaling_fanout() {
    const SESSIONS: usize = 5;
    const PER_SESSION: usize = 50;
    println!("\n=== {} sessions x {} messages ===", SESSIONS, PER_SESSION);

    let dir = TempDir::new().unwrap();
    let backend = FileBackend::new(dir.path());
    let options = ChannelOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_gc_probability(0.0);

    let channels: Vec<Channel> = (0..SESSIONS)
        .map(|_| Channel::open("fanout", &backend, options.clone()).unwrap())
        .collect();
    let inboxes: Vec<Arc<Mutex<Vec<serde_json::Value>>>> = channels
        .iter()
        .map(|channel| {
            let received = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&received);
            channel.on_message(move |payload| sink.lock().push(payload));
            received
        })
        .collect();

    let timer = Timer::new("Concurrent sends");
    thread::scope(|scope| {
        for (i, channel) in channels.iter().enumerate() {
            scope.spawn(move || {
                for n in 0..PER_SESSION {
                    channel.post(&json!({"from": i, "n": n})).unwrap();
                }
            });
        }
    });
    timer.report_with_count(SESSIONS * PER_SESSION);

    let expected = (SESSIONS - 1) * PER_SESSION;
    let timer = Timer::new("Delivery to every session");
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline && inboxes.iter().any(|inbox| inbox.lock().len() < expected) {
        thread::sleep(Duration::from_millis(10));
    }
    timer.report();

    for (i, inbox) in inboxes.iter().enumerate() {
        let received = inbox.lock();
        assert_eq!(received.len(), expected, "session {}", i);
        assert!(received.iter().all(|p| p["from"] != json!(i)));
    }

    let raw = backend.open(&namespace_for("fanout")).unwrap();
    assert_eq!(raw.read_from(MessageId(0)).unwrap().len(), SESSIONS * PER_SESSION);
}
