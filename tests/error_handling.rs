//! Error handling and failure isolation tests.

use pollcast::{
    Channel, ChannelError, ChannelOptions, MemoryBackend, Message, MessageId, MessageInput,
    MessageIter, MessageStore, Result, StoreBackend, StoreError,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Failures to inject into a wrapped store.
#[derive(Default)]
struct Faults {
    /// Remaining reads that will fail.
    failing_reads: AtomicUsize,
    failing_writes: AtomicBool,
    failing_deletes: AtomicBool,
    unavailable: AtomicBool,
    /// Added latency for every full scan.
    scan_delay_ms: AtomicU64,
    active_scans: AtomicUsize,
    max_active_scans: AtomicUsize,
}

/// Memory backend whose stores fail on demand.
struct FlakyBackend {
    inner: MemoryBackend,
    faults: Arc<Faults>,
}

impl FlakyBackend {
    fn new() -> Self {
        Self {
            inner: MemoryBackend::new(),
            faults: Arc::new(Faults::default()),
        }
    }
}

impl StoreBackend for FlakyBackend {
    fn kind(&self) -> &'static str {
        "flaky"
    }

    fn is_available(&self) -> bool {
        !self.faults.unavailable.load(Ordering::SeqCst)
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn MessageStore>> {
        if !self.is_available() {
            return Err(StoreError::Unavailable("disk is gone".into()));
        }
        Ok(Arc::new(FlakyStore {
            inner: self.inner.open(namespace)?,
            faults: Arc::clone(&self.faults),
        }))
    }
}

struct FlakyStore {
    inner: Arc<dyn MessageStore>,
    faults: Arc<Faults>,
}

impl MessageStore for FlakyStore {
    fn append(&self, input: MessageInput) -> Result<MessageId> {
        if self.faults.failing_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("write refused")));
        }
        self.inner.append(input)
    }

    fn read_from(&self, after: MessageId) -> Result<Vec<Message>> {
        let failed = self
            .faults
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StoreError::Io(std::io::Error::other("read refused")));
        }
        self.inner.read_from(after)
    }

    fn scan(&self) -> Result<MessageIter<'_>> {
        let active = self.faults.active_scans.fetch_add(1, Ordering::SeqCst) + 1;
        self.faults.max_active_scans.fetch_max(active, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(
            self.faults.scan_delay_ms.load(Ordering::SeqCst),
        ));
        let result = self.inner.scan();
        self.faults.active_scans.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn delete(&self, id: MessageId) -> Result<()> {
        if self.faults.failing_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("delete refused")));
        }
        self.inner.delete(id)
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

fn options() -> ChannelOptions {
    ChannelOptions::default()
        .with_poll_interval(Duration::from_millis(10))
        .with_gc_probability(0.0)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// --- Open ---

#[test]
fn test_open_failure_is_store_unavailable() {
    let backend = FlakyBackend::new();
    backend.faults.unavailable.store(true, Ordering::SeqCst);

    let result = Channel::open("room", &backend, options());
    match result {
        Err(ChannelError::StoreUnavailable { namespace, source }) => {
            assert!(namespace.starts_with(pollcast::store::NAMESPACE_PREFIX));
            assert!(matches!(source, StoreError::Unavailable(_)));
        }
        other => panic!("expected StoreUnavailable, got {:?}", other.err()),
    }
    assert!(!Channel::can_be_used(&backend));
}

// --- Reads ---

#[test]
fn test_poll_survives_read_failures() {
    init_tracing();
    let backend = FlakyBackend::new();
    let writer = Channel::open("room", &backend, options()).unwrap();
    let reader = Channel::open("room", &backend, options()).unwrap();
    let inbox = reader.subscribe(8);

    backend.faults.failing_reads.store(5, Ordering::SeqCst);
    writer.post(&json!("still arrives")).unwrap();

    let got = inbox.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, json!("still arrives"));
    assert!(reader.stats().read_failures + writer.stats().read_failures >= 5);
    assert!(!reader.is_closed());
}

#[test]
fn test_callback_panic_does_not_stop_polling() {
    init_tracing();
    let backend = MemoryBackend::new();
    let writer = Channel::open("room", &backend, options()).unwrap();
    let reader = Channel::open("room", &backend, options()).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    reader.on_message(move |payload| {
        counter.fetch_add(1, Ordering::SeqCst);
        if payload == json!("boom") {
            panic!("listener failure");
        }
    });

    writer.post(&"boom").unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));
    writer.post(&"fine").unwrap();
    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
}

// --- Writes ---

#[test]
fn test_write_failure_surfaces_to_sender() {
    let backend = FlakyBackend::new();
    let channel = Channel::open("room", &backend, options()).unwrap();

    backend.faults.failing_writes.store(true, Ordering::SeqCst);
    let result = channel.post(&"lost");
    assert!(matches!(result, Err(ChannelError::StoreWriteFailed(_))));

    // The session is still usable
    backend.faults.failing_writes.store(false, Ordering::SeqCst);
    assert_eq!(channel.post(&"kept").unwrap(), MessageId(1));
}

#[test]
fn test_unencodable_payload() {
    use std::collections::HashMap;

    let backend = MemoryBackend::new();
    let channel = Channel::open("room", &backend, options()).unwrap();

    // JSON object keys must be strings
    let mut bad = HashMap::new();
    bad.insert(vec![1u8], 1);
    assert!(matches!(channel.post(&bad), Err(ChannelError::Encode(_))));
}

// --- Garbage collection ---

#[test]
fn test_delete_failures_are_skipped() {
    init_tracing();
    let backend = FlakyBackend::new();
    let options = options().with_retention(Duration::from_millis(1));
    let channel = Channel::open("room", &backend, options).unwrap();

    channel.post(&1).unwrap();
    channel.post(&2).unwrap();
    thread::sleep(Duration::from_millis(20));

    backend.faults.failing_deletes.store(true, Ordering::SeqCst);
    let report = channel.collect_garbage().unwrap();
    assert_eq!(report.expired, 2);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed, 2);
    assert_eq!(channel.messages().unwrap().len(), 2);

    backend.faults.failing_deletes.store(false, Ordering::SeqCst);
    let report = channel.collect_garbage().unwrap();
    assert_eq!(report.deleted, 2);
    assert!(channel.messages().unwrap().is_empty());
}

#[test]
fn test_background_gc_failure_does_not_fail_send() {
    init_tracing();
    let backend = FlakyBackend::new();
    let options = options()
        .with_retention(Duration::from_millis(1))
        .with_gc_probability(1.0);
    let channel = Channel::open("room", &backend, options).unwrap();

    backend.faults.failing_deletes.store(true, Ordering::SeqCst);
    for n in 0..5 {
        assert!(channel.post(&n).is_ok());
        thread::sleep(Duration::from_millis(5));
    }

    assert!(wait_until(|| {
        let stats = channel.stats();
        stats.gc_runs + stats.gc_coalesced == 5
    }));
    assert_eq!(channel.stats().gc_deleted, 0);
}

#[test]
fn test_send_burst_runs_one_collection_at_a_time() {
    init_tracing();
    let backend = FlakyBackend::new();
    backend.faults.scan_delay_ms.store(50, Ordering::SeqCst);
    let options = options().with_gc_probability(1.0);
    let channel = Channel::open("room", &backend, options).unwrap();

    for n in 0..20 {
        channel.post(&n).unwrap();
    }

    // Every request either ran or was merged into a pending one
    assert!(wait_until(|| {
        let stats = channel.stats();
        stats.gc_runs + stats.gc_coalesced == 20
    }));
    let stats = channel.stats();
    assert!(stats.gc_coalesced > 0);
    assert!(stats.gc_runs < 20);
    assert_eq!(backend.faults.max_active_scans.load(Ordering::SeqCst), 1);
}

#[test]
fn test_close_waits_for_running_collection() {
    let backend = FlakyBackend::new();
    backend.faults.scan_delay_ms.store(50, Ordering::SeqCst);
    let options = options().with_gc_probability(1.0);
    let channel = Channel::open("room", &backend, options).unwrap();

    channel.post(&1).unwrap();
    assert!(wait_until(|| backend.faults.active_scans.load(Ordering::SeqCst) == 1));
    channel.close();

    assert_eq!(backend.faults.active_scans.load(Ordering::SeqCst), 0);
    assert!(matches!(channel.post(&2), Err(ChannelError::Closed)));
}
