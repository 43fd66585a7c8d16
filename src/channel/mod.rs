//! Broadcast channels over a shared message log.
//!
//! Every participant opens its own [`Channel`] on the same name. Sends
//! append to the log; each channel's poll thread reads forward from its
//! cursor and hands other participants' messages to the registered
//! callback. There is no push notification: new messages surface on the
//! next poll.
//!
//! # Example
//!
//! ```ignore
//! let backend = FileBackend::new("/tmp/pollcast");
//! let a = Channel::open("updates", &backend, ChannelOptions::default())?;
//! let b = Channel::open("updates", &backend, ChannelOptions::default())?;
//!
//! let inbox = b.subscribe(64);
//! a.post(&json!({"hello": "world"}))?;
//!
//! let payload = inbox.recv_timeout(Duration::from_secs(1))?;
//! ```

mod poll;
mod receiver;
mod session;

pub use receiver::MessageReceiver;
pub use session::{DeliveredSet, MessageCallback, SessionState};

use crate::config::ChannelOptions;
use crate::error::{ChannelError, ChannelResult};
use crate::gc::{self, GcReport};
use crate::store::{namespace_for, MessageStore, StoreBackend};
use crate::types::{Message, MessageId, MessageInput, SessionId, Timestamp};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use poll::Control;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Counters for one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Poll iterations started.
    pub polls: u64,
    /// Callback invocations.
    pub delivered: u64,
    /// Poll iterations whose read failed.
    pub read_failures: u64,
    /// Completed collection passes.
    pub gc_runs: u64,
    /// Messages deleted by collection.
    pub gc_deleted: u64,
    /// Collection requests merged into one already pending.
    pub gc_coalesced: u64,
}

#[derive(Default)]
struct StatsCounters {
    polls: AtomicU64,
    delivered: AtomicU64,
    read_failures: AtomicU64,
    gc_runs: AtomicU64,
    gc_deleted: AtomicU64,
    gc_coalesced: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            polls: self.polls.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            gc_runs: self.gc_runs.load(Ordering::Relaxed),
            gc_deleted: self.gc_deleted.load(Ordering::Relaxed),
            gc_coalesced: self.gc_coalesced.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a channel and its worker threads.
pub(crate) struct Shared {
    name: String,
    session_id: SessionId,
    options: ChannelOptions,
    store: Arc<dyn MessageStore>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
    stats: StatsCounters,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn collect_garbage(&self) -> ChannelResult<GcReport> {
        let report = gc::collect_expired(&*self.store, self.options.retention())?;

        self.stats.gc_runs.fetch_add(1, Ordering::Relaxed);
        self.stats
            .gc_deleted
            .fetch_add(report.deleted as u64, Ordering::Relaxed);

        debug!(
            channel = %self.name,
            expired = report.expired,
            deleted = report.deleted,
            failed = report.failed,
            "collected expired messages"
        );
        Ok(report)
    }
}

/// One participant's handle to a named channel.
pub struct Channel {
    shared: Arc<Shared>,
    namespace: String,
    control: Sender<Control>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    /// Wakes the collection worker. Dropped on close to stop it.
    gc_trigger: Mutex<Option<Sender<()>>>,
    gc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Open `name` on `backend` and start polling.
    ///
    /// Fails with [`ChannelError::StoreUnavailable`] if the log cannot be
    /// opened or created.
    pub fn open<B>(name: &str, backend: &B, options: ChannelOptions) -> ChannelResult<Self>
    where
        B: StoreBackend + ?Sized,
    {
        options.validate()?;

        let namespace = namespace_for(name);
        let store = backend
            .open(&namespace)
            .map_err(|source| ChannelError::StoreUnavailable {
                namespace: namespace.clone(),
                source,
            })?;

        let session_id = SessionId::random();
        let state = SessionState::new(options.dedup_capacity, options.dedup_ttl());

        let shared = Arc::new(Shared {
            name: name.to_string(),
            session_id: session_id.clone(),
            options,
            store,
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
            stats: StatsCounters::default(),
        });

        // One pending request is enough: later triggers fold into it.
        let (gc_trigger, gc_requests) = bounded(1);
        let worker = Arc::clone(&shared);
        let gc_handle = match thread::Builder::new()
            .name(format!("pollcast-gc-{}", session_id))
            .spawn(move || run_collector(worker, gc_requests))
        {
            Ok(handle) => handle,
            Err(e) => {
                let _ = shared.store.close();
                return Err(ChannelError::Spawn(e));
            }
        };

        let (control, receiver) = unbounded();
        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("pollcast-poll-{}", session_id))
            .spawn(move || poll::run(worker, receiver));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                drop(gc_trigger);
                let _ = gc_handle.join();
                let _ = shared.store.close();
                return Err(ChannelError::Spawn(e));
            }
        };

        debug!(
            channel = name,
            session = %session_id,
            backend = backend.kind(),
            "opened channel"
        );

        Ok(Self {
            shared,
            namespace,
            control,
            poll_thread: Mutex::new(Some(handle)),
            gc_trigger: Mutex::new(Some(gc_trigger)),
            gc_thread: Mutex::new(Some(gc_handle)),
        })
    }

    /// Whether `backend` can host channels here.
    pub fn can_be_used<B>(backend: &B) -> bool
    where
        B: StoreBackend + ?Sized,
    {
        backend.is_available()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Storage namespace derived from the name.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// This participant's sender token.
    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.shared.options
    }

    /// Highest message id this session has scanned.
    pub fn last_seen_id(&self) -> MessageId {
        self.shared.state.lock().last_seen()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn stats(&self) -> ChannelStats {
        self.shared.stats.snapshot()
    }

    /// Append `payload` for every other participant.
    ///
    /// A successful send may also request a background collection pass,
    /// with the configured probability. That pass never affects the result,
    /// and requests made while one is pending are merged into it.
    pub fn post<T>(&self, payload: &T) -> ChannelResult<MessageId>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let input = MessageInput::encode(
            self.shared.session_id.clone(),
            payload,
            self.shared.options.encoding,
        )?;
        let id = self
            .shared
            .store
            .append(input)
            .map_err(ChannelError::StoreWriteFailed)?;

        if gc::should_collect(self.shared.options.gc_probability) {
            self.request_collection();
        }

        Ok(id)
    }

    /// Register `callback` for messages sent from now on.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        self.on_message_since(callback, Timestamp::now());
    }

    /// Register `callback` for messages stamped at or after `since`.
    ///
    /// Replaces any previous callback and reads immediately rather than
    /// waiting for the next interval. Messages the cursor already passed
    /// are not replayed.
    pub fn on_message_since<F>(&self, callback: F, since: Timestamp)
    where
        F: Fn(serde_json::Value) + Send + Sync + 'static,
    {
        self.shared.state.lock().register(Arc::new(callback), since);
        let _ = self.control.send(Control::Wake);
    }

    /// Stop delivering. Polling continues and still advances the cursor.
    pub fn remove_listener(&self) {
        self.shared.state.lock().clear_callback();
    }

    /// Deliver into a bounded queue instead of a callback.
    ///
    /// Replaces the current callback.
    pub fn subscribe(&self, buffer_size: usize) -> MessageReceiver {
        let (sender, receiver) = bounded(buffer_size.max(1));
        let channel = self.shared.name.clone();

        self.on_message(move |payload| {
            if let Err(TrySendError::Full(_)) = sender.try_send(payload) {
                warn!(channel = %channel, "receiver buffer full, dropping message");
            }
        });

        MessageReceiver { receiver }
    }

    /// Every message currently in the log, ascending by id.
    pub fn messages(&self) -> ChannelResult<Vec<Message>> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let iter = self
            .shared
            .store
            .scan()
            .map_err(ChannelError::StoreReadFailed)?;
        iter.collect::<Result<Vec<_>, _>>()
            .map_err(ChannelError::StoreReadFailed)
    }

    /// Run a collection pass now and wait for it.
    pub fn collect_garbage(&self) -> ChannelResult<GcReport> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.shared.collect_garbage()
    }

    fn request_collection(&self) {
        let guard = self.gc_trigger.lock();
        let Some(trigger) = guard.as_ref() else {
            return;
        };
        match trigger.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => {
                self.shared.stats.gc_coalesced.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(())) => {
                warn!(channel = %self.shared.name, "collection worker is gone");
            }
        }
    }

    /// Stop polling and release the store.
    ///
    /// An iteration already running finishes, but no callback is invoked
    /// after this returns. Calling it again does nothing.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.control.send(Control::Close);
        self.gc_trigger.lock().take();

        if let Some(handle) = self.poll_thread.lock().take() {
            // Closing from inside a callback runs on the poll thread itself.
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(channel = %self.shared.name, "poll loop panicked");
            }
        }
        if let Some(handle) = self.gc_thread.lock().take() {
            if handle.join().is_err() {
                warn!(channel = %self.shared.name, "collection worker panicked");
            }
        }

        if let Err(e) = self.shared.store.close() {
            warn!(channel = %self.shared.name, error = %e, "failed to close store");
        }

        debug!(channel = %self.shared.name, session = %self.shared.session_id, "closed channel");
    }
}

/// Run one collection pass per request until the trigger is dropped.
fn run_collector(shared: Arc<Shared>, requests: Receiver<()>) {
    for () in requests.iter() {
        if shared.is_closed() {
            break;
        }
        if let Err(e) = shared.collect_garbage() {
            warn!(channel = %shared.name, error = %e, "garbage collection failed");
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
