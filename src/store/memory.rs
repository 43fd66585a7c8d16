//! Process-local message logs.

use super::{MessageIter, MessageStore, StoreBackend};
use crate::error::{Result, StoreError};
use crate::types::{Message, MessageId, MessageInput};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared log contents for one namespace.
#[derive(Default)]
struct MemoryLog {
    messages: RwLock<BTreeMap<MessageId, Message>>,
    /// Last assigned id. Survives deletes so ids are never reused.
    last_id: Mutex<MessageId>,
}

/// Backend keeping every namespace in memory.
///
/// Channels opened through the same backend with the same namespace see
/// the same log, like tabs sharing one origin's database.
#[derive(Default)]
pub struct MemoryBackend {
    logs: Mutex<HashMap<String, Arc<MemoryLog>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of namespaces opened so far.
    pub fn namespace_count(&self) -> usize {
        self.logs.lock().len()
    }
}

impl StoreBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn open(&self, namespace: &str) -> Result<Arc<dyn MessageStore>> {
        let log = Arc::clone(self.logs.lock().entry(namespace.to_string()).or_default());
        Ok(Arc::new(MemoryStore {
            log,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Handle to an in-memory log.
pub struct MemoryStore {
    log: Arc<MemoryLog>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl MessageStore for MemoryStore {
    fn append(&self, input: MessageInput) -> Result<MessageId> {
        self.ensure_open()?;

        // Hold the id lock across the insert so ids land in order.
        let mut last_id = self.log.last_id.lock();
        let id = last_id.next();
        self.log
            .messages
            .write()
            .insert(id, input.into_message(id));
        *last_id = id;

        Ok(id)
    }

    fn read_from(&self, after: MessageId) -> Result<Vec<Message>> {
        self.ensure_open()?;
        Ok(self
            .log
            .messages
            .read()
            .range(after.next()..)
            .map(|(_, message)| message.clone())
            .collect())
    }

    fn scan(&self) -> Result<MessageIter<'_>> {
        self.ensure_open()?;

        let ids: Vec<MessageId> = self.log.messages.read().keys().copied().collect();
        let log = Arc::clone(&self.log);

        // Entries deleted after the snapshot are skipped.
        Ok(Box::new(ids.into_iter().filter_map(move |id| {
            log.messages.read().get(&id).cloned().map(Ok)
        })))
    }

    fn delete(&self, id: MessageId) -> Result<()> {
        self.ensure_open()?;
        self.log.messages.write().remove(&id);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
