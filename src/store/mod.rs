//! Message log storage.
//!
//! A channel talks to its log only through two traits:
//! - [`StoreBackend`] opens (or creates) the log for a namespace
//! - [`MessageStore`] is the open handle: append, read ahead of a cursor,
//!   scan in id order, delete by id, close
//!
//! Two backends are provided. [`MemoryBackend`] shares logs between
//! channels of one process. [`FileBackend`] keeps one log file per
//! namespace and lets separate processes share it.

mod file;
mod memory;

pub use file::{FileBackend, FileStore, MAX_PAYLOAD_LEN};
pub use memory::{MemoryBackend, MemoryStore};

use crate::error::Result;
use crate::types::{Message, MessageId, MessageInput};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Prefix shared by every channel namespace.
pub const NAMESPACE_PREFIX: &str = "broadcast-channel-0-";

/// Derive the storage namespace for a channel name.
///
/// Names are hashed so any channel name maps to a filesystem-safe key.
pub fn namespace_for(channel: &str) -> String {
    let digest = Sha256::digest(channel.as_bytes());
    format!("{}{}", NAMESPACE_PREFIX, hex::encode(&digest[..16]))
}

/// Lazy sequence of messages in ascending id order.
pub type MessageIter<'a> = Box<dyn Iterator<Item = Result<Message>> + Send + 'a>;

/// Outcome of a compaction pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Live messages kept.
    pub live: usize,
    /// Deleted entries found.
    pub dead: usize,
    /// Bytes freed on disk.
    pub bytes_freed: u64,
    /// Whether the log was rewritten.
    pub rewritten: bool,
}

/// An open message log.
pub trait MessageStore: Send + Sync {
    /// Append a message, returning its newly assigned id.
    fn append(&self, input: MessageInput) -> Result<MessageId>;

    /// All messages with an id greater than `after`. Order is unspecified.
    fn read_from(&self, after: MessageId) -> Result<Vec<Message>>;

    /// Every message, ascending by id.
    fn scan(&self) -> Result<MessageIter<'_>>;

    /// Delete a message. Deleting an absent id succeeds.
    fn delete(&self, id: MessageId) -> Result<()>;

    /// Reclaim space held by deleted messages.
    fn compact(&self) -> Result<CompactionStats> {
        Ok(CompactionStats::default())
    }

    /// Release the handle. Later calls fail with `StoreError::Closed`.
    fn close(&self) -> Result<()>;
}

/// Opens message logs by namespace.
pub trait StoreBackend: Send + Sync {
    /// Short backend name.
    fn kind(&self) -> &'static str;

    /// Whether logs can be opened in this environment.
    fn is_available(&self) -> bool;

    /// Open the log for `namespace`, creating it on first use.
    fn open(&self, namespace: &str) -> Result<Arc<dyn MessageStore>>;
}
