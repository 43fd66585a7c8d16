//! Error types for the message log and channels.

use crate::types::MessageId;
use thiserror::Error;

/// Errors raised by a message store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store handle is closed")]
    Closed,

    /// Another process died mid-compaction; the journal must be replayed.
    #[error("Log compaction was interrupted")]
    CompactionInterrupted,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The backing log could not be opened. Fatal to channel creation.
    #[error("Store unavailable for {namespace}: {source}")]
    StoreUnavailable {
        namespace: String,
        #[source]
        source: StoreError,
    },

    /// One poll iteration could not read the log.
    #[error("Failed to read messages: {0}")]
    StoreReadFailed(#[source] StoreError),

    /// A send could not append its message.
    #[error("Failed to write message: {0}")]
    StoreWriteFailed(#[source] StoreError),

    /// The collector could not delete one expired message.
    #[error("Failed to delete message {id}: {source}")]
    StoreDeleteFailed {
        id: MessageId,
        #[source]
        source: StoreError,
    },

    #[error("Failed to encode payload: {0}")]
    Encode(String),

    #[error("Failed to start worker thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Invalid channel options: {0}")]
    InvalidOptions(String),

    #[error("Channel is closed")]
    Closed,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Result type for channel operations.
pub type ChannelResult<T> = std::result::Result<T, ChannelError>;
