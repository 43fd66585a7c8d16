//! # Pollcast
//!
//! A broadcast channel whose participants share one append-only message
//! log and discover each other's messages by polling it.
//!
//! ## Core Concepts
//!
//! - **Log**: messages keyed by a store-assigned, strictly increasing id
//! - **Session**: one participant's open channel, with its own sender token
//! - **Cursor**: the highest id a session has scanned; never moves back
//! - **Dedup set**: recently delivered ids, forgotten after twice the retention window
//! - **Collection**: sends occasionally delete messages older than the retention window
//!
//! ## Example
//!
//! ```ignore
//! use pollcast::{Channel, ChannelOptions, FileBackend};
//!
//! let backend = FileBackend::new("./channels");
//! let channel = Channel::open("updates", &backend, ChannelOptions::default())?;
//!
//! channel.on_message(|payload| println!("got {payload}"));
//! channel.post(&json!({"kind": "refresh"}))?;
//!
//! channel.close();
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod gc;
pub mod store;
pub mod types;

// Re-exports
pub use channel::{
    Channel, ChannelStats, DeliveredSet, MessageCallback, MessageReceiver, SessionState,
};
pub use config::ChannelOptions;
pub use error::{ChannelError, ChannelResult, Result, StoreError};
pub use gc::{collect_expired, collect_expired_before, expired_messages, GcReport};
pub use store::{
    namespace_for, CompactionStats, FileBackend, FileStore, MemoryBackend, MemoryStore,
    MessageIter, MessageStore, StoreBackend,
};
pub use types::*;
