//! Channel-backed message receiver.

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Receiving end of [`Channel::subscribe`](super::Channel::subscribe).
///
/// Payloads arrive in delivery order. If the buffer fills up, newer
/// payloads are dropped until the receiver catches up.
pub struct MessageReceiver {
    pub(crate) receiver: Receiver<serde_json::Value>,
}

impl MessageReceiver {
    /// Receive the next payload (blocking).
    pub fn recv(&self) -> Result<serde_json::Value, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a payload (non-blocking).
    pub fn try_recv(&self) -> Result<serde_json::Value, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<serde_json::Value, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Payloads waiting in the buffer.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}
