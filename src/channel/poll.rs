//! The poll loop.
//!
//! Each open channel runs one poll thread. It is the only reader of the
//! log for its session, so cursor and dedup updates never race.

use super::Shared;
use crate::error::{ChannelError, ChannelResult};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Messages sent to the poll thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Control {
    /// Read now instead of waiting out the interval.
    Wake,
    /// Stop polling.
    Close,
}

/// Run until the channel closes.
pub(crate) fn run(shared: Arc<Shared>, control: Receiver<Control>) {
    let interval = shared.options.poll_interval();
    debug!(channel = %shared.name, session = %shared.session_id, "poll loop started");

    while !shared.is_closed() {
        shared.stats.polls.fetch_add(1, Ordering::Relaxed);

        // A failed read costs one iteration; the next interval retries.
        if let Err(e) = read_new_messages(&shared) {
            shared.stats.read_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = %shared.name,
                session = %shared.session_id,
                error = %e,
                "poll iteration failed"
            );
        }

        match control.recv_timeout(interval) {
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Control::Close) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(channel = %shared.name, session = %shared.session_id, "poll loop stopped");
}

/// Read everything past the cursor and deliver what survives the filters.
///
/// Returns the number of callback invocations.
pub(crate) fn read_new_messages(shared: &Shared) -> ChannelResult<usize> {
    let after = shared.state.lock().last_seen();
    let batch = shared
        .store
        .read_from(after)
        .map_err(ChannelError::StoreReadFailed)?;

    let now = Instant::now();
    let eligible = {
        let mut state = shared.state.lock();
        state.expire_delivered(now);
        state.select(&shared.session_id, batch, now)
    };

    let mut delivered = 0;
    for message in eligible {
        if shared.is_closed() {
            break;
        }

        // The lock is released before invoking so the callback may use the channel.
        let Some(callback) = shared.state.lock().begin_delivery(message.id, now) else {
            continue;
        };

        let payload = match message.decode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %shared.name, id = %message.id, error = %e, "undecodable payload");
                continue;
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
            warn!(channel = %shared.name, id = %message.id, "message callback panicked");
        }
        delivered += 1;
    }

    shared
        .stats
        .delivered
        .fetch_add(delivered as u64, Ordering::Relaxed);
    Ok(delivered)
}
