//! Collection of expired messages.
//!
//! Messages older than the retention window are deleted from the head of
//! the log. Ids follow append order, so the expired messages form a
//! prefix and the scan stops at the first message that is still fresh.

use crate::error::{ChannelError, ChannelResult, Result};
use crate::store::{CompactionStats, MessageStore};
use crate::types::{Message, Timestamp};
use std::time::Duration;
use tracing::warn;

/// Outcome of one collection pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Messages stamped before this were eligible.
    pub cutoff: Timestamp,
    /// Expired messages found.
    pub expired: usize,
    /// Expired messages deleted.
    pub deleted: usize,
    /// Deletes that failed and were skipped.
    pub failed: usize,
    /// Compaction run after deleting, if any.
    pub compaction: Option<CompactionStats>,
}

/// Decide whether a send should trigger collection.
pub fn should_collect(probability: f64) -> bool {
    use rand::Rng;

    if probability <= 0.0 {
        false
    } else if probability >= 1.0 {
        true
    } else {
        rand::rng().random_bool(probability)
    }
}

/// Messages at the head of the log stamped before `cutoff`.
pub fn expired_messages(store: &dyn MessageStore, cutoff: Timestamp) -> Result<Vec<Message>> {
    let mut expired = Vec::new();
    for message in store.scan()? {
        let message = message?;
        if message.timestamp >= cutoff {
            break;
        }
        expired.push(message);
    }
    Ok(expired)
}

/// Delete every message older than `retention`.
pub fn collect_expired(store: &dyn MessageStore, retention: Duration) -> ChannelResult<GcReport> {
    collect_expired_before(store, Timestamp::now().saturating_sub(retention))
}

/// Delete every head message stamped before `cutoff`.
///
/// A failed delete is logged and skipped. If anything was deleted the
/// store is asked to compact.
pub fn collect_expired_before(
    store: &dyn MessageStore,
    cutoff: Timestamp,
) -> ChannelResult<GcReport> {
    let expired = expired_messages(store, cutoff).map_err(ChannelError::StoreReadFailed)?;

    let mut report = GcReport {
        cutoff,
        expired: expired.len(),
        ..Default::default()
    };

    for message in &expired {
        match store.delete(message.id) {
            Ok(()) => report.deleted += 1,
            Err(source) => {
                report.failed += 1;
                let err = ChannelError::StoreDeleteFailed {
                    id: message.id,
                    source,
                };
                warn!(error = %err, "skipping expired message");
            }
        }
    }

    if report.deleted > 0 {
        match store.compact() {
            Ok(stats) => report.compaction = Some(stats),
            Err(e) => warn!(error = %e, "log compaction failed"),
        }
    }

    Ok(report)
}
