//! Channel options.

use crate::error::{ChannelError, ChannelResult};
use crate::types::PayloadEncoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for an open channel.
///
/// Defaults follow the usual broadcast-channel settings: poll every 150ms
/// and keep messages for 45 seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Delay between poll iterations.
    /// Default: 150
    pub poll_interval_ms: u64,

    /// Age after which a message becomes eligible for collection.
    /// Default: 45000
    pub retention_ms: u64,

    /// Chance that a successful send also triggers collection.
    /// Default: 0.1
    pub gc_probability: f64,

    /// Upper bound on remembered delivered ids.
    /// Default: 4096
    pub dedup_capacity: usize,

    /// Encoding used for outgoing payloads.
    pub encoding: PayloadEncoding,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 150,
            retention_ms: 45_000,
            gc_probability: 0.1,
            dedup_capacity: 4096,
            encoding: PayloadEncoding::Json,
        }
    }
}

impl ChannelOptions {
    /// Parse options from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> ChannelResult<Self> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| ChannelError::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_ms = retention.as_millis() as u64;
        self
    }

    pub fn with_gc_probability(mut self, probability: f64) -> Self {
        self.gc_probability = probability;
        self
    }

    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// How long delivered ids are remembered.
    ///
    /// Past twice the retention window the message has been collected, so
    /// the cursor alone keeps it from coming back.
    pub fn dedup_ttl(&self) -> Duration {
        self.retention() * 2
    }

    /// Expected delay between a send and its delivery elsewhere.
    pub fn average_response_time(&self) -> Duration {
        self.poll_interval().mul_f64(1.5)
    }

    /// Reject settings the poll loop or collector cannot run with.
    pub fn validate(&self) -> ChannelResult<()> {
        if self.poll_interval_ms == 0 {
            return Err(ChannelError::InvalidOptions(
                "poll_interval_ms must be positive".into(),
            ));
        }
        if self.retention_ms == 0 {
            return Err(ChannelError::InvalidOptions(
                "retention_ms must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.gc_probability) {
            return Err(ChannelError::InvalidOptions(format!(
                "gc_probability must be within [0, 1], got {}",
                self.gc_probability
            )));
        }
        if self.dedup_capacity == 0 {
            return Err(ChannelError::InvalidOptions(
                "dedup_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let options = ChannelOptions::default();
        options.validate().unwrap();
        assert_eq!(options.poll_interval(), Duration::from_millis(150));
        assert_eq!(options.average_response_time(), Duration::from_millis(225));
        assert_eq!(options.dedup_ttl(), Duration::from_secs(90));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let options =
            ChannelOptions::from_json_str(r#"{"poll_interval_ms": 50, "encoding": "message_pack"}"#)
                .unwrap();
        assert_eq!(options.poll_interval_ms, 50);
        assert_eq!(options.retention_ms, 45_000);
        assert_eq!(options.encoding, PayloadEncoding::MessagePack);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            ChannelOptions {
                poll_interval_ms: 0,
                ..Default::default()
            },
            ChannelOptions {
                retention_ms: 0,
                ..Default::default()
            },
            ChannelOptions::default().with_gc_probability(1.5),
            ChannelOptions {
                dedup_capacity: 0,
                ..Default::default()
            },
        ];

        for options in bad {
            assert!(matches!(
                options.validate(),
                Err(ChannelError::InvalidOptions(_))
            ));
        }
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(ChannelOptions::from_json_str("{not json").is_err());
        assert!(ChannelOptions::from_json_str(r#"{"gc_probability": -1.0}"#).is_err());
    }
}
