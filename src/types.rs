//! Core types for the message log.

use crate::error::{ChannelError, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Store-assigned message identifier. Strictly increasing, never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct MessageId(pub u64);

impl MessageId {
    pub fn next(self) -> Self {
        MessageId(self.0 + 1)
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque token identifying the session that wrote a message.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Length of generated session tokens.
    pub const TOKEN_LEN: usize = 10;

    /// Generate a fresh random token.
    pub fn random() -> Self {
        use rand::distr::Alphanumeric;
        use rand::{rng, Rng};

        SessionId(
            rng()
                .sample_iter(&Alphanumeric)
                .take(Self::TOKEN_LEN)
                .map(char::from)
                .collect(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        SessionId(s.to_string())
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// This timestamp moved back by `duration`.
    pub fn saturating_sub(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_sub(millis))
    }

    /// This timestamp moved forward by `duration`.
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Payload encoding format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    #[default]
    Json,
    MessagePack,
}

impl PayloadEncoding {
    /// Encode an application payload.
    pub fn encode<T: Serialize + ?Sized>(self, payload: &T) -> Result<Vec<u8>, ChannelError> {
        match self {
            PayloadEncoding::Json => {
                serde_json::to_vec(payload).map_err(|e| ChannelError::Encode(e.to_string()))
            }
            PayloadEncoding::MessagePack => {
                rmp_serde::to_vec_named(payload).map_err(|e| ChannelError::Encode(e.to_string()))
            }
        }
    }

    /// Decode a stored payload into a JSON value.
    pub fn decode(self, bytes: &[u8]) -> Result<serde_json::Value, StoreError> {
        match self {
            PayloadEncoding::Json => serde_json::from_slice(bytes)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            PayloadEncoding::MessagePack => Ok(rmp_serde::from_slice(bytes)?),
        }
    }

    pub(crate) fn to_byte(self) -> u8 {
        match self {
            PayloadEncoding::Json => 0,
            PayloadEncoding::MessagePack => 1,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> Result<Self, StoreError> {
        match byte {
            0 => Ok(PayloadEncoding::Json),
            1 => Ok(PayloadEncoding::MessagePack),
            other => Err(StoreError::InvalidFormat(format!(
                "Unknown payload encoding: {}",
                other
            ))),
        }
    }
}

/// A message stored in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier (assigned by store).
    pub id: MessageId,

    /// Session that wrote the message.
    pub sender: SessionId,

    /// When the message was appended.
    pub timestamp: Timestamp,

    /// Encoded application payload.
    pub payload: Vec<u8>,

    /// Payload encoding.
    pub encoding: PayloadEncoding,
}

impl Message {
    /// Decode the payload into a JSON value.
    pub fn decode(&self) -> Result<serde_json::Value, StoreError> {
        self.encoding.decode(&self.payload)
    }
}

/// Input for appending a message (before id assigned).
#[derive(Clone, Debug)]
pub struct MessageInput {
    pub sender: SessionId,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
    pub encoding: PayloadEncoding,
}

impl MessageInput {
    /// Encode `payload` and stamp it with the current time.
    pub fn encode<T: Serialize + ?Sized>(
        sender: SessionId,
        payload: &T,
        encoding: PayloadEncoding,
    ) -> Result<Self, ChannelError> {
        Ok(Self {
            sender,
            timestamp: Timestamp::now(),
            payload: encoding.encode(payload)?,
            encoding,
        })
    }

    /// Create an input with raw JSON bytes.
    pub fn json(sender: impl Into<SessionId>, payload: Vec<u8>) -> Self {
        Self {
            sender: sender.into(),
            timestamp: Timestamp::now(),
            payload,
            encoding: PayloadEncoding::Json,
        }
    }

    /// Override the timestamp.
    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Attach the store-assigned id.
    pub fn into_message(self, id: MessageId) -> Message {
        Message {
            id,
            sender: self.sender,
            timestamp: self.timestamp,
            payload: self.payload,
            encoding: self.encoding,
        }
    }
}
