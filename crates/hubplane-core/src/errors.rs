//! Error types shared across the backplane.
//!
//! - [`ProtocolError`]: a client-facing hub protocol failed to serialize a message
//! - [`DeliveryError`]: a write to one local connection failed
//! - [`DecodeError`]: inbound backplane bytes were malformed

use thiserror::Error;

/// A hub protocol could not serialize a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON serialization failed.
    #[error("failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),
    /// The protocol cannot represent this message.
    #[error("unsupported message for protocol {protocol}: {reason}")]
    Unsupported {
        /// Protocol name.
        protocol: String,
        /// Why the message was rejected.
        reason: String,
    },
}

/// A single connection write failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The connection's outbound queue has been dropped.
    #[error("connection closed")]
    Closed,
    /// The connection's outbound queue is full.
    #[error("send queue full")]
    QueueFull,
    /// The message could not be serialized for this connection's protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Malformed backplane payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ended before the message was complete.
    #[error("unexpected end of payload while reading {0}")]
    UnexpectedEof(&'static str),
    /// The payload was written by an unknown codec version.
    #[error("unknown payload version {0}")]
    UnknownVersion(u8),
    /// The group action byte is not Add or Remove.
    #[error("unknown group action {0}")]
    UnknownGroupAction(u8),
    /// The optional-list presence flag is not 0 or 1.
    #[error("invalid presence flag {0}")]
    InvalidPresenceFlag(u8),
    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    /// The invocation arguments were not a JSON array.
    #[error("invalid invocation arguments: {0}")]
    InvalidArguments(String),
    /// Bytes remained after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
