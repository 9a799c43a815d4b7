//! Backplane error taxonomy.
//!
//! Nothing here is fatal to the process: every error is contained to the
//! operation that raised it. Inbound handlers log and drop instead of
//! returning these.

use hubplane_bus::BusError;
use hubplane_core::{ConnectionId, DecodeError, DeliveryError, ProtocolError};
use thiserror::Error;

/// Errors surfaced by backplane operations.
#[derive(Debug, Error)]
pub enum BackplaneError {
    /// The bus could not be reached.
    #[error("transport error: {0}")]
    Transport(#[from] BusError),
    /// A backplane payload was malformed.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    /// An invocation could not be serialized for a registered hub protocol.
    #[error("encode error: {0}")]
    Encode(#[from] ProtocolError),
    /// Writing to a local connection failed.
    #[error("delivery to {connection_id} failed: {source}")]
    Delivery {
        /// Connection the write was for.
        connection_id: ConnectionId,
        /// Underlying write failure.
        #[source]
        source: DeliveryError,
    },
    /// A remote group change was not acknowledged in time.
    #[error("group command {ack_id} was not acknowledged in time")]
    AckTimeout {
        /// Id of the unacknowledged command.
        ack_id: u64,
    },
    /// A remote group change was abandoned because the manager shut down.
    #[error("group command {ack_id} was cancelled")]
    AckCancelled {
        /// Id of the abandoned command.
        ack_id: u64,
    },
    /// A caller passed an unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The manager has been shut down.
    #[error("backplane has been shut down")]
    ShutDown,
}

impl BackplaneError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::Delivery { .. } => "delivery",
            Self::AckTimeout { .. } => "ack_timeout",
            Self::AckCancelled { .. } => "ack_cancelled",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Result type for backplane operations.
pub type Result<T> = std::result::Result<T, BackplaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_strings() {
        assert_eq!(BackplaneError::AckTimeout { ack_id: 1 }.error_kind(), "ack_timeout");
        assert_eq!(BackplaneError::ShutDown.error_kind(), "shut_down");
        assert_eq!(
            BackplaneError::Transport(BusError::Unavailable("x".into())).error_kind(),
            "transport"
        );
    }

    #[test]
    fn delivery_display_names_connection() {
        let err = BackplaneError::Delivery {
            connection_id: ConnectionId::from_raw("c9"),
            source: DeliveryError::Closed,
        };
        assert_eq!(err.to_string(), "delivery to c9 failed: connection closed");
    }

    #[test]
    fn decode_error_converts() {
        let err: BackplaneError = DecodeError::UnknownVersion(3).into();
        assert!(matches!(err, BackplaneError::Decode(_)));
    }
}
