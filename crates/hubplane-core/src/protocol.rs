//! Client-facing hub protocols.
//!
//! Each connection speaks exactly one protocol. The backplane never needs to
//! know the concrete protocol types: it only asks each registered protocol to
//! serialize an [`InvocationMessage`] and keys the result by [`HubProtocol::name`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::messages::InvocationMessage;

/// Record separator terminating each JSON hub message.
pub const RECORD_SEPARATOR: u8 = 0x1e;

/// Message type tag for invocations.
const INVOCATION_MESSAGE_TYPE: u8 = 1;

/// A client wire format.
pub trait HubProtocol: Send + Sync {
    /// Stable protocol name, unique among registered protocols.
    fn name(&self) -> &str;

    /// Serialize an invocation into this protocol's framing.
    fn write_invocation(&self, message: &InvocationMessage) -> Result<Bytes, ProtocolError>;
}

/// Text protocol: one JSON object per message, terminated by `0x1e`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonHubProtocol;

#[derive(Serialize)]
struct JsonInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    target: &'a str,
    arguments: &'a [Value],
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn write_invocation(&self, message: &InvocationMessage) -> Result<Bytes, ProtocolError> {
        let body = serde_json::to_vec(&JsonInvocation {
            kind: INVOCATION_MESSAGE_TYPE,
            target: &message.target,
            arguments: &message.arguments,
        })?;
        let mut buf = BytesMut::with_capacity(body.len() + 1);
        buf.extend_from_slice(&body);
        buf.put_u8(RECORD_SEPARATOR);
        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_protocol_name() {
        assert_eq!(JsonHubProtocol.name(), "json");
    }

    #[test]
    fn json_protocol_writes_terminated_invocation() {
        let msg = InvocationMessage::new("Send", vec![json!(1), json!("two")]);
        let bytes = JsonHubProtocol.write_invocation(&msg).unwrap();

        assert_eq!(bytes.last(), Some(&RECORD_SEPARATOR));
        let parsed: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed["type"], 1);
        assert_eq!(parsed["target"], "Send");
        assert_eq!(parsed["arguments"], json!([1, "two"]));
    }

    #[test]
    fn json_protocol_empty_arguments() {
        let msg = InvocationMessage::new("Ping", vec![]);
        let bytes = JsonHubProtocol.write_invocation(&msg).unwrap();
        let parsed: Value = serde_json::from_slice(&bytes[..bytes.len() - 1]).unwrap();
        assert_eq!(parsed["arguments"], json!([]));
    }
}
