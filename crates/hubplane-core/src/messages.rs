//! Client-bound invocations and their per-protocol serialization cache.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::protocol::HubProtocol;

/// A client-bound method call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationMessage {
    /// Client method name.
    pub target: String,
    /// Positional arguments.
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    /// Create an invocation of `target` with `arguments`.
    pub fn new(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            target: target.into(),
            arguments,
        }
    }
}

/// An invocation plus its serialized form for each hub protocol that has
/// asked for it.
///
/// Broadcasting to many connections that speak different protocols
/// serializes the message once per distinct protocol, keyed by
/// [`HubProtocol::name`].
#[derive(Debug)]
pub struct SerializedHubMessage {
    message: Arc<InvocationMessage>,
    cache: Mutex<HashMap<String, Bytes>>,
}

impl SerializedHubMessage {
    /// Wrap a message with an empty cache.
    pub fn new(message: InvocationMessage) -> Self {
        Self {
            message: Arc::new(message),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Wrap a message whose serialized forms are already known, e.g. after
    /// decoding them off the backplane.
    pub fn with_serialized(
        message: InvocationMessage,
        serialized: impl IntoIterator<Item = (String, Bytes)>,
    ) -> Self {
        Self {
            message: Arc::new(message),
            cache: Mutex::new(serialized.into_iter().collect()),
        }
    }

    /// The underlying invocation.
    pub fn message(&self) -> &InvocationMessage {
        &self.message
    }

    /// Serialized bytes for `protocol`, serializing and caching on first use.
    pub fn serialized_for(&self, protocol: &dyn HubProtocol) -> Result<Bytes, ProtocolError> {
        let mut cache = self.cache.lock();
        if let Some(bytes) = cache.get(protocol.name()) {
            return Ok(bytes.clone());
        }
        let bytes = protocol.write_invocation(&self.message)?;
        let _ = cache.insert(protocol.name().to_owned(), bytes.clone());
        Ok(bytes)
    }

    /// Cached bytes for the protocol called `name`, without serializing.
    pub fn cached(&self, name: &str) -> Option<Bytes> {
        self.cache.lock().get(name).cloned()
    }

    /// Every cached `(protocol name, bytes)` pair, sorted by name.
    pub fn cached_entries(&self) -> Vec<(String, Bytes)> {
        let mut entries: Vec<_> = self
            .cache
            .lock()
            .iter()
            .map(|(name, bytes)| (name.clone(), bytes.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProtocol {
        name: &'static str,
        writes: AtomicUsize,
    }

    impl HubProtocol for CountingProtocol {
        fn name(&self) -> &str {
            self.name
        }

        fn write_invocation(&self, message: &InvocationMessage) -> Result<Bytes, ProtocolError> {
            let _ = self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::from(format!("{}:{}", self.name, message.target)))
        }
    }

    fn protocol(name: &'static str) -> CountingProtocol {
        CountingProtocol {
            name,
            writes: AtomicUsize::new(0),
        }
    }

    #[test]
    fn serializes_once_per_protocol() {
        let p1 = protocol("p1");
        let p2 = protocol("p2");
        let msg = SerializedHubMessage::new(InvocationMessage::new("Hello", vec![]));

        for _ in 0..5 {
            assert_eq!(msg.serialized_for(&p1).unwrap(), Bytes::from("p1:Hello"));
            assert_eq!(msg.serialized_for(&p2).unwrap(), Bytes::from("p2:Hello"));
        }

        assert_eq!(p1.writes.load(Ordering::SeqCst), 1);
        assert_eq!(p2.writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefilled_cache_is_returned_verbatim() {
        let p1 = protocol("p1");
        let msg = SerializedHubMessage::with_serialized(
            InvocationMessage::new("Hello", vec![]),
            vec![("p1".to_owned(), Bytes::from_static(b"\x00\x01raw"))],
        );

        assert_eq!(msg.serialized_for(&p1).unwrap(), Bytes::from_static(b"\x00\x01raw"));
        assert_eq!(p1.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cached_entries_sorted_by_name() {
        let msg = SerializedHubMessage::new(InvocationMessage::new("Hi", vec![]));
        let _ = msg.serialized_for(&protocol("zeta")).unwrap();
        let _ = msg.serialized_for(&protocol("alpha")).unwrap();

        let names: Vec<_> = msg.cached_entries().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert!(msg.cached("beta").is_none());
    }
}
