//! Live client connections and the per-process connection registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::errors::DeliveryError;
use crate::ids::ConnectionId;
use crate::messages::SerializedHubMessage;
use crate::protocol::HubProtocol;

/// One client session attached to this process.
///
/// Owned by the hosting framework; the backplane only reads the identity and
/// writes pre-serialized messages.
#[async_trait]
pub trait HubConnection: Send + Sync {
    /// Process-unique connection id.
    fn connection_id(&self) -> &ConnectionId;

    /// User the session is authenticated as, if any.
    fn user_identifier(&self) -> Option<&str>;

    /// Write an invocation using this connection's protocol.
    async fn write(&self, message: &SerializedHubMessage) -> Result<(), DeliveryError>;
}

/// A connection that hands serialized frames to a bounded outbound queue,
/// drained by the transport's writer task.
pub struct ChannelConnection {
    id: ConnectionId,
    user_identifier: Option<String>,
    protocol: Arc<dyn HubProtocol>,
    tx: mpsc::Sender<Bytes>,
    connected_at: Instant,
    dropped_messages: AtomicU64,
}

impl ChannelConnection {
    /// Create a connection speaking `protocol` with an outbound queue of
    /// `capacity` frames. Returns the connection and the queue's receiver.
    pub fn new(
        id: ConnectionId,
        protocol: Arc<dyn HubProtocol>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id,
            user_identifier: None,
            protocol,
            tx,
            connected_at: Instant::now(),
            dropped_messages: AtomicU64::new(0),
        };
        (conn, rx)
    }

    /// Associate the connection with a user.
    #[must_use]
    pub fn with_user(mut self, user_identifier: impl Into<String>) -> Self {
        self.user_identifier = Some(user_identifier.into());
        self
    }

    /// The protocol frames are serialized with.
    pub fn protocol(&self) -> &Arc<dyn HubProtocol> {
        &self.protocol
    }

    /// Total frames dropped because the queue was full or closed.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[async_trait]
impl HubConnection for ChannelConnection {
    fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    fn user_identifier(&self) -> Option<&str> {
        self.user_identifier.as_deref()
    }

    async fn write(&self, message: &SerializedHubMessage) -> Result<(), DeliveryError> {
        let frame = message.serialized_for(self.protocol.as_ref())?;
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
                Err(DeliveryError::Closed)
            }
        }
    }
}

/// Registry of the connections attached to this process.
///
/// Mutated only by connect/disconnect. Iteration goes through [`snapshot`],
/// which returns owned handles so a broadcast never observes a connection
/// disappearing mid-iteration.
///
/// [`snapshot`]: ConnectionStore::snapshot
#[derive(Default)]
pub struct ConnectionStore {
    connections: DashMap<ConnectionId, Arc<dyn HubConnection>>,
}

impl ConnectionStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one with the same id.
    pub fn add(&self, connection: Arc<dyn HubConnection>) {
        let _ = self
            .connections
            .insert(connection.connection_id().clone(), connection);
    }

    /// Remove a connection by id, returning it if it was registered.
    pub fn remove(&self, connection_id: &ConnectionId) -> Option<Arc<dyn HubConnection>> {
        self.connections.remove(connection_id).map(|(_, conn)| conn)
    }

    /// Look up a connection by id.
    pub fn get(&self, connection_id: &ConnectionId) -> Option<Arc<dyn HubConnection>> {
        self.connections
            .get(connection_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a connection with this id is registered.
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    /// Owned handles to every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<dyn HubConnection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
