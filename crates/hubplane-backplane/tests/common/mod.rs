//! Shared helpers for multi-server tests: a bus that records publishes and
//! shortcuts for spinning up servers and connections.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use hubplane_backplane::HubLifetimeManager;
use hubplane_bus::{BusChannel, BusError, InMemoryBus, MessageBus};
use hubplane_core::{ConnectionId, HubConnection, JsonHubProtocol};
use hubplane_settings::{AckSettings, BackplaneSettings};

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// An [`InMemoryBus`] that remembers every successful publish.
#[derive(Default)]
pub struct RecordingBus {
    inner: InMemoryBus,
    published: Mutex<Vec<String>>,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_available(&self, available: bool) {
        self.inner.set_available(available);
    }

    /// Publishes to exactly `channel`.
    pub fn published_to(&self, channel: &str) -> usize {
        self.published.lock().iter().filter(|c| *c == channel).count()
    }

    /// Publishes to any channel whose name contains `fragment`.
    pub fn published_matching(&self, fragment: &str) -> usize {
        self.published
            .lock()
            .iter()
            .filter(|c| c.contains(fragment))
            .count()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, channel: &str, body: Bytes) -> Result<(), BusError> {
        self.inner.publish(channel, body).await?;
        self.published.lock().push(channel.to_owned());
        Ok(())
    }

    async fn channel_names(&self) -> Result<Vec<String>, BusError> {
        self.inner.channel_names().await
    }

    async fn subscribe(&self, channel: &str) -> Result<Arc<dyn BusChannel>, BusError> {
        self.inner.subscribe(channel).await
    }
}

pub fn settings(server: &str) -> BackplaneSettings {
    BackplaneSettings {
        application_name: "test".into(),
        server_name: Some(server.into()),
        ack: AckSettings {
            timeout_ms: 1_000,
            sweep_interval_ms: 100,
        },
        ..BackplaneSettings::default()
    }
}

/// A server subscribed to the shared bus.
pub async fn server(bus: &Arc<RecordingBus>, name: &str) -> Arc<HubLifetimeManager> {
    let manager = unconnected_server(bus, name);
    manager.connect().await.unwrap();
    manager
}

pub fn unconnected_server(bus: &Arc<RecordingBus>, name: &str) -> Arc<HubLifetimeManager> {
    let bus: Arc<dyn MessageBus> = Arc::clone(bus) as Arc<dyn MessageBus>;
    HubLifetimeManager::new(&settings(name), vec![Arc::new(JsonHubProtocol)], bus)
}

/// Attach a connection to `manager` and return its outbound queue.
pub async fn attach(
    manager: &HubLifetimeManager,
    id: &str,
    user: Option<&str>,
) -> mpsc::Receiver<Bytes> {
    let (conn, rx) = manager.channel_connection(ConnectionId::from(id), Arc::new(JsonHubProtocol));
    let conn = match user {
        Some(user) => conn.with_user(user),
        None => conn,
    };
    let conn: Arc<dyn HubConnection> = Arc::new(conn);
    manager.on_connected(conn).await.unwrap();
    rx
}

/// Method name of the next frame on `rx`.
pub async fn next_target(rx: &mut mpsc::Receiver<Bytes>) -> String {
    let frame = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("no frame in time")
        .expect("queue closed");
    let value: Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
    value["target"].as_str().unwrap().to_owned()
}

/// Assert nothing arrives on `rx` for a short while.
pub async fn assert_silent(rx: &mut mpsc::Receiver<Bytes>) {
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err(), "unexpected frame");
}

/// Poll `condition` until it holds or [`TIMEOUT`] passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
