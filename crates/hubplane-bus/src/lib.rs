//! # hubplane-bus
//!
//! The message-queue transport the backplane publishes through, seen as an
//! opaque publish/subscribe bus of named channels.
//!
//! Publishing is fire-and-forget. Publishing to or subscribing a channel that
//! does not exist yet creates it. [`InMemoryBus`] implements the interface
//! with process-local queues for single-host deployments and tests.

#![deny(unsafe_code)]

pub mod memory;

pub use memory::InMemoryBus;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use thiserror::Error;

/// Bus failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The bus could not be reached.
    #[error("message bus unavailable: {0}")]
    Unavailable(String),
    /// The channel's queue has been torn down.
    #[error("channel {0} is closed")]
    ChannelClosed(String),
    /// Another subscriber already consumes this channel.
    #[error("channel {0} already has a consumer")]
    AlreadyConsumed(String),
}

/// One message received from a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message arrived on.
    pub channel_name: String,
    /// Raw payload.
    pub body: Bytes,
}

/// Async callback invoked for every message on a subscribed channel.
pub type MessageHandler = Arc<dyn Fn(BusMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// A publish/subscribe bus of named channels.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `body` to `channel`, creating the channel if needed.
    async fn publish(&self, channel: &str, body: Bytes) -> Result<(), BusError>;

    /// Names of every channel currently known to the bus.
    async fn channel_names(&self) -> Result<Vec<String>, BusError>;

    /// Start consuming `channel`, creating it if needed.
    async fn subscribe(&self, channel: &str) -> Result<Arc<dyn BusChannel>, BusError>;
}

/// A subscribed channel.
#[async_trait]
pub trait BusChannel: Send + Sync {
    /// The channel name.
    fn name(&self) -> &str;

    /// Register a handler for incoming messages.
    fn on_message(&self, handler: MessageHandler);

    /// Stop consuming the channel.
    async fn unsubscribe(&self);
}

impl std::fmt::Debug for dyn BusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusChannel").field("name", &self.name()).finish()
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(BusMessage) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_display() {
        assert_eq!(
            BusError::Unavailable("down".into()).to_string(),
            "message bus unavailable: down"
        );
        assert_eq!(
            BusError::ChannelClosed("app:acks:s1".into()).to_string(),
            "channel app:acks:s1 is closed"
        );
    }

    #[tokio::test]
    async fn handler_wraps_async_closure() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let h = handler(move |msg: BusMessage| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.channel_name);
            }
        });

        h(BusMessage {
            channel_name: "c".into(),
            body: Bytes::new(),
        })
        .await;
        assert_eq!(rx.recv().await.as_deref(), Some("c"));
    }
}
