//! Process-local queue bus.
//!
//! Every channel is an unbounded FIFO queue created on first publish or
//! subscribe. A queue has at most one consumer. Messages published before a
//! subscriber registers its first handler stay queued, and unsubscribing
//! hands the queue back so a later subscriber resumes where it stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{BusChannel, BusError, BusMessage, MessageBus, MessageHandler};

struct Queue {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl Queue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

/// A bus whose channels live in this process.
pub struct InMemoryBus {
    queues: DashMap<String, Arc<Queue>>,
    available: AtomicBool,
}

impl InMemoryBus {
    /// Create an empty, reachable bus.
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the bus becoming unreachable (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages waiting in `channel` that no handler has taken yet.
    pub fn pending(&self, channel: &str) -> usize {
        self.queues.get(channel).map_or(0, |q| queued_len(q.value()))
    }

    fn ensure_available(&self) -> Result<(), BusError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::Unavailable("in-memory bus switched off".into()))
        }
    }

    fn queue(&self, channel: &str) -> Arc<Queue> {
        Arc::clone(
            self.queues
                .entry(channel.to_owned())
                .or_insert_with(|| Arc::new(Queue::new()))
                .value(),
        )
    }
}

fn queued_len(queue: &Queue) -> usize {
    queue.rx.lock().as_ref().map_or(0, mpsc::UnboundedReceiver::len)
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, body: Bytes) -> Result<(), BusError> {
        self.ensure_available()?;
        trace!(channel, bytes = body.len(), "enqueue message");
        self.queue(channel)
            .tx
            .send(body)
            .map_err(|_| BusError::ChannelClosed(channel.to_owned()))
    }

    async fn channel_names(&self) -> Result<Vec<String>, BusError> {
        self.ensure_available()?;
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn subscribe(&self, channel: &str) -> Result<Arc<dyn BusChannel>, BusError> {
        self.ensure_available()?;
        let queue = self.queue(channel);
        let rx = queue
            .rx
            .lock()
            .take()
            .ok_or_else(|| BusError::AlreadyConsumed(channel.to_owned()))?;
        debug!(channel, "subscribed to in-memory channel");
        Ok(Arc::new(InMemoryChannel {
            name: channel.to_owned(),
            queue,
            rx: Mutex::new(Some(rx)),
            handlers: Arc::new(RwLock::new(Vec::new())),
            cancel: CancellationToken::new(),
            pump: Mutex::new(None),
        }))
    }
}

/// A consumer of one in-memory queue.
struct InMemoryChannel {
    name: String,
    queue: Arc<Queue>,
    /// Held until the first handler registers and the pump takes it.
    rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    cancel: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryChannel {
    fn start_pump(&self, mut rx: mpsc::UnboundedReceiver<Bytes>) -> JoinHandle<()> {
        let name = self.name.clone();
        let queue = Arc::clone(&self.queue);
        let handlers = Arc::clone(&self.handlers);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(body) = msg else { break };
                        let current: Vec<MessageHandler> = handlers.read().clone();
                        for handler in current {
                            handler(BusMessage {
                                channel_name: name.clone(),
                                body: body.clone(),
                            })
                            .await;
                        }
                    }
                }
            }
            *queue.rx.lock() = Some(rx);
            trace!(channel = %name, "in-memory pump stopped");
        })
    }
}

#[async_trait]
impl BusChannel for InMemoryChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handlers.write().push(handler);
        if let Some(rx) = self.rx.lock().take() {
            *self.pump.lock() = Some(self.start_pump(rx));
        }
    }

    async fn unsubscribe(&self) {
        self.cancel.cancel();
        if let Some(rx) = self.rx.lock().take() {
            *self.queue.rx.lock() = Some(rx);
        }
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        debug!(channel = %self.name, "unsubscribed from in-memory channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<BusMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = handler(move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg);
            }
        });
        (h, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<BusMessage>) -> BusMessage {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn publish_creates_channel() {
        let bus = InMemoryBus::new();
        bus.publish("app:invocations:a", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(bus.channel_names().await.unwrap(), vec!["app:invocations:a"]);
        assert_eq!(bus.pending("app:invocations:a"), 1);
    }

    #[tokio::test]
    async fn channel_names_sorted() {
        let bus = InMemoryBus::new();
        let _b = bus.subscribe("b").await.unwrap();
        let _a = bus.subscribe("a").await.unwrap();
        assert_eq!(bus.channel_names().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn subscriber_receives_published_messages_in_order() {
        let bus = InMemoryBus::new();
        let channel = bus.subscribe("q").await.unwrap();
        let (h, mut rx) = collecting_handler();
        channel.on_message(h);

        for i in 0..3u8 {
            bus.publish("q", Bytes::from(vec![i])).await.unwrap();
        }

        for i in 0..3u8 {
            let msg = recv(&mut rx).await;
            assert_eq!(msg.channel_name, "q");
            assert_eq!(msg.body, Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn messages_published_before_handler_are_kept() {
        let bus = InMemoryBus::new();
        let channel = bus.subscribe("q").await.unwrap();
        bus.publish("q", Bytes::from_static(b"early")).await.unwrap();

        let (h, mut rx) = collecting_handler();
        channel.on_message(h);
        assert_eq!(recv(&mut rx).await.body, Bytes::from_static(b"early"));
    }

    #[tokio::test]
    async fn second_consumer_is_rejected() {
        let bus = InMemoryBus::new();
        let _first = bus.subscribe("q").await.unwrap();
        assert_matches!(bus.subscribe("q").await, Err(BusError::AlreadyConsumed(_)));
    }

    #[tokio::test]
    async fn unsubscribe_hands_queue_back() {
        let bus = InMemoryBus::new();
        let first = bus.subscribe("q").await.unwrap();
        let (h, _rx) = collecting_handler();
        first.on_message(h);
        first.unsubscribe().await;

        bus.publish("q", Bytes::from_static(b"later")).await.unwrap();

        let second = bus.subscribe("q").await.unwrap();
        let (h, mut rx) = collecting_handler();
        second.on_message(h);
        assert_eq!(recv(&mut rx).await.body, Bytes::from_static(b"later"));
    }

    #[tokio::test]
    async fn unsubscribe_without_handler_hands_queue_back() {
        let bus = InMemoryBus::new();
        let first = bus.subscribe("q").await.unwrap();
        first.unsubscribe().await;
        assert!(bus.subscribe("q").await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_bus_fails_every_operation() {
        let bus = InMemoryBus::new();
        bus.set_available(false);

        assert_matches!(bus.subscribe("q").await, Err(BusError::Unavailable(_)));
        assert_matches!(
            bus.publish("q", Bytes::new()).await,
            Err(BusError::Unavailable(_))
        );
        assert_matches!(bus.channel_names().await, Err(BusError::Unavailable(_)));

        bus.set_available(true);
        assert!(bus.subscribe("q").await.is_ok());
    }

    #[tokio::test]
    async fn all_handlers_see_each_message() {
        let bus = InMemoryBus::new();
        let channel = bus.subscribe("q").await.unwrap();
        let (h1, mut rx1) = collecting_handler();
        let (h2, mut rx2) = collecting_handler();
        channel.on_message(h1);
        channel.on_message(h2);

        bus.publish("q", Bytes::from_static(b"m")).await.unwrap();
        assert_eq!(recv(&mut rx1).await.body, Bytes::from_static(b"m"));
        assert_eq!(recv(&mut rx2).await.body, Bytes::from_static(b"m"));
    }
}
