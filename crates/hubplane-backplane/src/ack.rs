//! Pending acknowledgments for remote group changes.
//!
//! Each pending ack is keyed by the issuing command's id and resolves exactly
//! once: [`AckOutcome::Acknowledged`] when the owning server confirms,
//! [`AckOutcome::TimedOut`] when a periodic sweep finds it older than the
//! timeout, or [`AckOutcome::Cancelled`] when the handler is disposed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How a pending acknowledgment resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckOutcome {
    /// The remote server applied the command.
    Acknowledged,
    /// No ack arrived before the timeout.
    TimedOut,
    /// The handler was disposed while the ack was pending.
    Cancelled,
}

struct AckInfo {
    created: Instant,
    tx: watch::Sender<Option<AckOutcome>>,
}

impl AckInfo {
    fn resolve(&self, outcome: AckOutcome) {
        let _ = self.tx.send_replace(Some(outcome));
    }
}

/// Awaitable side of a pending acknowledgment.
#[derive(Debug)]
pub struct AckWaiter {
    rx: watch::Receiver<Option<AckOutcome>>,
}

impl AckWaiter {
    fn resolved(outcome: AckOutcome) -> Self {
        let (_tx, rx) = watch::channel(Some(outcome));
        Self { rx }
    }

    /// Wait for the outcome. A handler dropped without resolving the entry
    /// counts as [`AckOutcome::Cancelled`].
    pub async fn wait(mut self) -> AckOutcome {
        match self.rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(AckOutcome::Cancelled),
            Err(_) => AckOutcome::Cancelled,
        }
    }
}

/// Tracks pending acknowledgments and expires them on a fixed interval.
pub struct AckHandler {
    acks: DashMap<u64, AckInfo>,
    /// Held by create, sweep and dispose so a sweep never races teardown.
    disposed: Mutex<bool>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl AckHandler {
    /// Create a handler and start its sweep task. Must be called within a
    /// Tokio runtime.
    ///
    /// The sweep task holds only a weak reference and stops when the handler
    /// is disposed or dropped.
    pub fn new(timeout: Duration, sweep_interval: Duration) -> Arc<Self> {
        let handler = Arc::new(Self {
            acks: DashMap::new(),
            disposed: Mutex::new(false),
            timeout,
            cancel: CancellationToken::new(),
        });
        drop(tokio::spawn(run_sweep(
            Arc::downgrade(&handler),
            sweep_interval,
            handler.cancel.clone(),
        )));
        handler
    }

    /// Register a pending ack for `id`.
    ///
    /// Registering an id that is already pending returns another waiter on
    /// the same entry. After [`dispose`](Self::dispose) the waiter is
    /// already resolved as cancelled.
    pub fn create_ack(&self, id: u64) -> AckWaiter {
        let disposed = self.disposed.lock();
        if *disposed {
            return AckWaiter::resolved(AckOutcome::Cancelled);
        }
        let entry = self.acks.entry(id).or_insert_with(|| {
            let (tx, _rx) = watch::channel(None);
            AckInfo {
                created: Instant::now(),
                tx,
            }
        });
        trace!(ack_id = id, "ack registered");
        AckWaiter {
            rx: entry.tx.subscribe(),
        }
    }

    /// Resolve the pending ack for `id`. Unknown ids (late or duplicate acks)
    /// are ignored.
    pub fn trigger_ack(&self, id: u64) {
        if let Some((_, info)) = self.acks.remove(&id) {
            info.resolve(AckOutcome::Acknowledged);
            trace!(ack_id = id, "ack resolved");
        } else {
            trace!(ack_id = id, "ack for unknown id ignored");
        }
    }

    /// Drop the pending ack for `id`, resolving its waiters as cancelled.
    /// Used when the command it waits for could not be sent.
    pub fn cancel_ack(&self, id: u64) {
        if let Some((_, info)) = self.acks.remove(&id) {
            info.resolve(AckOutcome::Cancelled);
        }
    }

    /// Time out every pending ack older than the timeout. Returns how many
    /// were expired.
    pub fn check_acks(&self) -> usize {
        let disposed = self.disposed.lock();
        if *disposed {
            return 0;
        }
        let now = Instant::now();
        let candidates: Vec<u64> = self
            .acks
            .iter()
            .filter(|entry| now.duration_since(entry.created) > self.timeout)
            .map(|entry| *entry.key())
            .collect();

        let mut expired = 0;
        for id in candidates {
            if let Some((_, info)) = self
                .acks
                .remove_if(&id, |_, info| now.duration_since(info.created) > self.timeout)
            {
                info.resolve(AckOutcome::TimedOut);
                expired += 1;
            }
        }
        expired
    }

    /// Stop the sweep and cancel every pending ack. Later calls are no-ops.
    pub fn dispose(&self) {
        let mut disposed = self.disposed.lock();
        if *disposed {
            return;
        }
        *disposed = true;
        self.cancel.cancel();

        let ids: Vec<u64> = self.acks.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, info)) = self.acks.remove(&id) {
                info.resolve(AckOutcome::Cancelled);
            }
        }
        debug!("ack handler disposed");
    }

    /// Whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        *self.disposed.lock()
    }

    /// Number of unresolved acks.
    pub fn pending_count(&self) -> usize {
        self.acks.len()
    }
}

impl Drop for AckHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_sweep(handler: Weak<AckHandler>, interval: Duration, cancel: CancellationToken) {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(handler) = handler.upgrade() else { break };
                let expired = handler.check_acks();
                if expired > 0 {
                    debug!(expired, "expired pending acks");
                }
            }
        }
    }
    trace!("ack sweep stopped");
}
