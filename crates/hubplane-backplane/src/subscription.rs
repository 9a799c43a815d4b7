//! Per-key member sets with first/last transition callbacks.
//!
//! One manager tracks groups, another tracks users. A key is present only
//! while it has at least one member. All mutation goes through a single
//! async gate so the first/last callbacks fire exactly once per transition,
//! even when the callback itself awaits.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use hubplane_core::{ConnectionId, HubConnection};
use tokio::sync::Mutex;
use tracing::trace;

type Members = HashMap<ConnectionId, Arc<dyn HubConnection>>;

/// Local connections interested in each key.
#[derive(Default)]
pub struct SubscriptionManager {
    subscriptions: DashMap<String, Members>,
    gate: Mutex<()>,
}

impl SubscriptionManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `connection` to `key`. When `key` goes from no members to one,
    /// `on_first` runs with the key before the gate is released.
    ///
    /// Adding a connection that is already a member changes nothing and
    /// fires nothing.
    pub async fn add_subscription<F, Fut>(
        &self,
        key: &str,
        connection: Arc<dyn HubConnection>,
        on_first: F,
    ) where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _ = self
            .add_subscription_if(key, connection, || true, on_first)
            .await;
    }

    /// Like [`add_subscription`](Self::add_subscription), but checks
    /// `is_live` under the gate first and adds nothing when it returns
    /// false. Returns whether the connection was checked in.
    ///
    /// Removals serialize on the same gate, so a connection that `is_live`
    /// accepts is either still a member when a later
    /// [`remove_connection`](Self::remove_connection) runs, or was never
    /// added.
    pub async fn add_subscription_if<P, F, Fut>(
        &self,
        key: &str,
        connection: Arc<dyn HubConnection>,
        is_live: P,
        on_first: F,
    ) -> bool
    where
        P: FnOnce() -> bool,
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _gate = self.gate.lock().await;
        if !is_live() {
            trace!(key, connection_id = %connection.connection_id(), "skipping departed connection");
            return false;
        }
        let became_first = {
            let mut members = self.subscriptions.entry(key.to_owned()).or_default();
            let id = connection.connection_id().clone();
            let inserted = members.insert(id, connection).is_none();
            inserted && members.len() == 1
        };
        if became_first {
            trace!(key, "first subscriber for key");
            on_first(key.to_owned()).await;
        }
        true
    }

    /// Remove `connection_id` from `key`. When the last member leaves, the
    /// key is dropped and `on_last` runs before the gate is released.
    pub async fn remove_subscription<F, Fut>(
        &self,
        key: &str,
        connection_id: &ConnectionId,
        on_last: F,
    ) where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _gate = self.gate.lock().await;
        if self.remove_member(key, connection_id) {
            trace!(key, "last subscriber left key");
            on_last(key.to_owned()).await;
        }
    }

    /// Remove `connection_id` from every key it belongs to, running
    /// `on_last` for each key that becomes empty. Returns the keys the
    /// connection was removed from.
    pub async fn remove_connection<F, Fut>(
        &self,
        connection_id: &ConnectionId,
        mut on_last: F,
    ) -> Vec<String>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _gate = self.gate.lock().await;
        let keys = self.keys_for(connection_id);
        for key in &keys {
            if self.remove_member(key, connection_id) {
                trace!(key = %key, "last subscriber left key");
                on_last(key.clone()).await;
            }
        }
        keys
    }

    /// Remove one member, dropping the key atomically if it empties.
    /// Returns whether the key was dropped.
    fn remove_member(&self, key: &str, connection_id: &ConnectionId) -> bool {
        let mut removed = false;
        let emptied = self
            .subscriptions
            .remove_if_mut(key, |_, members| {
                removed = members.remove(connection_id).is_some();
                members.is_empty()
            })
            .is_some();
        removed && emptied
    }

    /// Current members of `key`.
    pub fn members(&self, key: &str) -> Vec<Arc<dyn HubConnection>> {
        self.subscriptions
            .get(key)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `connection_id` is a member of `key`.
    pub fn is_member(&self, key: &str, connection_id: &ConnectionId) -> bool {
        self.subscriptions
            .get(key)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Keys `connection_id` currently belongs to, sorted.
    pub fn keys_for(&self, connection_id: &ConnectionId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().contains_key(connection_id))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Whether `key` has any members.
    pub fn contains_key(&self, key: &str) -> bool {
        self.subscriptions.contains_key(key)
    }

    /// Number of keys with members.
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether no key has members.
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
