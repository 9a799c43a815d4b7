//! The hub lifetime manager.
//!
//! Owns this server's connection registry and its group and user
//! subscriptions, and decides for every operation whether it can be served
//! locally or has to cross the bus.
//!
//! ## Connection to the bus
//!
//! The manager subscribes three channels named after this server
//! (invocations, group management, acks). Subscription happens lazily on
//! the first operation, or eagerly via [`HubLifetimeManager::connect`].
//! A failed attempt is logged, rolled back, and retried by the next
//! operation.
//!
//! ## Routing
//!
//! - A send to one connection that lives here is written directly.
//! - Every other send is encoded once and published to every server's
//!   invocations channel, this server's included; each receiver evaluates
//!   the target and exclusion lists against its own connections.
//! - A group change for a connection that lives here is applied directly.
//!   Otherwise a [`GroupCommand`] goes to every group-management channel and
//!   the caller waits for the owning server's ack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::join_all;
use hubplane_bus::{BusChannel, BusMessage, MessageBus, MessageHandler};
use hubplane_core::{
    ChannelConnection, ConnectionId, ConnectionStore, HubConnection, HubProtocol,
    InvocationMessage, SerializedHubMessage,
};
use hubplane_settings::BackplaneSettings;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::ack::{AckHandler, AckOutcome};
use crate::channels::ChannelNames;
use crate::codec::{BackplaneProtocol, GroupAction, GroupCommand, InvocationTargets};
use crate::error::{BackplaneError, Result};
use crate::subscription::SubscriptionManager;

/// Whether this server's inbound channels are subscribed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No inbound channel is subscribed.
    Disconnected,
    /// A subscribe attempt is in flight.
    Connecting,
    /// All three inbound channels are subscribed.
    Connected,
}

#[derive(Clone, Copy, Debug)]
enum Inbound {
    Invocation,
    GroupCommand,
    Ack,
}

/// Routes hub operations between local connections and the bus.
pub struct HubLifetimeManager {
    server_name: String,
    connection_string: String,
    send_queue_capacity: usize,
    channels: ChannelNames,
    codec: BackplaneProtocol,
    bus: Arc<dyn MessageBus>,
    connections: ConnectionStore,
    groups: SubscriptionManager,
    users: SubscriptionManager,
    ack_handler: Arc<AckHandler>,
    next_command_id: AtomicU64,
    state: Mutex<ConnectionState>,
    /// Serializes subscribe attempts and owns the subscribed channels.
    inbound: tokio::sync::Mutex<Vec<Arc<dyn BusChannel>>>,
    shut_down: AtomicBool,
    weak_self: Weak<Self>,
}

impl HubLifetimeManager {
    /// Create a manager for this server. Must be called within a Tokio
    /// runtime (the ack sweep starts immediately). Nothing is subscribed
    /// until [`connect`](Self::connect) or the first operation.
    pub fn new(
        settings: &BackplaneSettings,
        protocols: Vec<Arc<dyn HubProtocol>>,
        bus: Arc<dyn MessageBus>,
    ) -> Arc<Self> {
        let server_name = settings.resolved_server_name();
        let ack_handler = AckHandler::new(settings.ack.timeout(), settings.ack.sweep_interval());
        Arc::new_cyclic(|weak_self| Self {
            server_name,
            connection_string: settings.connection_string.clone(),
            send_queue_capacity: settings.connection.send_queue_capacity,
            channels: ChannelNames::new(settings.application_name.clone()),
            codec: BackplaneProtocol::new(protocols),
            bus,
            connections: ConnectionStore::new(),
            groups: SubscriptionManager::new(),
            users: SubscriptionManager::new(),
            ack_handler,
            next_command_id: AtomicU64::new(0),
            state: Mutex::new(ConnectionState::Disconnected),
            inbound: tokio::sync::Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    /// This server's identity in channel names.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Channel names for this manager's application.
    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Current bus connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Connections attached to this server.
    pub fn connections(&self) -> &ConnectionStore {
        &self.connections
    }

    /// Local group membership.
    pub fn groups(&self) -> &SubscriptionManager {
        &self.groups
    }

    /// Local user sessions.
    pub fn users(&self) -> &SubscriptionManager {
        &self.users
    }

    /// Build a connection whose outbound queue holds the configured
    /// `send_queue_capacity` frames. Attach it with
    /// [`on_connected`](Self::on_connected).
    pub fn channel_connection(
        &self,
        id: ConnectionId,
        protocol: Arc<dyn HubProtocol>,
    ) -> (ChannelConnection, mpsc::Receiver<Bytes>) {
        ChannelConnection::new(id, protocol, self.send_queue_capacity)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Bus connection
    // ─────────────────────────────────────────────────────────────────────

    /// Subscribe this server's inbound channels if not already subscribed.
    ///
    /// Concurrent callers wait for the same attempt. On failure every
    /// channel subscribed so far is released and the state returns to
    /// [`ConnectionState::Disconnected`].
    pub async fn connect(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(BackplaneError::ShutDown);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let mut inbound = self.inbound.lock().await;
        if self.is_shut_down() {
            return Err(BackplaneError::ShutDown);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!(
            server = %self.server_name,
            application = %self.channels.application_name(),
            connection_string = %self.connection_string,
            "connecting to backplane"
        );

        let targets = [
            (self.channels.invocations(&self.server_name), Inbound::Invocation),
            (self.channels.group_management(&self.server_name), Inbound::GroupCommand),
            (self.channels.ack(&self.server_name), Inbound::Ack),
        ];
        for (name, kind) in targets {
            trace!(channel = %name, "subscribing");
            match self.bus.subscribe(&name).await {
                Ok(channel) => {
                    channel.on_message(self.inbound_handler(kind));
                    inbound.push(channel);
                }
                Err(e) => {
                    error!(channel = %name, error = %e, "backplane connection failed");
                    for channel in inbound.drain(..) {
                        channel.unsubscribe().await;
                    }
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e.into());
                }
            }
        }

        self.set_state(ConnectionState::Connected);
        info!(server = %self.server_name, "connected to backplane");
        Ok(())
    }

    /// Ensure the bus connection before an operation. Transport failures are
    /// already logged by [`connect`](Self::connect) and do not stop the
    /// operation; only shutdown does.
    async fn ready(&self) -> Result<()> {
        match self.connect().await {
            Err(BackplaneError::ShutDown) => Err(BackplaneError::ShutDown),
            _ => Ok(()),
        }
    }

    /// Cancel pending group round trips, unsubscribe every inbound channel
    /// and refuse further operations. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ack_handler.dispose();
        let mut inbound = self.inbound.lock().await;
        for channel in inbound.drain(..) {
            trace!(channel = %channel.name(), "unsubscribing");
            channel.unsubscribe().await;
        }
        self.set_state(ConnectionState::Disconnected);
        info!(server = %self.server_name, "backplane shut down");
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Register a connection that attached to this server.
    pub async fn on_connected(&self, connection: Arc<dyn HubConnection>) -> Result<()> {
        self.ready().await?;
        self.connections.add(Arc::clone(&connection));
        if let Some(user) = connection.user_identifier().map(str::to_owned) {
            self.users
                .add_subscription(&user, connection, |user| async move {
                    trace!(user = %user, "first local session for user");
                })
                .await;
        }
        Ok(())
    }

    /// Forget a connection that left this server, along with its user
    /// session and every group it belonged to.
    pub async fn on_disconnected(&self, connection_id: &ConnectionId) {
        let Some(connection) = self.connections.remove(connection_id) else {
            return;
        };
        if let Some(user) = connection.user_identifier() {
            self.users
                .remove_subscription(user, connection_id, |user| async move {
                    trace!(user = %user, "last local session for user closed");
                })
                .await;
        }
        let groups = self
            .groups
            .remove_connection(connection_id, |group| async move {
                trace!(group = %group, "last local member left group");
            })
            .await;
        debug!(connection_id = %connection_id, groups = groups.len(), "connection removed");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sends
    // ─────────────────────────────────────────────────────────────────────

    /// Invoke `method` on every connection of every server.
    pub async fn send_all(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.publish_invocation(method, args, &InvocationTargets::all())
            .await
    }

    /// Invoke `method` on every connection except `excluded`.
    pub async fn send_all_except(
        &self,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> Result<()> {
        self.publish_invocation(method, args, &InvocationTargets::all_except(excluded.to_vec()))
            .await
    }

    /// Invoke `method` on one connection, wherever it lives.
    pub async fn send_connection(
        &self,
        connection_id: &ConnectionId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        self.ready().await?;
        if let Some(connection) = self.connections.get(connection_id) {
            let message = SerializedHubMessage::new(InvocationMessage::new(method, args));
            return connection
                .write(&message)
                .await
                .map_err(|source| BackplaneError::Delivery {
                    connection_id: connection_id.clone(),
                    source,
                });
        }
        self.publish_invocation(
            method,
            args,
            &InvocationTargets::connections(vec![connection_id.clone()]),
        )
        .await
    }

    /// Invoke `method` on each listed connection. An empty list sends nothing.
    pub async fn send_connections(
        &self,
        connection_ids: &[ConnectionId],
        method: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        if connection_ids.is_empty() {
            return Ok(());
        }
        self.publish_invocation(method, args, &InvocationTargets::connections(connection_ids.to_vec()))
            .await
    }

    /// Invoke `method` on every member of `group`.
    pub async fn send_group(&self, group: &str, method: &str, args: Vec<Value>) -> Result<()> {
        check_name("group", group)?;
        self.publish_invocation(method, args, &InvocationTargets::groups(vec![group.to_owned()], None))
            .await
    }

    /// Invoke `method` on every member of `group` except `excluded`.
    pub async fn send_group_except(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
        excluded: &[ConnectionId],
    ) -> Result<()> {
        check_name("group", group)?;
        let targets = InvocationTargets::groups(vec![group.to_owned()], Some(excluded.to_vec()));
        self.publish_invocation(method, args, &targets).await
    }

    /// Invoke `method` on every member of any listed group. An empty list
    /// sends nothing.
    pub async fn send_groups(&self, groups: &[String], method: &str, args: Vec<Value>) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        self.publish_invocation(method, args, &InvocationTargets::groups(groups.to_vec(), None))
            .await
    }

    /// Invoke `method` on every connection of `user`.
    pub async fn send_user(&self, user: &str, method: &str, args: Vec<Value>) -> Result<()> {
        check_name("user", user)?;
        self.publish_invocation(method, args, &InvocationTargets::users(vec![user.to_owned()]))
            .await
    }

    /// Invoke `method` on every connection of any listed user. An empty list
    /// sends nothing.
    pub async fn send_users(&self, users: &[String], method: &str, args: Vec<Value>) -> Result<()> {
        if users.is_empty() {
            return Ok(());
        }
        self.publish_invocation(method, args, &InvocationTargets::users(users.to_vec()))
            .await
    }

    async fn publish_invocation(
        &self,
        method: &str,
        args: Vec<Value>,
        targets: &InvocationTargets,
    ) -> Result<()> {
        self.ready().await?;
        let payload = self
            .codec
            .write_invocation(&InvocationMessage::new(method, args), targets)?;
        self.publish_to_every(&self.channels.invocations(""), payload)
            .await
    }

    /// Publish `payload` to every channel whose name starts with `prefix`.
    /// Every channel is attempted; the last failure is returned.
    async fn publish_to_every(&self, prefix: &str, payload: Bytes) -> Result<()> {
        let names = self.bus.channel_names().await?;
        let mut last_error = None;
        for name in names.iter().filter(|name| name.starts_with(prefix)) {
            trace!(channel = %name, bytes = payload.len(), "publishing message");
            if let Err(e) = self.bus.publish(name, payload.clone()).await {
                warn!(channel = %name, error = %e, "publish failed");
                last_error = Some(e);
            }
        }
        last_error.map_or(Ok(()), |e| Err(e.into()))
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    /// Add a connection to a group. For a connection on another server this
    /// waits until that server acknowledges or the ack times out.
    pub async fn add_to_group(&self, connection_id: &ConnectionId, group: &str) -> Result<()> {
        self.change_group(GroupAction::Add, connection_id, group).await
    }

    /// Remove a connection from a group. For a connection on another server
    /// this waits until that server acknowledges or the ack times out.
    pub async fn remove_from_group(&self, connection_id: &ConnectionId, group: &str) -> Result<()> {
        self.change_group(GroupAction::Remove, connection_id, group)
            .await
    }

    async fn change_group(
        &self,
        action: GroupAction,
        connection_id: &ConnectionId,
        group: &str,
    ) -> Result<()> {
        check_name("group", group)?;
        check_name("connection id", connection_id.as_str())?;
        self.ready().await?;

        if let Some(connection) = self.connections.get(connection_id) {
            self.apply_group_change(action, group, connection).await;
            return Ok(());
        }
        self.send_group_command(action, connection_id, group).await
    }

    async fn apply_group_change(
        &self,
        action: GroupAction,
        group: &str,
        connection: Arc<dyn HubConnection>,
    ) {
        match action {
            GroupAction::Add => {
                let id = connection.connection_id().clone();
                let _ = self
                    .groups
                    .add_subscription_if(
                        group,
                        connection,
                        || self.connections.contains(&id),
                        |group| async move {
                            trace!(group = %group, "first local member joined group");
                        },
                    )
                    .await;
            }
            GroupAction::Remove => {
                self.groups
                    .remove_subscription(group, connection.connection_id(), |group| async move {
                        trace!(group = %group, "last local member left group");
                    })
                    .await;
            }
        }
    }

    async fn send_group_command(
        &self,
        action: GroupAction,
        connection_id: &ConnectionId,
        group: &str,
    ) -> Result<()> {
        let id = self.next_command_id.fetch_add(1, Ordering::Relaxed) + 1;
        let command = GroupCommand {
            id,
            server_name: self.server_name.clone(),
            action,
            group_name: group.to_owned(),
            connection_id: connection_id.clone(),
        };

        let waiter = self.ack_handler.create_ack(id);
        let payload = self.codec.write_group_command(&command);
        if let Err(e) = self
            .publish_to_every(&self.channels.group_management(""), payload)
            .await
        {
            self.ack_handler.cancel_ack(id);
            return Err(e);
        }

        match waiter.wait().await {
            AckOutcome::Acknowledged => Ok(()),
            AckOutcome::TimedOut => Err(BackplaneError::AckTimeout { ack_id: id }),
            AckOutcome::Cancelled => Err(BackplaneError::AckCancelled { ack_id: id }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────

    fn inbound_handler(&self, kind: Inbound) -> MessageHandler {
        let weak = self.weak_self.clone();
        hubplane_bus::handler(move |message: BusMessage| {
            let weak = weak.clone();
            async move {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_inbound(kind, message).await;
                }
            }
        })
    }

    async fn handle_inbound(&self, kind: Inbound, message: BusMessage) {
        trace!(channel = %message.channel_name, bytes = message.body.len(), "received message");
        let result = match kind {
            Inbound::Invocation => self.handle_invocation(message.body).await,
            Inbound::GroupCommand => self.handle_group_command(message.body).await,
            Inbound::Ack => self.handle_ack(message.body),
        };
        if let Err(e) = result {
            warn!(
                channel = %message.channel_name,
                error = %e,
                kind = e.error_kind(),
                "failed processing internal message"
            );
        }
    }

    async fn handle_invocation(&self, body: Bytes) -> Result<()> {
        let invocation = self.codec.read_invocation(body)?;
        let recipients = self.recipients(&invocation.targets);
        let message = &invocation.message;

        let writes = recipients.iter().map(|connection| async move {
            (connection, connection.write(message).await)
        });
        for (connection, result) in join_all(writes).await {
            if let Err(e) = result {
                debug!(
                    connection_id = %connection.connection_id(),
                    error = %e,
                    "failed writing message"
                );
            }
        }
        Ok(())
    }

    /// Local connections an invocation is for: every connection when no
    /// target list is present, otherwise the union of the listed
    /// connections, group members and user sessions. Excluded ids are
    /// removed either way.
    fn recipients(&self, targets: &InvocationTargets) -> Vec<Arc<dyn HubConnection>> {
        let candidates = if targets.is_restricted() {
            let mut selected: HashMap<ConnectionId, Arc<dyn HubConnection>> = HashMap::new();
            for id in targets.connections.iter().flatten() {
                if let Some(connection) = self.connections.get(id) {
                    let _ = selected.insert(id.clone(), connection);
                }
            }
            let grouped = targets.groups.iter().flatten().map(|g| self.groups.members(g));
            let owned = targets.users.iter().flatten().map(|u| self.users.members(u));
            for connection in grouped.chain(owned).flatten() {
                let _ = selected
                    .entry(connection.connection_id().clone())
                    .or_insert(connection);
            }
            selected.into_values().collect()
        } else {
            self.connections.snapshot()
        };

        candidates
            .into_iter()
            .filter(|connection| !targets.is_excluded(connection.connection_id()))
            .collect()
    }

    async fn handle_group_command(&self, body: Bytes) -> Result<()> {
        let command = self.codec.read_group_command(body)?;
        let Some(connection) = self.connections.get(&command.connection_id) else {
            return Ok(());
        };
        self.apply_group_change(command.action, &command.group_name, connection)
            .await;

        let channel = self.channels.ack(&command.server_name);
        trace!(channel = %channel, ack_id = command.id, "publishing ack");
        self.bus
            .publish(&channel, self.codec.write_ack(command.id))
            .await?;
        Ok(())
    }

    fn handle_ack(&self, body: Bytes) -> Result<()> {
        let id = self.codec.read_ack(body)?;
        self.ack_handler.trigger_ack(id);
        Ok(())
    }
}

fn check_name(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BackplaneError::InvalidArgument(format!("{what} must not be empty")));
    }
    Ok(())
}
