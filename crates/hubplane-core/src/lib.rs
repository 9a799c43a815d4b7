//! # hubplane-core
//!
//! Foundation types shared by every hubplane crate:
//!
//! - **Ids**: [`ConnectionId`] newtype for live client sessions
//! - **Errors**: [`DecodeError`], [`DeliveryError`], [`ProtocolError`] via `thiserror`
//! - **Messages**: [`InvocationMessage`] and the per-protocol [`SerializedHubMessage`] cache
//! - **Protocols**: the [`HubProtocol`] capability trait and [`JsonHubProtocol`]
//! - **Connections**: the [`HubConnection`] trait, [`ChannelConnection`] and [`ConnectionStore`]
//! - **Logging**: `tracing` subscriber setup and log capture for tests

#![deny(unsafe_code)]

pub mod connection;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;
pub mod protocol;

pub use connection::{ChannelConnection, ConnectionStore, HubConnection};
pub use errors::{DecodeError, DeliveryError, ProtocolError};
pub use ids::ConnectionId;
pub use messages::{InvocationMessage, SerializedHubMessage};
pub use protocol::{HubProtocol, JsonHubProtocol};
