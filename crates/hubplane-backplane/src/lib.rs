//! # hubplane-backplane
//!
//! Makes several server processes behave as one broadcast domain. Each
//! server owns a set of live connections; messages addressed to all
//! connections, a group, a user or one connection reach the right clients
//! whichever server they are attached to.
//!
//! - [`channels`]: deterministic channel names per purpose and server
//! - [`codec`]: binary encoding of invocations, group commands and acks
//! - [`ack`]: pending acknowledgments with a periodic expiry sweep
//! - [`subscription`]: per-key member sets with first/last transition callbacks
//! - [`lifetime`]: the [`HubLifetimeManager`] routing local vs. remote delivery

#![deny(unsafe_code)]

pub mod ack;
pub mod channels;
pub mod codec;
pub mod error;
pub mod lifetime;
pub mod subscription;

pub use ack::{AckHandler, AckOutcome, AckWaiter};
pub use channels::ChannelNames;
pub use codec::{
    BackplaneInvocation, BackplaneProtocol, GroupAction, GroupCommand, InvocationTargets,
};
pub use error::{BackplaneError, Result};
pub use lifetime::{ConnectionState, HubLifetimeManager};
pub use subscription::SubscriptionManager;
