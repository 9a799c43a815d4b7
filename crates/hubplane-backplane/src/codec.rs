//! Binary encoding of cross-server messages.
//!
//! Three payload kinds travel between servers:
//!
//! - **Invocation**: a client-bound call, pre-serialized once per registered
//!   hub protocol, plus four optional id lists that restrict or exclude
//!   recipients
//! - **Group command**: add or remove a connection to/from a group on
//!   whichever server owns the connection
//! - **Ack**: confirms a group command was applied
//!
//! Every payload starts with a version byte. Integers are big-endian and
//! strings are a `u32` length followed by UTF-8. An optional list is a
//! presence byte (0 absent, 1 present) followed by a `u32` count and the
//! strings, so an absent list ("no restriction") and an empty list
//! ("nothing matches") stay distinct.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use hubplane_core::{
    ConnectionId, DecodeError, HubProtocol, InvocationMessage, ProtocolError,
    SerializedHubMessage,
};
use serde_json::Value;

/// Current payload version.
pub const PAYLOAD_VERSION: u8 = 1;

const ABSENT: u8 = 0;
const PRESENT: u8 = 1;

/// Recipient restrictions carried with an invocation.
///
/// `None` means "no restriction" for the three target lists and "exclude
/// nobody" for the exclusion list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InvocationTargets {
    /// Only these connections.
    pub connections: Option<Vec<ConnectionId>>,
    /// Only members of these groups.
    pub groups: Option<Vec<String>>,
    /// Only connections of these users.
    pub users: Option<Vec<String>>,
    /// Never these connections.
    pub excluded_connection_ids: Option<Vec<ConnectionId>>,
}

impl InvocationTargets {
    /// Every connection.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every connection except `excluded`.
    pub fn all_except(excluded: Vec<ConnectionId>) -> Self {
        Self {
            excluded_connection_ids: Some(excluded),
            ..Self::default()
        }
    }

    /// Only the listed connections.
    pub fn connections(ids: Vec<ConnectionId>) -> Self {
        Self {
            connections: Some(ids),
            ..Self::default()
        }
    }

    /// Members of the listed groups, minus `excluded`.
    pub fn groups(groups: Vec<String>, excluded: Option<Vec<ConnectionId>>) -> Self {
        Self {
            groups: Some(groups),
            excluded_connection_ids: excluded,
            ..Self::default()
        }
    }

    /// Connections of the listed users.
    pub fn users(users: Vec<String>) -> Self {
        Self {
            users: Some(users),
            ..Self::default()
        }
    }

    /// Whether any of the three target lists is present.
    pub fn is_restricted(&self) -> bool {
        self.connections.is_some() || self.groups.is_some() || self.users.is_some()
    }

    /// Whether `id` is on the exclusion list.
    pub fn is_excluded(&self, id: &ConnectionId) -> bool {
        self.excluded_connection_ids
            .as_ref()
            .is_some_and(|excluded| excluded.contains(id))
    }
}

/// A decoded invocation.
#[derive(Debug)]
pub struct BackplaneInvocation {
    /// Recipient restrictions.
    pub targets: InvocationTargets,
    /// The call and its per-protocol serialized forms.
    pub message: SerializedHubMessage,
}

/// Group membership change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupAction {
    /// Add the connection to the group.
    Add,
    /// Remove the connection from the group.
    Remove,
}

impl GroupAction {
    fn to_byte(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Remove => 1,
        }
    }

    fn from_byte(b: u8) -> Result<Self, DecodeError> {
        match b {
            0 => Ok(Self::Add),
            1 => Ok(Self::Remove),
            other => Err(DecodeError::UnknownGroupAction(other)),
        }
    }
}

/// A group change for a connection that may live on another server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupCommand {
    /// Issuer-scoped command id, echoed back in the ack.
    pub id: u64,
    /// Server that issued the command and waits for the ack.
    pub server_name: String,
    /// What to do.
    pub action: GroupAction,
    /// Group to change.
    pub group_name: String,
    /// Connection to add or remove.
    pub connection_id: ConnectionId,
}

/// Encodes and decodes backplane payloads for a fixed set of hub protocols.
#[derive(Clone)]
pub struct BackplaneProtocol {
    protocols: Vec<Arc<dyn HubProtocol>>,
}

impl BackplaneProtocol {
    /// Codec that pre-serializes invocations for each of `protocols`.
    pub fn new(protocols: Vec<Arc<dyn HubProtocol>>) -> Self {
        Self { protocols }
    }

    /// The registered hub protocols.
    pub fn protocols(&self) -> &[Arc<dyn HubProtocol>] {
        &self.protocols
    }

    /// Encode an invocation, serializing `message` once per registered protocol.
    pub fn write_invocation(
        &self,
        message: &InvocationMessage,
        targets: &InvocationTargets,
    ) -> Result<Bytes, ProtocolError> {
        let arguments = serde_json::to_vec(&message.arguments)?;
        let serialized = SerializedHubMessage::new(message.clone());

        let mut buf = BytesMut::new();
        buf.put_u8(PAYLOAD_VERSION);
        put_str(&mut buf, &message.target);
        put_bytes(&mut buf, &arguments);
        put_id_list(&mut buf, targets.connections.as_deref());
        put_str_list(&mut buf, targets.groups.as_deref());
        put_str_list(&mut buf, targets.users.as_deref());
        put_id_list(&mut buf, targets.excluded_connection_ids.as_deref());

        put_len(&mut buf, self.protocols.len());
        for protocol in &self.protocols {
            let bytes = serialized.serialized_for(protocol.as_ref())?;
            put_str(&mut buf, protocol.name());
            put_bytes(&mut buf, &bytes);
        }
        Ok(buf.freeze())
    }

    /// Decode an invocation written by [`write_invocation`](Self::write_invocation).
    pub fn read_invocation(&self, payload: Bytes) -> Result<BackplaneInvocation, DecodeError> {
        let mut reader = Reader::new(payload);
        reader.version()?;
        let target = reader.string("target")?;
        let arguments_json = reader.bytes("arguments")?;
        let arguments: Vec<Value> = serde_json::from_slice(&arguments_json)
            .map_err(|e| DecodeError::InvalidArguments(e.to_string()))?;

        let connections = reader
            .optional_list("connections")?
            .map(|ids| ids.into_iter().map(ConnectionId::from).collect());
        let groups = reader.optional_list("groups")?;
        let users = reader.optional_list("users")?;
        let excluded_connection_ids = reader
            .optional_list("excluded connections")?
            .map(|ids| ids.into_iter().map(ConnectionId::from).collect());

        let count = reader.count("protocol count")?;
        let mut serialized = Vec::with_capacity(count);
        for _ in 0..count {
            let name = reader.string("protocol name")?;
            let bytes = reader.bytes("serialized message")?;
            serialized.push((name, bytes));
        }
        reader.finish()?;

        Ok(BackplaneInvocation {
            targets: InvocationTargets {
                connections,
                groups,
                users,
                excluded_connection_ids,
            },
            message: SerializedHubMessage::with_serialized(
                InvocationMessage { target, arguments },
                serialized,
            ),
        })
    }

    /// Encode a group command.
    pub fn write_group_command(&self, command: &GroupCommand) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(PAYLOAD_VERSION);
        buf.put_u64(command.id);
        put_str(&mut buf, &command.server_name);
        buf.put_u8(command.action.to_byte());
        put_str(&mut buf, &command.group_name);
        put_str(&mut buf, command.connection_id.as_str());
        buf.freeze()
    }

    /// Decode a group command.
    pub fn read_group_command(&self, payload: Bytes) -> Result<GroupCommand, DecodeError> {
        let mut reader = Reader::new(payload);
        reader.version()?;
        let id = reader.u64("command id")?;
        let server_name = reader.string("server name")?;
        let action = GroupAction::from_byte(reader.u8("group action")?)?;
        let group_name = reader.string("group name")?;
        let connection_id = ConnectionId::from(reader.string("connection id")?);
        reader.finish()?;
        Ok(GroupCommand {
            id,
            server_name,
            action,
            group_name,
            connection_id,
        })
    }

    /// Encode an ack for command `id`.
    pub fn write_ack(&self, id: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(PAYLOAD_VERSION);
        buf.put_u64(id);
        buf.freeze()
    }

    /// Decode an ack, returning the acknowledged command id.
    pub fn read_ack(&self, payload: Bytes) -> Result<u64, DecodeError> {
        let mut reader = Reader::new(payload);
        reader.version()?;
        let id = reader.u64("ack id")?;
        reader.finish()?;
        Ok(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Writing
// ─────────────────────────────────────────────────────────────────────────────

// Names, ids and serialized invocations are bounded far below u32::MAX.
#[allow(clippy::cast_possible_truncation)]
fn put_len(buf: &mut BytesMut, len: usize) {
    buf.put_u32(len as u32);
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_len(buf, bytes.len());
    buf.extend_from_slice(bytes);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_str_list(buf: &mut BytesMut, list: Option<&[String]>) {
    match list {
        None => buf.put_u8(ABSENT),
        Some(items) => {
            buf.put_u8(PRESENT);
            put_len(buf, items.len());
            for item in items {
                put_str(buf, item);
            }
        }
    }
}

fn put_id_list(buf: &mut BytesMut, list: Option<&[ConnectionId]>) {
    match list {
        None => buf.put_u8(ABSENT),
        Some(items) => {
            buf.put_u8(PRESENT);
            put_len(buf, items.len());
            for item in items {
                put_str(buf, item.as_str());
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reading
// ─────────────────────────────────────────────────────────────────────────────

struct Reader {
    buf: Bytes,
}

impl Reader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn version(&mut self) -> Result<(), DecodeError> {
        match self.u8("version")? {
            PAYLOAD_VERSION => Ok(()),
            other => Err(DecodeError::UnknownVersion(other)),
        }
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        if self.buf.remaining() < 1 {
            return Err(DecodeError::UnexpectedEof(what));
        }
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        if self.buf.remaining() < 4 {
            return Err(DecodeError::UnexpectedEof(what));
        }
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, what: &'static str) -> Result<u64, DecodeError> {
        if self.buf.remaining() < 8 {
            return Err(DecodeError::UnexpectedEof(what));
        }
        Ok(self.buf.get_u64())
    }

    /// An element count, capped so a corrupt count cannot force a huge
    /// allocation: every element needs at least its 4-byte length prefix.
    fn count(&mut self, what: &'static str) -> Result<usize, DecodeError> {
        let count = self.u32(what)? as usize;
        if count > self.buf.remaining() / 4 {
            return Err(DecodeError::UnexpectedEof(what));
        }
        Ok(count)
    }

    fn bytes(&mut self, what: &'static str) -> Result<Bytes, DecodeError> {
        let len = self.u32(what)? as usize;
        if self.buf.remaining() < len {
            return Err(DecodeError::UnexpectedEof(what));
        }
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        let bytes = self.bytes(what)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(what))
    }

    fn optional_list(&mut self, what: &'static str) -> Result<Option<Vec<String>>, DecodeError> {
        match self.u8(what)? {
            ABSENT => Ok(None),
            PRESENT => {
                let count = self.count(what)?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.string(what)?);
                }
                Ok(Some(items))
            }
            other => Err(DecodeError::InvalidPresenceFlag(other)),
        }
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
