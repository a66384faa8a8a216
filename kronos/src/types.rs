//! Identities, members and the session parameters shared by every module.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{KronosError, Result};

/// Prefix of attribute keys owned by the orchestrator.
pub const RESERVED_PREFIX: &str = "kronos.";
/// Identity of the authoritative host.
pub const HOST_KEY: &str = "kronos.host";
/// Set once the host locks the session.
pub const LOCKED_KEY: &str = "kronos.locked";
/// Set once the host starts the match.
pub const STARTED_KEY: &str = "kronos.started";
/// JSON array of banned identities.
pub const BANNED_KEY: &str = "kronos.banned";
/// Id shared by every incarnation of a session that was recreated after a disconnect.
pub const RECONNECT_KEY: &str = "kronos.reconnect";

/// Platform identity of a player.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identity {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Backend-assigned session id. Opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random id, for backends that do not mint their own.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Placeholder for errors raised before the backend assigned an id.
    pub fn unknown() -> Self {
        Self("<unassigned>".into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The local player holds at most one live session per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    #[default]
    Game,
    Party,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Game => f.write_str("game"),
            Self::Party => f.write_str("party"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    /// Listed in searches.
    #[default]
    Public,
    /// Unlisted, joinable by anyone holding a descriptor.
    Private,
    /// Unlisted, joinable only by invited identities.
    InviteOnly,
}

/// Typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Ordering between comparable values. Ints and floats compare numerically.
    pub fn compare(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

pub type AttributeMap = BTreeMap<String, AttributeValue>;

/// Host identity recorded in the reserved attribute.
pub fn host_of(attributes: &AttributeMap) -> Option<Identity> {
    attributes.get(HOST_KEY).and_then(|v| v.as_str()).map(Identity::new)
}

pub fn flag(attributes: &AttributeMap, key: &str) -> bool {
    attributes.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn banned_of(attributes: &AttributeMap) -> Vec<Identity> {
    attributes
        .get(BANNED_KEY)
        .and_then(|v| v.as_str())
        .and_then(|list| serde_json::from_str(list).ok())
        .unwrap_or_default()
}

/// Banned list with `identity` appended, ready to write back.
pub fn banned_with(attributes: &AttributeMap, identity: &Identity) -> AttributeValue {
    let mut banned = banned_of(attributes);
    if !banned.contains(identity) {
        banned.push(identity.clone());
    }
    // A list of strings always serializes.
    AttributeValue::Str(serde_json::to_string(&banned).unwrap_or_default())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Stale,
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Host,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub identity: Identity,
    pub connection: ConnectionState,
    /// Backend timestamp, milliseconds.
    pub joined_at: u64,
    pub role: MemberRole,
}

impl Member {
    pub fn new(identity: Identity, joined_at: u64) -> Self {
        Self {
            identity,
            connection: ConnectionState::Connected,
            joined_at,
            role: MemberRole::Participant,
        }
    }
}

/// Parameters for creating a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    pub kind: SessionKind,
    pub capacity: usize,
    pub visibility: Visibility,
    pub attributes: AttributeMap,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            kind: SessionKind::Game,
            capacity: 4,
            visibility: Visibility::Public,
            attributes: AttributeMap::new(),
        }
    }
}

impl SessionParams {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn kind(mut self, kind: SessionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(KronosError::invalid_params("capacity must be at least 1"));
        }
        validate_attribute_keys(&self.attributes)
    }
}

/// Application attribute keys must be non-empty and outside the reserved namespace.
pub fn validate_attribute_keys(attributes: &AttributeMap) -> Result<()> {
    for key in attributes.keys() {
        if key.is_empty() {
            return Err(KronosError::invalid_params("empty attribute key"));
        }
        if key.starts_with(RESERVED_PREFIX) {
            return Err(KronosError::invalid_params(format!(
                "attribute key {key} is reserved"
            )));
        }
    }
    Ok(())
}

/// What a search returns: enough to decide on and issue a join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub kind: SessionKind,
    pub owner: Identity,
    pub capacity: usize,
    pub open_slots: usize,
    pub visibility: Visibility,
    pub attributes: AttributeMap,
}

impl SessionDescriptor {
    pub fn host(&self) -> Option<Identity> {
        host_of(&self.attributes)
    }

    pub fn is_banned(&self, identity: &Identity) -> bool {
        banned_of(&self.attributes).contains(identity)
    }
}
