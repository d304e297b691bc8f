//! Strongly-typed identifiers shared across the cluster.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::CoreError;

/// Identity of a cluster member.
///
/// Ordering follows the underlying UUID so member sets iterate deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Create a new random member ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a member ID from an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parse a member ID from its string form.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0.simple().to_string();
        write!(f, "member_{}", &s[..8])
    }
}

/// Lineage of a database store.
///
/// Two stores with different IDs never share history, so catch-up between
/// them is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Creation time in milliseconds since the Unix epoch.
    pub creation_time: u64,
    /// Random component chosen at creation.
    pub random_id: u64,
}

impl StoreId {
    /// Create a store ID from its parts.
    pub fn new(creation_time: u64, random_id: u64) -> Self {
        Self {
            creation_time,
            random_id,
        }
    }

    /// Create a fresh store ID stamped with the current time.
    pub fn generate() -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            creation_time,
            random_id: rand::random(),
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store_{}_{:016x}", self.creation_time, self.random_id)
    }
}

/// Kinds of identifiers handed out by the id-allocation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdType {
    /// Node record ids.
    Node = 0,
    /// Relationship record ids.
    Relationship = 1,
    /// Property record ids.
    Property = 2,
    /// Label token ids.
    LabelToken = 3,
    /// Relationship type token ids.
    RelationshipTypeToken = 4,
    /// Property key token ids.
    PropertyKeyToken = 5,
    /// Schema rule ids.
    Schema = 6,
}

impl IdType {
    /// Every id type, in tag order.
    pub const ALL: [IdType; 7] = [
        IdType::Node,
        IdType::Relationship,
        IdType::Property,
        IdType::LabelToken,
        IdType::RelationshipTypeToken,
        IdType::PropertyKeyToken,
        IdType::Schema,
    ];

    /// The on-wire tag of this id type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for IdType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        IdType::ALL
            .get(value as usize)
            .copied()
            .ok_or(CoreError::UnknownTag {
                kind: "id type",
                tag: value,
            })
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdType::Node => "node",
            IdType::Relationship => "relationship",
            IdType::Property => "property",
            IdType::LabelToken => "label_token",
            IdType::RelationshipTypeToken => "relationship_type_token",
            IdType::PropertyKeyToken => "property_key_token",
            IdType::Schema => "schema",
        };
        f.write_str(name)
    }
}

/// A position in the replicated log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Log index.
    pub index: u64,
    /// Term of the entry at `index`.
    pub term: u64,
}

impl LogPosition {
    /// The position before any entry.
    pub const ZERO: LogPosition = LogPosition { index: 0, term: 0 };

    /// Create a log position.
    pub fn new(index: u64, term: u64) -> Self {
        Self { index, term }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.index, self.term)
    }
}

/// Read-only view of how far a component has progressed through the log.
///
/// Components share progress through this accessor instead of holding
/// references into one another.
pub trait IndexTracker: Send + Sync {
    /// The highest log index this component has durably handled.
    fn current_index(&self) -> u64;
}
