//! Replicated commands - content carried by raft log entries.
//!
//! Each command declares a content type tag that is written next to its
//! payload in the log, and that the dispatcher uses to route the command to
//! the state machine owning it.

use causal_core::{CoreError, IdType, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::ClusterResult;

/// On-disk tag identifying the kind of replicated content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    /// Marker appended by a new leader.
    NewLeaderBarrier = 0,
    /// Raft membership change.
    MemberSet = 1,
    /// Id range allocation.
    IdAllocation = 2,
    /// Lock token acquisition.
    LockToken = 3,
    /// Committed store transaction.
    Transaction = 4,
    /// Session-tagged wrapper around another command.
    DistributedOperation = 5,
}

impl TryFrom<u8> for ContentType {
    type Error = CoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::NewLeaderBarrier),
            1 => Ok(Self::MemberSet),
            2 => Ok(Self::IdAllocation),
            3 => Ok(Self::LockToken),
            4 => Ok(Self::Transaction),
            5 => Ok(Self::DistributedOperation),
            _ => Err(CoreError::UnknownTag {
                kind: "content type",
                tag: value,
            }),
        }
    }
}

/// A set of cluster members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSet {
    /// The members.
    pub members: BTreeSet<MemberId>,
}

impl MemberSet {
    /// Build a member set.
    pub fn new(members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            members: members.into_iter().collect(),
        }
    }
}

/// Request to take `[range_start, range_start + range_length)` of an id space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocationRequest {
    /// Requesting member.
    pub owner: MemberId,
    /// Which id space.
    pub id_type: IdType,
    /// First id of the range.
    pub range_start: u64,
    /// Number of ids.
    pub range_length: u64,
}

/// Request to become the lock token holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockTokenRequest {
    /// Requesting member.
    pub owner: MemberId,
    /// Proposed token id; must be one past the current token.
    pub candidate_id: u64,
}

/// An opaque store transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedTransaction {
    /// Serialized transaction as produced by the store.
    pub tx: Vec<u8>,
}

/// A client session spanning the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalSession {
    /// Globally unique session id.
    pub session_id: Uuid,
    /// Member that created the session.
    pub owner: MemberId,
}

impl GlobalSession {
    /// Start a fresh session owned by `owner`.
    pub fn new(owner: MemberId) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            owner,
        }
    }
}

/// Position of an operation within a local session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalOperationId {
    /// Local session on the owning member.
    pub local_session_id: u64,
    /// Strictly increasing per local session.
    pub sequence_number: u64,
}

impl LocalOperationId {
    /// Build an operation id.
    pub fn new(local_session_id: u64, sequence_number: u64) -> Self {
        Self {
            local_session_id,
            sequence_number,
        }
    }
}

/// A command submitted through a client session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedOperation {
    /// Submitting session.
    pub session: GlobalSession,
    /// Operation position in the session.
    pub operation_id: LocalOperationId,
    /// The wrapped command.
    pub content: Box<ReplicatedContent>,
}

/// Content of a raft log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicatedContent {
    /// Marker appended by a new leader; applies to nothing.
    NewLeaderBarrier,
    /// Raft membership change.
    MemberSet(MemberSet),
    /// Id range allocation.
    IdAllocation(IdAllocationRequest),
    /// Lock token acquisition.
    LockToken(LockTokenRequest),
    /// Store transaction.
    Transaction(ReplicatedTransaction),
    /// Session-tagged command.
    DistributedOperation(DistributedOperation),
}

impl ReplicatedContent {
    /// The content type tag.
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::NewLeaderBarrier => ContentType::NewLeaderBarrier,
            Self::MemberSet(_) => ContentType::MemberSet,
            Self::IdAllocation(_) => ContentType::IdAllocation,
            Self::LockToken(_) => ContentType::LockToken,
            Self::Transaction(_) => ContentType::Transaction,
            Self::DistributedOperation(_) => ContentType::DistributedOperation,
        }
    }

    /// Wrap in a session-tagged operation.
    pub fn in_session(self, session: GlobalSession, operation_id: LocalOperationId) -> Self {
        Self::DistributedOperation(DistributedOperation {
            session,
            operation_id,
            content: Box::new(self),
        })
    }

    /// Encode the payload that follows the content type tag.
    pub fn encode_payload(&self) -> ClusterResult<Vec<u8>> {
        let payload = match self {
            Self::NewLeaderBarrier => Vec::new(),
            Self::MemberSet(set) => serde_json::to_vec(set)?,
            Self::IdAllocation(req) => serde_json::to_vec(req)?,
            Self::LockToken(req) => serde_json::to_vec(req)?,
            Self::Transaction(tx) => tx.tx.clone(),
            Self::DistributedOperation(op) => serde_json::to_vec(op)?,
        };
        Ok(payload)
    }

    /// Decode a payload written by [`ReplicatedContent::encode_payload`].
    pub fn decode(content_type: ContentType, payload: &[u8]) -> ClusterResult<Self> {
        let content = match content_type {
            ContentType::NewLeaderBarrier => Self::NewLeaderBarrier,
            ContentType::MemberSet => Self::MemberSet(serde_json::from_slice(payload)?),
            ContentType::IdAllocation => Self::IdAllocation(serde_json::from_slice(payload)?),
            ContentType::LockToken => Self::LockToken(serde_json::from_slice(payload)?),
            ContentType::Transaction => Self::Transaction(ReplicatedTransaction {
                tx: payload.to_vec(),
            }),
            ContentType::DistributedOperation => {
                Self::DistributedOperation(serde_json::from_slice(payload)?)
            }
        };
        Ok(content)
    }
}
