//! Catch-up wire format.
//!
//! Every message travels in one frame:
//!
//! ```text
//! +------------+---------+-----------------+---------+
//! | Length (4) | Type(1) | Correlation (8) | Body    |
//! +------------+---------+-----------------+---------+
//! ```
//!
//! Integers are little-endian. `Length` counts everything after itself.
//! Responses carry the correlation id of the request they answer; a request
//! answered by a stream (entries, transactions) reuses it for every frame of
//! the stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use causal_core::StoreId;

use crate::command::{ContentType, ReplicatedContent};
use crate::error::{ClusterError, ClusterResult, RejectionKind};
use crate::state::CoreSnapshot;
use crate::store::CommittedTransaction;
use crate::types::LogEntry;

/// Bytes preceding the body.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 8;

const LENGTH_FIELD_LEN: usize = 4;

/// Item count leading every batch body.
const BATCH_COUNT_LEN: usize = 4;

/// Message type tags.
pub mod message_type {
    /// Ask for the server's store id.
    pub const GET_STORE_ID: u8 = 0x01;
    /// Ask for a core snapshot.
    pub const GET_CORE_SNAPSHOT: u8 = 0x02;
    /// Ask for log entries from an index.
    pub const GET_LOG_ENTRIES: u8 = 0x03;
    /// Ask for committed store transactions after a tx id.
    pub const PULL_TRANSACTIONS: u8 = 0x04;

    /// Store id answer.
    pub const STORE_ID: u8 = 0x41;
    /// Core snapshot answer.
    pub const CORE_SNAPSHOT: u8 = 0x42;
    /// One batch of log entries.
    pub const LOG_ENTRIES_BATCH: u8 = 0x43;
    /// End of a log entry stream.
    pub const CAUGHT_UP: u8 = 0x44;
    /// One batch of store transactions.
    pub const TRANSACTION_BATCH: u8 = 0x45;
    /// End of a transaction stream.
    pub const TRANSACTIONS_FINISHED: u8 = 0x46;
    /// Request rejected.
    pub const ERROR: u8 = 0x7F;
}

/// One framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type tag.
    pub message_type: u8,
    /// Request this frame belongs to.
    pub correlation_id: u64,
    /// Type-specific body.
    pub body: Bytes,
}

/// Splits a byte stream into frames and back.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Codec refusing frames longer than `max_frame_size` bytes.
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Room left for a batch's items once frame header and item count are
    /// accounted for.
    pub fn batch_budget(&self) -> usize {
        self.max_frame_size
            .saturating_sub(FRAME_HEADER_LEN - LENGTH_FIELD_LEN + BATCH_COUNT_LEN)
    }

    /// Append `frame` to `dst`.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) -> ClusterResult<()> {
        let len = FRAME_HEADER_LEN - LENGTH_FIELD_LEN + frame.body.len();
        if len > self.max_frame_size {
            return Err(ClusterError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_size
            )));
        }
        dst.reserve(LENGTH_FIELD_LEN + len);
        dst.put_u32_le(len as u32);
        dst.put_u8(frame.message_type);
        dst.put_u64_le(frame.correlation_id);
        dst.put_slice(&frame.body);
        Ok(())
    }

    /// Take one complete frame off the front of `src`, or `None` if more
    /// bytes are needed.
    pub fn decode(&self, src: &mut BytesMut) -> ClusterResult<Option<Frame>> {
        if src.len() < LENGTH_FIELD_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len < FRAME_HEADER_LEN - LENGTH_FIELD_LEN {
            return Err(ClusterError::Protocol(format!(
                "frame length {len} shorter than header"
            )));
        }
        if len > self.max_frame_size {
            return Err(ClusterError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_size
            )));
        }
        if src.len() < LENGTH_FIELD_LEN + len {
            src.reserve(LENGTH_FIELD_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_FIELD_LEN);
        let message_type = src.get_u8();
        let correlation_id = src.get_u64_le();
        let body = src
            .split_to(len - (FRAME_HEADER_LEN - LENGTH_FIELD_LEN))
            .freeze();
        Ok(Some(Frame {
            message_type,
            correlation_id,
            body,
        }))
    }
}

/// Requests a catching-up member sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchupRequest {
    /// Which store lineage does the server hold?
    GetStoreId,
    /// Latest core snapshot of a store with the expected lineage.
    GetCoreSnapshot {
        /// Lineage the client belongs to.
        expected_store_id: StoreId,
    },
    /// Applied log entries from `from_index` onwards.
    GetLogEntries {
        /// Lineage the client belongs to.
        expected_store_id: StoreId,
        /// First index wanted.
        from_index: u64,
    },
    /// Committed store transactions after `since_tx_id`.
    PullTransactions {
        /// Lineage the client belongs to.
        expected_store_id: StoreId,
        /// Last transaction the client already has.
        since_tx_id: u64,
    },
}

impl CatchupRequest {
    /// Frame this request under `correlation_id`.
    pub fn to_frame(&self, correlation_id: u64) -> Frame {
        let mut body = BytesMut::new();
        let message_type = match self {
            Self::GetStoreId => message_type::GET_STORE_ID,
            Self::GetCoreSnapshot { expected_store_id } => {
                put_store_id(&mut body, *expected_store_id);
                message_type::GET_CORE_SNAPSHOT
            }
            Self::GetLogEntries {
                expected_store_id,
                from_index,
            } => {
                put_store_id(&mut body, *expected_store_id);
                body.put_u64_le(*from_index);
                message_type::GET_LOG_ENTRIES
            }
            Self::PullTransactions {
                expected_store_id,
                since_tx_id,
            } => {
                put_store_id(&mut body, *expected_store_id);
                body.put_u64_le(*since_tx_id);
                message_type::PULL_TRANSACTIONS
            }
        };
        Frame {
            message_type,
            correlation_id,
            body: body.freeze(),
        }
    }

    /// Parse a request frame. Unknown types yield
    /// [`ClusterError::UnknownMessage`].
    pub fn from_frame(frame: &Frame) -> ClusterResult<Self> {
        let mut body = frame.body.clone();
        let request = match frame.message_type {
            message_type::GET_STORE_ID => Self::GetStoreId,
            message_type::GET_CORE_SNAPSHOT => Self::GetCoreSnapshot {
                expected_store_id: get_store_id(&mut body)?,
            },
            message_type::GET_LOG_ENTRIES => Self::GetLogEntries {
                expected_store_id: get_store_id(&mut body)?,
                from_index: get_u64(&mut body, "from index")?,
            },
            message_type::PULL_TRANSACTIONS => Self::PullTransactions {
                expected_store_id: get_store_id(&mut body)?,
                since_tx_id: get_u64(&mut body, "since tx id")?,
            },
            other => {
                return Err(ClusterError::UnknownMessage {
                    correlation_id: frame.correlation_id,
                    message_type: other,
                })
            }
        };
        expect_consumed(&body)?;
        Ok(request)
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetStoreId => "GetStoreId",
            Self::GetCoreSnapshot { .. } => "GetCoreSnapshot",
            Self::GetLogEntries { .. } => "GetLogEntries",
            Self::PullTransactions { .. } => "PullTransactions",
        }
    }
}

/// Responses a serving member sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchupResponse {
    /// Store lineage of the server.
    StoreId(StoreId),
    /// A core snapshot.
    CoreSnapshot(CoreSnapshot),
    /// Consecutive log entries.
    LogEntriesBatch(Vec<LogEntry>),
    /// No more entries; the server has applied through `last_index`.
    CaughtUp {
        /// Server's applied index when the stream ended.
        last_index: u64,
    },
    /// Consecutive store transactions.
    TransactionBatch(Vec<CommittedTransaction>),
    /// No more transactions.
    TransactionsFinished {
        /// Server's last committed tx id when the stream ended.
        last_tx_id: u64,
    },
    /// The request was refused.
    Error {
        /// Why.
        kind: RejectionKind,
        /// Human readable detail.
        message: String,
    },
}

impl CatchupResponse {
    /// Rejection helper.
    pub fn error(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Body bytes `entry` takes inside a [`CatchupResponse::LogEntriesBatch`].
    pub fn entry_len(entry: &LogEntry) -> ClusterResult<usize> {
        Ok(8 + 8 + 1 + 4 + entry.content.encode_payload()?.len())
    }

    /// Body bytes `tx` takes inside a [`CatchupResponse::TransactionBatch`].
    pub fn transaction_len(tx: &CommittedTransaction) -> usize {
        8 + 8 + 4 + tx.payload.len()
    }

    /// Frame this response under `correlation_id`.
    pub fn to_frame(&self, correlation_id: u64) -> ClusterResult<Frame> {
        let mut body = BytesMut::new();
        let message_type = match self {
            Self::StoreId(store_id) => {
                put_store_id(&mut body, *store_id);
                message_type::STORE_ID
            }
            Self::CoreSnapshot(snapshot) => {
                body.put_slice(&snapshot.to_bytes()?);
                message_type::CORE_SNAPSHOT
            }
            Self::LogEntriesBatch(entries) => {
                body.put_u32_le(entries.len() as u32);
                for entry in entries {
                    let payload = entry.content.encode_payload()?;
                    body.put_u64_le(entry.index);
                    body.put_u64_le(entry.term);
                    body.put_u8(entry.content.content_type() as u8);
                    body.put_u32_le(payload.len() as u32);
                    body.put_slice(&payload);
                }
                message_type::LOG_ENTRIES_BATCH
            }
            Self::CaughtUp { last_index } => {
                body.put_u64_le(*last_index);
                message_type::CAUGHT_UP
            }
            Self::TransactionBatch(transactions) => {
                body.put_u32_le(transactions.len() as u32);
                for tx in transactions {
                    body.put_u64_le(tx.tx_id);
                    body.put_u64_le(tx.log_index);
                    body.put_u32_le(tx.payload.len() as u32);
                    body.put_slice(&tx.payload);
                }
                message_type::TRANSACTION_BATCH
            }
            Self::TransactionsFinished { last_tx_id } => {
                body.put_u64_le(*last_tx_id);
                message_type::TRANSACTIONS_FINISHED
            }
            Self::Error { kind, message } => {
                body.put_u8(*kind as u8);
                body.put_slice(message.as_bytes());
                message_type::ERROR
            }
        };
        Ok(Frame {
            message_type,
            correlation_id,
            body: body.freeze(),
        })
    }

    /// Parse a response frame. Unknown types yield
    /// [`ClusterError::UnknownMessage`].
    pub fn from_frame(frame: &Frame) -> ClusterResult<Self> {
        let mut body = frame.body.clone();
        let response = match frame.message_type {
            message_type::STORE_ID => Self::StoreId(get_store_id(&mut body)?),
            message_type::CORE_SNAPSHOT => {
                let snapshot = CoreSnapshot::from_bytes(&body)?;
                body.advance(body.remaining());
                Self::CoreSnapshot(snapshot)
            }
            message_type::LOG_ENTRIES_BATCH => {
                let count = get_u32(&mut body, "entry count")?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let index = get_u64(&mut body, "entry index")?;
                    let term = get_u64(&mut body, "entry term")?;
                    let content_type = ContentType::try_from(get_u8(&mut body, "content type")?)?;
                    let payload = get_bytes(&mut body, "entry payload")?;
                    let content = ReplicatedContent::decode(content_type, &payload)?;
                    entries.push(LogEntry::new(index, term, content));
                }
                Self::LogEntriesBatch(entries)
            }
            message_type::CAUGHT_UP => Self::CaughtUp {
                last_index: get_u64(&mut body, "last index")?,
            },
            message_type::TRANSACTION_BATCH => {
                let count = get_u32(&mut body, "transaction count")?;
                let mut transactions = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let tx_id = get_u64(&mut body, "tx id")?;
                    let log_index = get_u64(&mut body, "tx log index")?;
                    let payload = get_bytes(&mut body, "tx payload")?;
                    transactions.push(CommittedTransaction {
                        tx_id,
                        log_index,
                        payload: payload.to_vec(),
                    });
                }
                Self::TransactionBatch(transactions)
            }
            message_type::TRANSACTIONS_FINISHED => Self::TransactionsFinished {
                last_tx_id: get_u64(&mut body, "last tx id")?,
            },
            message_type::ERROR => {
                let tag = get_u8(&mut body, "rejection kind")?;
                let kind = RejectionKind::from_u8(tag).ok_or_else(|| {
                    ClusterError::Protocol(format!("unknown rejection kind {tag}"))
                })?;
                let message = String::from_utf8_lossy(&body).into_owned();
                body.advance(body.remaining());
                Self::Error { kind, message }
            }
            other => {
                return Err(ClusterError::UnknownMessage {
                    correlation_id: frame.correlation_id,
                    message_type: other,
                })
            }
        };
        expect_consumed(&body)?;
        Ok(response)
    }
}

fn put_store_id(buf: &mut BytesMut, store_id: StoreId) {
    buf.put_u64_le(store_id.creation_time);
    buf.put_u64_le(store_id.random_id);
}

fn get_store_id(buf: &mut Bytes) -> ClusterResult<StoreId> {
    let creation_time = get_u64(buf, "store id")?;
    let random_id = get_u64(buf, "store id")?;
    Ok(StoreId::new(creation_time, random_id))
}

fn need(buf: &Bytes, len: usize, what: &str) -> ClusterResult<()> {
    if buf.remaining() < len {
        return Err(ClusterError::Protocol(format!("truncated {what}")));
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes, what: &str) -> ClusterResult<u8> {
    need(buf, 1, what)?;
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes, what: &str) -> ClusterResult<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32_le())
}

fn get_u64(buf: &mut Bytes, what: &str) -> ClusterResult<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64_le())
}

fn get_bytes(buf: &mut Bytes, what: &str) -> ClusterResult<Bytes> {
    let len = get_u32(buf, what)? as usize;
    need(buf, len, what)?;
    Ok(buf.split_to(len))
}

fn expect_consumed(buf: &Bytes) -> ClusterResult<()> {
    if buf.has_remaining() {
        return Err(ClusterError::Protocol(format!(
            "{} trailing bytes in message body",
            buf.remaining()
        )));
    }
    Ok(())
}
