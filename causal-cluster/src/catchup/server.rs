//! Catch-up server.
//!
//! Answers catch-up requests from lagging members, read-only. Each accepted
//! connection runs on its own task; log and store reads run on the blocking
//! pool so a slow disk never stalls the runtime or the apply path.

use bytes::BytesMut;
use causal_core::StoreId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};

use super::protocol::{CatchupRequest, CatchupResponse, Frame, FrameCodec};
use crate::config::CatchupConfig;
use crate::error::{ClusterError, ClusterResult, RejectionKind};
use crate::state::CoreSnapshot;
use crate::store::CommittedTransaction;
use crate::types::LogEntry;

/// What a serving member exposes to catch-up.
///
/// Implementations must not mutate replicated state.
pub trait CatchupSource: Send + Sync + 'static {
    /// Lineage of the local store.
    fn store_id(&self) -> StoreId;

    /// A consistent snapshot of the core state.
    fn core_snapshot(&self) -> ClusterResult<CoreSnapshot>;

    /// Highest applied log index.
    fn applied_index(&self) -> u64;

    /// Up to `max` applied entries starting at `from_index`.
    ///
    /// Fails with [`ClusterError::Pruned`] if `from_index` is no longer held.
    fn read_applied_entries(&self, from_index: u64, max: usize) -> ClusterResult<Vec<LogEntry>>;

    /// Id of the last committed store transaction.
    fn last_committed_tx_id(&self) -> u64;

    /// Up to `max` committed transactions after `since_tx_id`.
    fn read_transactions(&self, since_tx_id: u64, max: usize) -> ClusterResult<Vec<CommittedTransaction>>;
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    codec: FrameCodec,
    max_entries: usize,
    max_transactions: usize,
}

/// A running catch-up server.
pub struct CatchupServer {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CatchupServer {
    /// Bind `config.listen_addr` and start serving `source`.
    pub async fn bind(config: &CatchupConfig, source: Arc<dyn CatchupSource>) -> ClusterResult<Self> {
        let addr: SocketAddr = config
            .listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| ClusterError::Config(e.to_string()))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ClusterError::Connection { addr, source })?;
        let local_addr = listener.local_addr()?;

        let limits = Limits {
            codec: FrameCodec::new(config.max_frame_size),
            max_entries: config.max_entries_per_batch.max(1),
            max_transactions: config.max_transactions_per_batch.max(1),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(accept_loop(listener, source, limits, shutdown_rx));

        tracing::info!(addr = %local_addr, "Catch-up server started");
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Address actually bound, useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, drop every open connection and wait for the server
    /// task to end.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CatchupServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    source: Arc<dyn CatchupSource>,
    limits: Limits,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let source = Arc::clone(&source);
                        connections.spawn(async move {
                            if let Err(e) = serve_connection(stream, peer, source, limits).await {
                                tracing::debug!(%peer, error = %e, "Catch-up connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept catch-up connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = &mut shutdown_rx => {
                tracing::info!("Catch-up server shutting down");
                break;
            }
        }
    }
    connections.shutdown().await;
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    source: Arc<dyn CatchupSource>,
    limits: Limits,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    source: Arc<dyn CatchupSource>,
    limits: Limits,
) -> ClusterResult<()> {
    stream.set_nodelay(true)?;
    tracing::debug!(%peer, "Accepted catch-up connection");
    let mut conn = Connection {
        stream,
        peer,
        source,
        limits,
        read_buf: BytesMut::with_capacity(4096),
        write_buf: BytesMut::new(),
    };

    loop {
        let frame = match conn.limits.codec.decode(&mut conn.read_buf)? {
            Some(frame) => frame,
            None => {
                if conn.stream.read_buf(&mut conn.read_buf).await? == 0 {
                    tracing::debug!(%peer, "Catch-up client disconnected");
                    return Ok(());
                }
                continue;
            }
        };

        let correlation_id = frame.correlation_id;
        let request = match CatchupRequest::from_frame(&frame) {
            Ok(request) => request,
            Err(ClusterError::UnknownMessage { message_type, .. }) => {
                tracing::warn!(%peer, message_type, "Unknown catch-up request");
                conn.reject(
                    correlation_id,
                    RejectionKind::UnknownRequest,
                    format!("unknown message type {message_type:#04x}"),
                )
                .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::debug!(%peer, correlation_id, request = request.name(), "Catch-up request");
        match conn.handle(correlation_id, request).await {
            Ok(()) => {}
            Err(Rejection(kind, message)) => {
                tracing::warn!(%peer, correlation_id, %kind, %message, "Rejected catch-up request");
                conn.reject(correlation_id, kind, message).await?;
                return Ok(());
            }
        }
    }
}

/// Why a request was refused; the connection closes after sending it.
struct Rejection(RejectionKind, String);

impl From<ClusterError> for Rejection {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::Pruned { .. } => Rejection(RejectionKind::Pruned, e.to_string()),
            e => Rejection(RejectionKind::Internal, e.to_string()),
        }
    }
}

impl Connection {
    async fn handle(&mut self, correlation_id: u64, request: CatchupRequest) -> Result<(), Rejection> {
        match request {
            CatchupRequest::GetStoreId => {
                let store_id = self.source.store_id();
                self.send(correlation_id, &CatchupResponse::StoreId(store_id))
                    .await?;
            }
            CatchupRequest::GetCoreSnapshot { expected_store_id } => {
                self.check_store_id(expected_store_id)?;
                let source = Arc::clone(&self.source);
                let snapshot = tokio::task::spawn_blocking(move || source.core_snapshot())
                    .await
                    .map_err(ClusterError::from)??;
                tracing::info!(
                    peer = %self.peer,
                    prev_index = snapshot.prev_index(),
                    "Serving core snapshot"
                );
                self.send(correlation_id, &CatchupResponse::CoreSnapshot(snapshot))
                    .await?;
            }
            CatchupRequest::GetLogEntries {
                expected_store_id,
                from_index,
            } => {
                self.check_store_id(expected_store_id)?;
                let last_index = self.stream_entries(correlation_id, from_index).await?;
                self.send(correlation_id, &CatchupResponse::CaughtUp { last_index })
                    .await?;
            }
            CatchupRequest::PullTransactions {
                expected_store_id,
                since_tx_id,
            } => {
                self.check_store_id(expected_store_id)?;
                let last_tx_id = self.stream_transactions(correlation_id, since_tx_id).await?;
                self.send(
                    correlation_id,
                    &CatchupResponse::TransactionsFinished { last_tx_id },
                )
                .await?;
            }
        }
        Ok(())
    }

    fn check_store_id(&self, expected: StoreId) -> Result<(), Rejection> {
        let local = self.source.store_id();
        if expected != local {
            return Err(Rejection(
                RejectionKind::StoreIdMismatch,
                format!("requested store {expected}, serving store {local}"),
            ));
        }
        Ok(())
    }

    /// Stream applied entries from `from_index` through the applied index
    /// observed at the start. Returns that index.
    async fn stream_entries(&mut self, correlation_id: u64, from_index: u64) -> ClusterResult<u64> {
        let last_index = self.source.applied_index();
        let mut next = from_index.max(1);
        let mut sent = 0usize;
        while next <= last_index {
            let source = Arc::clone(&self.source);
            let max = self.limits.max_entries.min((last_index - next + 1) as usize);
            let entries =
                tokio::task::spawn_blocking(move || source.read_applied_entries(next, max))
                    .await??;
            let Some(last) = entries.last() else {
                break;
            };
            next = last.index + 1;
            sent += entries.len();
            let budget = self.limits.codec.batch_budget();
            for batch in split_batches(entries, budget, CatchupResponse::entry_len)? {
                self.send(correlation_id, &CatchupResponse::LogEntriesBatch(batch))
                    .await?;
            }
        }
        tracing::info!(peer = %self.peer, from_index, last_index, sent, "Streamed log entries");
        Ok(last_index)
    }

    async fn stream_transactions(&mut self, correlation_id: u64, since_tx_id: u64) -> ClusterResult<u64> {
        let last_tx_id = self.source.last_committed_tx_id();
        let mut since = since_tx_id;
        let mut sent = 0usize;
        while since < last_tx_id {
            let source = Arc::clone(&self.source);
            let max = self.limits.max_transactions;
            let transactions =
                tokio::task::spawn_blocking(move || source.read_transactions(since, max))
                    .await??;
            let Some(last) = transactions.last() else {
                break;
            };
            since = last.tx_id;
            sent += transactions.len();
            let budget = self.limits.codec.batch_budget();
            let batches = split_batches(transactions, budget, |tx| {
                Ok(CatchupResponse::transaction_len(tx))
            })?;
            for batch in batches {
                self.send(correlation_id, &CatchupResponse::TransactionBatch(batch))
                    .await?;
            }
        }
        tracing::info!(peer = %self.peer, since_tx_id, last_tx_id, sent, "Streamed transactions");
        Ok(last_tx_id)
    }

    async fn send(&mut self, correlation_id: u64, response: &CatchupResponse) -> ClusterResult<()> {
        let frame: Frame = response.to_frame(correlation_id)?;
        self.write_buf.clear();
        self.limits.codec.encode(&frame, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    async fn reject(&mut self, correlation_id: u64, kind: RejectionKind, message: String) -> ClusterResult<()> {
        self.send(correlation_id, &CatchupResponse::error(kind, message))
            .await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Cut `items` into consecutive batches whose bodies fit in `budget` bytes.
/// Every batch holds at least one item; an item too large for a frame of its
/// own is an error.
fn split_batches<T>(
    items: Vec<T>,
    budget: usize,
    len_of: impl Fn(&T) -> ClusterResult<usize>,
) -> ClusterResult<Vec<Vec<T>>> {
    let mut batches = Vec::new();
    let mut current = Vec::new();
    let mut used = 0usize;
    for item in items {
        let len = len_of(&item)?;
        if len > budget {
            return Err(ClusterError::Protocol(format!(
                "batch item of {len} bytes cannot fit a frame body of {budget} bytes"
            )));
        }
        if !current.is_empty() && used + len > budget {
            batches.push(std::mem::take(&mut current));
            used = 0;
        }
        used += len;
        current.push(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ReplicatedContent, ReplicatedTransaction};
    use bytes::BufMut;

    struct FixedSource {
        store_id: StoreId,
        entries: Vec<LogEntry>,
        first_index: u64,
    }

    impl CatchupSource for FixedSource {
        fn store_id(&self) -> StoreId {
            self.store_id
        }

        fn core_snapshot(&self) -> ClusterResult<CoreSnapshot> {
            Ok(CoreSnapshot::new(self.first_index - 1, 1))
        }

        fn applied_index(&self) -> u64 {
            self.entries.last().map_or(0, |e| e.index)
        }

        fn read_applied_entries(&self, from_index: u64, max: usize) -> ClusterResult<Vec<LogEntry>> {
            if from_index < self.first_index {
                return Err(ClusterError::Pruned {
                    requested: from_index,
                    first_available: self.first_index,
                });
            }
            Ok(self
                .entries
                .iter()
                .filter(|e| e.index >= from_index)
                .take(max)
                .cloned()
                .collect())
        }

        fn last_committed_tx_id(&self) -> u64 {
            0
        }

        fn read_transactions(&self, _since: u64, _max: usize) -> ClusterResult<Vec<CommittedTransaction>> {
            Ok(Vec::new())
        }
    }

    async fn start(first_index: u64, last_index: u64) -> (CatchupServer, StoreId) {
        let entries = (first_index..=last_index)
            .map(|i| LogEntry::new(i, 1, ReplicatedContent::NewLeaderBarrier))
            .collect();
        let config = CatchupConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_entries_per_batch: 4,
            ..CatchupConfig::default()
        };
        start_with(first_index, entries, &config).await
    }

    async fn start_with(
        first_index: u64,
        entries: Vec<LogEntry>,
        config: &CatchupConfig,
    ) -> (CatchupServer, StoreId) {
        let store_id = StoreId::new(100, 200);
        let source = FixedSource {
            store_id,
            entries,
            first_index,
        };
        let server = CatchupServer::bind(config, Arc::new(source)).await.unwrap();
        (server, store_id)
    }

    fn transaction_entry(index: u64, size: usize) -> LogEntry {
        LogEntry::new(
            index,
            1,
            ReplicatedContent::Transaction(ReplicatedTransaction {
                tx: vec![index as u8; size],
            }),
        )
    }

    async fn exchange(addr: SocketAddr, request: &CatchupRequest) -> Vec<CatchupResponse> {
        exchange_within(addr, request, 1 << 20).await
    }

    async fn exchange_within(
        addr: SocketAddr,
        request: &CatchupRequest,
        max_frame_size: usize,
    ) -> Vec<CatchupResponse> {
        let codec = FrameCodec::new(max_frame_size);
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = BytesMut::new();
        codec.encode(&request.to_frame(9), &mut out).unwrap();
        stream.write_all(&out).await.unwrap();

        let mut responses = Vec::new();
        let mut buf = BytesMut::new();
        loop {
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                assert_eq!(frame.correlation_id, 9);
                let response = CatchupResponse::from_frame(&frame).unwrap();
                let done = matches!(
                    response,
                    CatchupResponse::StoreId(_)
                        | CatchupResponse::CaughtUp { .. }
                        | CatchupResponse::Error { .. }
                );
                responses.push(response);
                if done {
                    return responses;
                }
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0);
        }
    }

    #[tokio::test]
    async fn streams_entries_in_batches_then_caught_up() {
        let (server, store_id) = start(1, 10).await;
        let responses = exchange(
            server.local_addr(),
            &CatchupRequest::GetLogEntries {
                expected_store_id: store_id,
                from_index: 3,
            },
        )
        .await;

        let mut indices = Vec::new();
        for response in &responses[..responses.len() - 1] {
            let CatchupResponse::LogEntriesBatch(entries) = response else {
                panic!("unexpected {response:?}");
            };
            assert!(entries.len() <= 4);
            indices.extend(entries.iter().map(|e| e.index));
        }
        assert_eq!(indices, (3..=10).collect::<Vec<_>>());
        assert_eq!(
            responses.last(),
            Some(&CatchupResponse::CaughtUp { last_index: 10 })
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn large_entries_are_split_to_fit_frame_limit() {
        let config = CatchupConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_frame_size: 1024,
            max_entries_per_batch: 64,
            ..CatchupConfig::default()
        };
        let entries = (1..=6).map(|i| transaction_entry(i, 400)).collect();
        let (server, store_id) = start_with(1, entries, &config).await;

        // Decoding with the same limit fails on any oversized frame.
        let responses = exchange_within(
            server.local_addr(),
            &CatchupRequest::GetLogEntries {
                expected_store_id: store_id,
                from_index: 1,
            },
            1024,
        )
        .await;

        let mut indices = Vec::new();
        let mut batches = 0;
        for response in &responses[..responses.len() - 1] {
            let CatchupResponse::LogEntriesBatch(entries) = response else {
                panic!("unexpected {response:?}");
            };
            assert!(!entries.is_empty());
            batches += 1;
            indices.extend(entries.iter().map(|e| e.index));
        }
        assert_eq!(batches, 3);
        assert_eq!(indices, (1..=6).collect::<Vec<_>>());
        assert_eq!(
            responses.last(),
            Some(&CatchupResponse::CaughtUp { last_index: 6 })
        );
        server.shutdown().await;
    }

    #[tokio::test]
    async fn entry_larger_than_a_frame_is_rejected() {
        let config = CatchupConfig {
            listen_addr: "127.0.0.1:0".into(),
            max_frame_size: 1024,
            ..CatchupConfig::default()
        };
        let entries = vec![transaction_entry(1, 100), transaction_entry(2, 2000)];
        let (server, store_id) = start_with(1, entries, &config).await;

        let responses = exchange_within(
            server.local_addr(),
            &CatchupRequest::GetLogEntries {
                expected_store_id: store_id,
                from_index: 1,
            },
            1024,
        )
        .await;
        assert!(matches!(
            responses[..],
            [CatchupResponse::Error {
                kind: RejectionKind::Internal,
                ..
            }]
        ));
        server.shutdown().await;
    }

    #[test]
    fn split_batches_keeps_order_and_budget() {
        let batches = split_batches(vec![3usize, 4, 2, 5, 1], 6, |n| Ok(*n)).unwrap();
        assert_eq!(batches, vec![vec![3], vec![4, 2], vec![5, 1]]);

        let batches = split_batches(vec![6usize, 6], 6, |n| Ok(*n)).unwrap();
        assert_eq!(batches, vec![vec![6], vec![6]]);

        assert!(split_batches(vec![7usize], 6, |n| Ok(*n)).is_err());
        assert!(split_batches(Vec::<usize>::new(), 6, |n| Ok(*n)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_foreign_store_and_pruned_range() {
        let (server, store_id) = start(5, 10).await;

        let responses = exchange(
            server.local_addr(),
            &CatchupRequest::GetCoreSnapshot {
                expected_store_id: StoreId::new(1, 1),
            },
        )
        .await;
        assert!(matches!(
            responses[..],
            [CatchupResponse::Error {
                kind: RejectionKind::StoreIdMismatch,
                ..
            }]
        ));

        let responses = exchange(
            server.local_addr(),
            &CatchupRequest::GetLogEntries {
                expected_store_id: store_id,
                from_index: 2,
            },
        )
        .await;
        assert!(matches!(
            responses[..],
            [CatchupResponse::Error {
                kind: RejectionKind::Pruned,
                ..
            }]
        ));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_request_gets_unknown_request_error() {
        let (server, _) = start(1, 1).await;
        let codec = FrameCodec::new(1024);
        let mut stream = TcpStream::connect(server.local_addr()).await.unwrap();

        let mut out = BytesMut::new();
        out.put_u32_le(9);
        out.put_u8(0x30);
        out.put_u64_le(77);
        stream.write_all(&out).await.unwrap();

        let mut buf = BytesMut::new();
        let frame = loop {
            if let Some(frame) = codec.decode(&mut buf).unwrap() {
                break frame;
            }
            assert!(stream.read_buf(&mut buf).await.unwrap() > 0);
        };
        assert_eq!(frame.correlation_id, 77);
        assert!(matches!(
            CatchupResponse::from_frame(&frame).unwrap(),
            CatchupResponse::Error {
                kind: RejectionKind::UnknownRequest,
                ..
            }
        ));
        server.shutdown().await;
    }
}
