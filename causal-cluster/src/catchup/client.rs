//! Catch-up client.
//!
//! A [`CatchupConnection`] talks to one serving member. Every request arms
//! an inactivity watchdog on the shared [`TimerService`]; each chunk of
//! bytes received re-arms it, and the watchdog firing aborts the request
//! with [`ClusterError::Timeout`]. The peer closing the connection is
//! reported as [`ClusterError::ConnectionClosed`] and a refused request as
//! [`ClusterError::Rejected`], so callers can tell the three apart.

use bytes::BytesMut;
use causal_core::{StoreId, TimeoutPolicy, Timer, TimerService};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::protocol::{CatchupRequest, CatchupResponse, FrameCodec};
use crate::config::CatchupConfig;
use crate::error::{ClusterError, ClusterResult};
use crate::state::CoreSnapshot;
use crate::store::CommittedTransaction;
use crate::types::LogEntry;

/// Opens catch-up connections.
pub struct CatchupClient {
    timers: Arc<TimerService>,
    inactivity_timeout: Duration,
    connect_timeout: Duration,
    codec: FrameCodec,
    connections: AtomicU64,
}

impl CatchupClient {
    /// Create a client whose watchdogs run on `timers`.
    pub fn new(config: &CatchupConfig, timers: Arc<TimerService>) -> Self {
        Self {
            timers,
            inactivity_timeout: config.inactivity_timeout(),
            connect_timeout: config.connect_timeout(),
            codec: FrameCodec::new(config.max_frame_size),
            connections: AtomicU64::new(0),
        }
    }

    /// Connect to the member serving catch-up at `addr`.
    pub async fn connect(&self, addr: SocketAddr) -> ClusterResult<CatchupConnection> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClusterError::Connection { addr, source }),
            Err(_) => {
                return Err(ClusterError::Timeout {
                    addr,
                    after: self.connect_timeout,
                })
            }
        };
        stream
            .set_nodelay(true)
            .map_err(|source| ClusterError::Connection { addr, source })?;

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let n = self.connections.fetch_add(1, Ordering::Relaxed);
        let watchdog = self
            .timers
            .create(format!("catchup-inactivity-{addr}-{n}"), move |_| {
                let _ = expired_tx.send(());
            });

        tracing::debug!(%addr, "Connected to catch-up server");
        Ok(CatchupConnection {
            addr,
            stream,
            read_buf: BytesMut::with_capacity(64 * 1024),
            write_buf: BytesMut::new(),
            codec: self.codec,
            next_correlation: 1,
            timers: Arc::clone(&self.timers),
            watchdog,
            expired: expired_rx,
            inactivity_timeout: self.inactivity_timeout,
        })
    }
}

enum Event {
    Read(std::io::Result<usize>),
    Expired,
}

/// One connection to a serving member. Requests run one at a time.
pub struct CatchupConnection {
    addr: SocketAddr,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    codec: FrameCodec,
    next_correlation: u64,
    timers: Arc<TimerService>,
    watchdog: Timer,
    expired: mpsc::UnboundedReceiver<()>,
    inactivity_timeout: Duration,
}

impl CatchupConnection {
    /// Address of the serving member.
    pub fn peer(&self) -> SocketAddr {
        self.addr
    }

    /// Ask for the server's store id.
    pub async fn get_store_id(&mut self) -> ClusterResult<StoreId> {
        let correlation_id = self.send(&CatchupRequest::GetStoreId).await?;
        let response = self.next_response(correlation_id).await;
        self.watchdog.cancel();
        match response? {
            CatchupResponse::StoreId(store_id) => Ok(store_id),
            other => Err(unexpected("StoreId", &other)),
        }
    }

    /// Ask for the server's latest core snapshot.
    pub async fn get_core_snapshot(&mut self, expected_store_id: StoreId) -> ClusterResult<CoreSnapshot> {
        let correlation_id = self
            .send(&CatchupRequest::GetCoreSnapshot { expected_store_id })
            .await?;
        let response = self.next_response(correlation_id).await;
        self.watchdog.cancel();
        match response? {
            CatchupResponse::CoreSnapshot(snapshot) => Ok(snapshot),
            other => Err(unexpected("CoreSnapshot", &other)),
        }
    }

    /// Start streaming applied log entries from `from_index`.
    pub async fn get_log_entries(
        &mut self,
        expected_store_id: StoreId,
        from_index: u64,
    ) -> ClusterResult<LogEntryStream<'_>> {
        let correlation_id = self
            .send(&CatchupRequest::GetLogEntries {
                expected_store_id,
                from_index,
            })
            .await?;
        Ok(LogEntryStream {
            conn: self,
            correlation_id,
            last_index: None,
        })
    }

    /// Start streaming committed store transactions after `since_tx_id`.
    pub async fn pull_transactions(
        &mut self,
        expected_store_id: StoreId,
        since_tx_id: u64,
    ) -> ClusterResult<TransactionStream<'_>> {
        let correlation_id = self
            .send(&CatchupRequest::PullTransactions {
                expected_store_id,
                since_tx_id,
            })
            .await?;
        Ok(TransactionStream {
            conn: self,
            correlation_id,
            last_tx_id: None,
        })
    }

    async fn send(&mut self, request: &CatchupRequest) -> ClusterResult<u64> {
        let correlation_id = self.next_correlation;
        self.next_correlation += 1;

        self.write_buf.clear();
        self.codec
            .encode(&request.to_frame(correlation_id), &mut self.write_buf)?;

        // A firing left over from the previous request must not abort this one.
        while self.expired.try_recv().is_ok() {}
        self.watchdog
            .set(TimeoutPolicy::fixed(self.inactivity_timeout));

        if let Err(e) = self.stream.write_all(&self.write_buf).await {
            self.watchdog.cancel();
            return Err(self.io_error(e));
        }
        tracing::debug!(
            addr = %self.addr,
            correlation_id,
            request = request.name(),
            "Sent catch-up request"
        );
        Ok(correlation_id)
    }

    /// Next frame answering `correlation_id`, bounded by the inactivity
    /// window. The watchdog must already be armed.
    async fn next_response(&mut self, correlation_id: u64) -> ClusterResult<CatchupResponse> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                if frame.correlation_id != correlation_id {
                    return Err(ClusterError::Protocol(format!(
                        "response for request {} while awaiting {correlation_id}",
                        frame.correlation_id
                    )));
                }
                return match CatchupResponse::from_frame(&frame)? {
                    CatchupResponse::Error { kind, message } => {
                        tracing::warn!(addr = %self.addr, %kind, %message, "Catch-up request rejected");
                        Err(ClusterError::Rejected {
                            addr: self.addr,
                            kind,
                            message,
                        })
                    }
                    response => Ok(response),
                };
            }

            let event = tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf) => Event::Read(read),
                _ = self.expired.recv() => Event::Expired,
            };
            match event {
                Event::Read(Ok(0)) => {
                    tracing::warn!(addr = %self.addr, "Catch-up server closed the connection");
                    return Err(ClusterError::ConnectionClosed { addr: self.addr });
                }
                Event::Read(Ok(_)) => self.watchdog.reset(),
                Event::Read(Err(e)) => return Err(self.io_error(e)),
                Event::Expired => {
                    tracing::warn!(
                        addr = %self.addr,
                        after_ms = self.inactivity_timeout.as_millis() as u64,
                        "Catch-up server inactive"
                    );
                    return Err(ClusterError::Timeout {
                        addr: self.addr,
                        after: self.inactivity_timeout,
                    });
                }
            }
        }
    }

    fn io_error(&self, source: std::io::Error) -> ClusterError {
        match source.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => ClusterError::ConnectionClosed { addr: self.addr },
            _ => ClusterError::Connection {
                addr: self.addr,
                source,
            },
        }
    }
}

impl Drop for CatchupConnection {
    fn drop(&mut self) {
        self.timers.remove(self.watchdog.name());
    }
}

impl std::fmt::Debug for CatchupConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchupConnection")
            .field("addr", &self.addr)
            .field("next_correlation", &self.next_correlation)
            .finish()
    }
}

fn unexpected(expected: &str, got: &CatchupResponse) -> ClusterError {
    ClusterError::Protocol(format!("expected {expected}, got {got:?}"))
}

/// Log entries answering one `GetLogEntries` request.
pub struct LogEntryStream<'a> {
    conn: &'a mut CatchupConnection,
    correlation_id: u64,
    last_index: Option<u64>,
}

impl LogEntryStream<'_> {
    /// Next batch, or `None` once the server reports it is caught up.
    pub async fn next_batch(&mut self) -> ClusterResult<Option<Vec<LogEntry>>> {
        if self.last_index.is_some() {
            return Ok(None);
        }
        let response = self.conn.next_response(self.correlation_id).await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.conn.watchdog.cancel();
                return Err(e);
            }
        };
        match response {
            CatchupResponse::LogEntriesBatch(entries) => Ok(Some(entries)),
            CatchupResponse::CaughtUp { last_index } => {
                self.conn.watchdog.cancel();
                self.last_index = Some(last_index);
                Ok(None)
            }
            other => {
                self.conn.watchdog.cancel();
                Err(unexpected("LogEntriesBatch", &other))
            }
        }
    }

    /// Server's applied index, known once the stream has ended.
    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }
}

/// Transactions answering one `PullTransactions` request.
pub struct TransactionStream<'a> {
    conn: &'a mut CatchupConnection,
    correlation_id: u64,
    last_tx_id: Option<u64>,
}

impl TransactionStream<'_> {
    /// Next batch, or `None` once the server reports the stream finished.
    pub async fn next_batch(&mut self) -> ClusterResult<Option<Vec<CommittedTransaction>>> {
        if self.last_tx_id.is_some() {
            return Ok(None);
        }
        let response = self.conn.next_response(self.correlation_id).await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.conn.watchdog.cancel();
                return Err(e);
            }
        };
        match response {
            CatchupResponse::TransactionBatch(transactions) => Ok(Some(transactions)),
            CatchupResponse::TransactionsFinished { last_tx_id } => {
                self.conn.watchdog.cancel();
                self.last_tx_id = Some(last_tx_id);
                Ok(None)
            }
            other => {
                self.conn.watchdog.cancel();
                Err(unexpected("TransactionBatch", &other))
            }
        }
    }

    /// Server's last committed tx id, known once the stream has ended.
    pub fn last_tx_id(&self) -> Option<u64> {
        self.last_tx_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionKind;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn client(inactivity_ms: u64) -> CatchupClient {
        let config = CatchupConfig {
            inactivity_timeout_ms: inactivity_ms,
            ..CatchupConfig::default()
        };
        CatchupClient::new(&config, Arc::new(TimerService::current().unwrap()))
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (listener, addr) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let mut conn = client(200).connect(addr).await.unwrap();
        let start = Instant::now();
        let err = conn.get_store_id().await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(2));
        server.abort();
    }

    #[tokio::test]
    async fn closed_connection_is_not_a_timeout() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        let mut conn = client(5_000).connect(addr).await.unwrap();
        let err = conn.get_store_id().await.unwrap_err();
        assert!(matches!(err, ClusterError::ConnectionClosed { .. }), "{err}");
    }

    #[tokio::test]
    async fn error_response_is_rejection() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let codec = FrameCodec::new(1024);
            let mut buf = BytesMut::new();
            let frame = loop {
                socket.read_buf(&mut buf).await.unwrap();
                if let Some(frame) = codec.decode(&mut buf).unwrap() {
                    break frame;
                }
            };
            let mut out = BytesMut::new();
            let response = CatchupResponse::error(RejectionKind::StoreIdMismatch, "other lineage");
            codec
                .encode(&response.to_frame(frame.correlation_id).unwrap(), &mut out)
                .unwrap();
            socket.write_all(&out).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut conn = client(5_000).connect(addr).await.unwrap();
        let err = conn
            .get_core_snapshot(StoreId::new(1, 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::Rejected {
                kind: RejectionKind::StoreIdMismatch,
                ..
            }
        ));
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn refused_connect_is_connection_error() {
        let (listener, addr) = listener().await;
        drop(listener);
        let err = client(5_000).connect(addr).await.unwrap_err();
        assert!(matches!(err, ClusterError::Connection { .. }), "{err}");
    }
}
