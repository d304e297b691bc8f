//! Catch-up between members over TCP.

mod common;

use bytes::BytesMut;
use causal_cluster::catchup::protocol::{CatchupRequest, CatchupResponse, FrameCodec};
use causal_cluster::config::CatchupConfig;
use causal_cluster::{
    CatchupClient, CatchupState, ClusterError, CoreSnapshot, LogEntry, MemberSet, MemoryDatabase,
    ReplicatedContent,
};
use causal_core::{MemberId, StoreId, TimerService};
use common::{append_and_commit, workload, TestReplica};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn timers() -> Arc<TimerService> {
    Arc::new(TimerService::current().expect("Failed to create timer service"))
}

fn short_timeout_client(inactivity_ms: u64) -> CatchupClient {
    let config = CatchupConfig {
        inactivity_timeout_ms: inactivity_ms,
        connect_timeout_ms: 1_000,
        ..CatchupConfig::default()
    };
    CatchupClient::new(&config, timers())
}

/// A fresh member with the same store lineage catches up from a running one.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_catchup_between_members() {
    let owner = MemberId::new();
    let store_id = StoreId::generate();
    let commands = workload(owner, 45);

    let leader = TestReplica::with_config(MemoryDatabase::new(store_id), |b| {
        b.max_entries_per_batch(8)
    });
    leader
        .replica
        .bootstrap(&MemberSet::new([owner, MemberId::new()]))
        .expect("bootstrap");
    append_and_commit(&leader.replica, 1, commands[..30].to_vec());
    let server = leader.replica.serve_catchup().await.expect("serve");

    let follower = TestReplica::new(MemoryDatabase::new(store_id));
    let process = follower.replica.catchup_process(timers());
    let outcome = process.run(server.local_addr()).await.expect("catch-up");

    assert_eq!(process.state(), CatchupState::Completed);
    assert_eq!(outcome.snapshot_index, Some(30));
    assert_eq!(outcome.transactions_pulled, 10);
    assert_eq!(outcome.applied_index, 30);
    assert_eq!(follower.replica.last_applied_index(), 30);
    assert_eq!(follower.db.transactions(), leader.db.transactions());
    assert_eq!(
        follower.replica.build_snapshot().expect("snapshot").to_bytes().expect("encode"),
        leader.replica.build_snapshot().expect("snapshot").to_bytes().expect("encode"),
    );

    // The leader moves on; a second run brings the follower level again.
    append_and_commit(&leader.replica, 2, commands[30..].to_vec());
    let outcome = process.run(server.local_addr()).await.expect("catch-up");
    assert_eq!(outcome.applied_index, 45);
    assert_eq!(follower.db.transactions(), leader.db.transactions());
    assert_eq!(
        follower.replica.build_snapshot().expect("snapshot").to_bytes().expect("encode"),
        leader.replica.build_snapshot().expect("snapshot").to_bytes().expect("encode"),
    );

    server.shutdown().await;
}

/// A member from another store lineage is refused before anything is copied.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_catchup_refuses_foreign_store() {
    let leader = TestReplica::new(MemoryDatabase::new(StoreId::generate()));
    append_and_commit(&leader.replica, 1, workload(MemberId::new(), 6));
    let server = leader.replica.serve_catchup().await.expect("serve");

    let stranger = TestReplica::new(MemoryDatabase::new(StoreId::generate()));
    let process = stranger.replica.catchup_process(timers());
    let err = process
        .run(server.local_addr())
        .await
        .expect_err("foreign store should be refused");

    assert!(matches!(err, ClusterError::StoreIdMismatch { .. }), "{err:?}");
    assert_eq!(process.state(), CatchupState::Failed);
    assert_eq!(stranger.replica.last_applied_index(), 0);
    assert!(stranger.db.transactions().is_empty());

    server.shutdown().await;
}

/// A peer that accepts but never answers times out within the window.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let client = short_timeout_client(200);
    let mut conn = client.connect(addr).await.expect("connect");

    let started = Instant::now();
    let err = conn.get_store_id().await.expect_err("should time out");
    let elapsed = started.elapsed();

    assert!(matches!(err, ClusterError::Timeout { .. }), "{err:?}");
    assert!(err.is_retriable());
    assert!(elapsed >= Duration::from_millis(150), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "fired late: {elapsed:?}");

    silent.abort();
}

/// A peer that hangs up is reported as a closed connection, not a timeout.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closed_peer_is_not_a_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let closer = tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let client = short_timeout_client(5_000);
    let mut conn = client.connect(addr).await.expect("connect");

    let started = Instant::now();
    let err = conn.get_store_id().await.expect_err("should fail");
    assert!(matches!(err, ClusterError::ConnectionClosed { .. }), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    closer.await.expect("closer task");
}

/// A peer that hangs up after the first entry batch fails the run with a
/// closed connection; the batch it did send stays applied.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_closing_mid_stream_fails_catchup() {
    let store_id = StoreId::generate();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let codec = FrameCodec::new(1 << 20);
        let mut buf = BytesMut::new();
        loop {
            let Some(frame) = codec.decode(&mut buf).expect("decode request") else {
                if stream.read_buf(&mut buf).await.expect("read") == 0 {
                    return;
                }
                continue;
            };
            let response = match CatchupRequest::from_frame(&frame).expect("parse request") {
                CatchupRequest::GetStoreId => CatchupResponse::StoreId(store_id),
                CatchupRequest::GetCoreSnapshot { .. } => {
                    CatchupResponse::CoreSnapshot(CoreSnapshot::new(0, 0))
                }
                CatchupRequest::GetLogEntries { from_index, .. } => {
                    CatchupResponse::LogEntriesBatch(vec![LogEntry::new(
                        from_index,
                        1,
                        ReplicatedContent::NewLeaderBarrier,
                    )])
                }
                other => panic!("unexpected request {other:?}"),
            };
            let mut out = BytesMut::new();
            let frame = response.to_frame(frame.correlation_id).expect("frame");
            codec.encode(&frame, &mut out).expect("encode");
            stream.write_all(&out).await.expect("write");
            if matches!(response, CatchupResponse::LogEntriesBatch(_)) {
                // Hang up before CaughtUp.
                return;
            }
        }
    });

    let follower = TestReplica::new(MemoryDatabase::new(store_id));
    let process = follower.replica.catchup_process(timers());
    let err = process.run(addr).await.expect_err("peer hung up");

    assert!(matches!(err, ClusterError::ConnectionClosed { .. }), "{err:?}");
    assert!(err.is_retriable());
    assert_eq!(process.state(), CatchupState::Failed);
    assert_eq!(follower.replica.last_applied_index(), 1);

    peer.await.expect("peer task");
}
