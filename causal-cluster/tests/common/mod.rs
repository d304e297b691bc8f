//! Common test utilities for causal-cluster tests.

use causal_cluster::command::{IdAllocationRequest, LockTokenRequest, ReplicatedTransaction};
use causal_cluster::config::ClusterConfigBuilder;
use causal_cluster::{ClusterConfig, CoreReplica, MemoryDatabase, PruningStrategy, ReplicatedContent};
use causal_core::{IdType, MemberId};
use std::sync::{Arc, Once};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Install a tracing subscriber honouring `RUST_LOG`, once per test binary.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A replica with its data directory and store.
#[allow(dead_code)]
pub struct TestReplica {
    /// Temp directory (kept alive for the test duration).
    pub dir: TempDir,
    /// The replica.
    pub replica: Arc<CoreReplica>,
    /// Its store.
    pub db: Arc<MemoryDatabase>,
}

#[allow(dead_code)]
impl TestReplica {
    /// Open a replica over `db` with test defaults.
    pub fn new(db: MemoryDatabase) -> Self {
        Self::with_config(db, |builder| builder)
    }

    /// Open a replica over `db`, adjusting the configuration first.
    pub fn with_config(
        db: MemoryDatabase,
        configure: impl FnOnce(ClusterConfigBuilder) -> ClusterConfigBuilder,
    ) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let builder = ClusterConfig::builder()
            .data_dir(dir.path())
            // Port 0 lets parallel tests bind without clashing.
            .catchup_listen_addr("127.0.0.1:0")
            .sync_on_append(false)
            .pruning(PruningStrategy::KeepAll);
        let config = configure(builder).build().expect("Invalid config");
        let db = Arc::new(db);
        let replica = CoreReplica::open(config, db.clone()).expect("Failed to open replica");
        Self {
            dir,
            replica: Arc::new(replica),
            db,
        }
    }

    /// Drop the replica without flushing and open it again from disk.
    ///
    /// The store survives, as a real store's files would.
    pub fn reopen(self) -> Self {
        let Self { dir, replica, db } = self;
        let config = replica.config().clone();
        drop(replica);
        let replica = CoreReplica::open(config, db.clone()).expect("Failed to reopen replica");
        Self {
            dir,
            replica: Arc::new(replica),
            db,
        }
    }
}

/// A deterministic mix of commands: id ranges, lock token hand-offs and
/// store transactions. `n` commands in total.
#[allow(dead_code)]
pub fn workload(owner: MemberId, n: u64) -> Vec<ReplicatedContent> {
    let mut next_node_id = 0;
    let mut next_token = 1;
    (0..n)
        .map(|i| match i % 3 {
            0 => {
                let request = IdAllocationRequest {
                    owner,
                    id_type: IdType::Node,
                    range_start: next_node_id,
                    range_length: 10,
                };
                next_node_id += 10;
                ReplicatedContent::IdAllocation(request)
            }
            1 => {
                let request = LockTokenRequest {
                    owner,
                    candidate_id: next_token,
                };
                next_token += 1;
                ReplicatedContent::LockToken(request)
            }
            _ => ReplicatedContent::Transaction(ReplicatedTransaction {
                tx: format!("tx-{i}").into_bytes(),
            }),
        })
        .collect()
}

/// Append `commands` in `term` and commit all of them.
#[allow(dead_code)]
pub fn append_and_commit(replica: &CoreReplica, term: u64, commands: Vec<ReplicatedContent>) -> u64 {
    let mut last = replica.log().append_index();
    for command in commands {
        last = replica.append_entry(term, command).expect("append");
    }
    replica.notify_commit(last).expect("commit")
}
