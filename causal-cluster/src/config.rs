//! Cluster member configuration.

use crate::raft::log::PruningStrategy;
use causal_core::{MemberId, RetryPolicy, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ClusterError, ClusterResult};

/// Configuration for a cluster member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This member's identity.
    pub member_id: MemberId,

    /// Root directory for the raft log and state machine files.
    pub data_dir: PathBuf,

    /// Raft log storage configuration.
    #[serde(default)]
    pub log: RaftLogConfig,

    /// State machine configuration.
    #[serde(default)]
    pub state: StateConfig,

    /// Catch-up protocol configuration.
    #[serde(default)]
    pub catchup: CatchupConfig,

    /// Raft timing configuration.
    #[serde(default)]
    pub raft: RaftTimingConfig,
}

/// Raft log storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftLogConfig {
    /// Rotate to a new segment once the active one reaches this many bytes.
    pub rotate_at_size: u64,

    /// Number of pooled read handles.
    pub reader_pool_size: usize,

    /// How long a reader waits for a free handle, in milliseconds.
    pub reader_acquire_timeout_ms: u64,

    /// fsync after every append batch.
    pub sync_on_append: bool,

    /// Retry policy for transient append failures.
    pub append_retry: RetryPolicy,

    /// What to keep when pruning.
    pub pruning: PruningStrategy,
}

/// State machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Flush state machines after this many applied entries.
    pub flush_every: u64,

    /// Upper bound on tracked client sessions.
    pub max_tracked_sessions: usize,

    /// Granularity of id ranges handed out at bootstrap.
    pub id_allocation_batch_size: u64,
}

/// Catch-up protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatchupConfig {
    /// Address the catch-up server listens on.
    pub listen_addr: String,

    /// Abort a session after this long without receiving bytes, in milliseconds.
    pub inactivity_timeout_ms: u64,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Maximum log entries per streamed batch.
    pub max_entries_per_batch: usize,

    /// Maximum transactions per streamed batch.
    pub max_transactions_per_batch: usize,

    /// Largest accepted frame in bytes.
    pub max_frame_size: usize,
}

/// Raft timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftTimingConfig {
    /// Election timeout range (min, max) in milliseconds.
    /// A random value in this range is chosen for each election.
    pub election_timeout_ms: (u64, u64),

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            member_id: MemberId::new(),
            data_dir: PathBuf::from("./causal-cluster-data"),
            log: RaftLogConfig::default(),
            state: StateConfig::default(),
            catchup: CatchupConfig::default(),
            raft: RaftTimingConfig::default(),
        }
    }
}

impl Default for RaftLogConfig {
    fn default() -> Self {
        Self {
            // 8MB segments
            rotate_at_size: 8 * 1024 * 1024,
            reader_pool_size: 8,
            reader_acquire_timeout_ms: 5_000,
            sync_on_append: true,
            append_retry: RetryPolicy::default(),
            pruning: PruningStrategy::default(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            flush_every: 100,
            max_tracked_sessions: 1_000,
            id_allocation_batch_size: 1_024,
        }
    }
}

impl Default for CatchupConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:6000".to_string(),
            inactivity_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            max_entries_per_batch: 256,
            max_transactions_per_batch: 128,
            // 16MB max frame
            max_frame_size: 16 * 1024 * 1024,
        }
    }
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: (150, 300),
            heartbeat_interval_ms: 50,
        }
    }
}

impl ClusterConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Load and validate a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> ClusterResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: ClusterConfig = serde_json::from_slice(&data)?;
        config.validate().map_err(ClusterError::Config)?;
        Ok(config)
    }

    /// Directory holding raft log segments.
    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("raft-log")
    }

    /// Directory holding state machine files.
    pub fn state_dir(&self) -> PathBuf {
        self.data_dir.join("core-state")
    }

    /// Randomized election timeout policy.
    pub fn election_timeout(&self) -> TimeoutPolicy {
        let (min, max) = self.raft.election_timeout_ms;
        TimeoutPolicy::uniform(Duration::from_millis(min), Duration::from_millis(max))
    }

    /// Fixed heartbeat policy.
    pub fn heartbeat_timeout(&self) -> TimeoutPolicy {
        TimeoutPolicy::fixed(Duration::from_millis(self.raft.heartbeat_interval_ms))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.log.reader_pool_size == 0 {
            return Err("log.reader_pool_size must be > 0".to_string());
        }

        if self.log.rotate_at_size == 0 {
            return Err("log.rotate_at_size must be > 0".to_string());
        }

        if self.log.append_retry.max_attempts == 0 {
            return Err("log.append_retry.max_attempts must be > 0".to_string());
        }

        if self.state.flush_every == 0 {
            return Err("state.flush_every must be > 0".to_string());
        }

        if self.state.max_tracked_sessions == 0 {
            return Err("state.max_tracked_sessions must be > 0".to_string());
        }

        if self.state.id_allocation_batch_size == 0 {
            return Err("state.id_allocation_batch_size must be > 0".to_string());
        }

        if self.catchup.listen_addr.is_empty() {
            return Err("catchup.listen_addr is required".to_string());
        }

        if self.catchup.inactivity_timeout_ms == 0 {
            return Err("catchup.inactivity_timeout_ms must be > 0".to_string());
        }

        if self.catchup.max_entries_per_batch == 0 || self.catchup.max_transactions_per_batch == 0
        {
            return Err("catchup batch sizes must be > 0".to_string());
        }

        let (min_election, max_election) = self.raft.election_timeout_ms;
        if min_election > max_election {
            return Err(format!(
                "election_timeout_ms range is inverted ({min_election} > {max_election})"
            ));
        }

        // Heartbeat should be much less than election timeout
        if self.raft.heartbeat_interval_ms >= min_election / 2 {
            return Err(format!(
                "heartbeat_interval_ms ({}) should be << election_timeout_ms ({})",
                self.raft.heartbeat_interval_ms, min_election
            ));
        }

        Ok(())
    }
}

impl RaftLogConfig {
    /// Reader acquire timeout as a Duration.
    pub fn reader_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_acquire_timeout_ms)
    }
}

impl CatchupConfig {
    /// Inactivity timeout as a Duration.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Connect timeout as a Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Builder for ClusterConfig.
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    /// Set the member ID.
    pub fn member_id(mut self, id: MemberId) -> Self {
        self.config.member_id = id;
        self
    }

    /// Set the data directory.
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the segment rotation threshold in bytes.
    pub fn rotate_at_size(mut self, bytes: u64) -> Self {
        self.config.log.rotate_at_size = bytes;
        self
    }

    /// Set the reader pool size.
    pub fn reader_pool_size(mut self, size: usize) -> Self {
        self.config.log.reader_pool_size = size;
        self
    }

    /// Set the reader acquire timeout in milliseconds.
    pub fn reader_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.config.log.reader_acquire_timeout_ms = ms;
        self
    }

    /// Enable or disable fsync on append.
    pub fn sync_on_append(mut self, sync: bool) -> Self {
        self.config.log.sync_on_append = sync;
        self
    }

    /// Set the append retry policy.
    pub fn append_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.log.append_retry = policy;
        self
    }

    /// Set the pruning strategy.
    pub fn pruning(mut self, strategy: PruningStrategy) -> Self {
        self.config.log.pruning = strategy;
        self
    }

    /// Set the flush interval in applied entries.
    pub fn flush_every(mut self, entries: u64) -> Self {
        self.config.state.flush_every = entries;
        self
    }

    /// Set the session bound.
    pub fn max_tracked_sessions(mut self, sessions: usize) -> Self {
        self.config.state.max_tracked_sessions = sessions;
        self
    }

    /// Set the id-allocation batch size.
    pub fn id_allocation_batch_size(mut self, size: u64) -> Self {
        self.config.state.id_allocation_batch_size = size;
        self
    }

    /// Set the catch-up listen address.
    pub fn catchup_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.catchup.listen_addr = addr.into();
        self
    }

    /// Set the catch-up inactivity timeout in milliseconds.
    pub fn inactivity_timeout_ms(mut self, ms: u64) -> Self {
        self.config.catchup.inactivity_timeout_ms = ms;
        self
    }

    /// Set the maximum entries per catch-up batch.
    pub fn max_entries_per_batch(mut self, entries: usize) -> Self {
        self.config.catchup.max_entries_per_batch = entries;
        self
    }

    /// Set election timeout range in milliseconds.
    pub fn election_timeout_ms(mut self, min: u64, max: u64) -> Self {
        self.config.raft.election_timeout_ms = (min, max);
        self
    }

    /// Set heartbeat interval in milliseconds.
    pub fn heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.config.raft.heartbeat_interval_ms = ms;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<ClusterConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }
}
