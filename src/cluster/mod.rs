//! Cluster directory: which node owns which run.
//!
//! Any node may receive a stop request for any run. The directory maps run
//! ids to the owning node so that the request can be forwarded there.

pub mod forwarder;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{NodeId, NodeInfo, RunId, RunRecord, RunState};

pub use forwarder::{CLUSTER_TOKEN_HEADER, HttpStopForwarder, StopForwarder};
pub use memory::MemoryDirectory;

/// Cluster-wide view of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub run_id: RunId,
    pub test_id: Uuid,
    pub node_id: NodeId,
    /// Base URL of the owning node.
    pub node_url: String,
    pub engine: String,
    pub state: RunState,
    /// Counts toward the at-most-one-running rule for its load test.
    pub exclusive: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DirectoryEntry {
    /// Entry for a run registered on `node`.
    pub fn from_record(record: &RunRecord, node: &NodeInfo) -> Self {
        Self {
            run_id: record.run_id,
            test_id: record.test_id,
            node_id: node.id.clone(),
            node_url: node.url.clone(),
            engine: record.engine.clone(),
            state: record.state,
            exclusive: true,
            started_at: record.started_at,
            finished_at: record.finished_at,
            error: record.error.clone(),
        }
    }

    /// Mark whether the entry takes part in duplicate-run checks.
    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn is_owned_by(&self, node_id: &NodeId) -> bool {
        &self.node_id == node_id
    }
}

/// Shared, consistent record of run ownership across nodes.
#[async_trait]
pub trait RunDirectory: Send + Sync {
    /// Publish a new entry.
    ///
    /// An exclusive running entry fails with `AlreadyRunning` when another
    /// exclusive entry for the same load test is still running.
    async fn claim(&self, entry: &DirectoryEntry) -> AppResult<()>;

    async fn locate(&self, run_id: RunId) -> AppResult<Option<DirectoryEntry>>;

    /// The running entry for a load test, if any.
    async fn running_for_test(&self, test_id: Uuid) -> AppResult<Option<DirectoryEntry>>;

    /// Move an entry to a terminal state. Returns false when the entry was
    /// unknown or already terminal.
    async fn mark_terminal(
        &self,
        run_id: RunId,
        state: RunState,
        error: Option<String>,
    ) -> AppResult<bool>;

    /// Mark every running entry owned by `node_id` as failed.
    async fn reap_node(&self, node_id: &NodeId) -> AppResult<u64>;

    /// Delete terminal entries that finished before `cutoff`.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;
}

/// Error recorded on entries whose owning process went away.
pub const ORPHANED_RUN_ERROR: &str = "owning node restarted before the run finished";
