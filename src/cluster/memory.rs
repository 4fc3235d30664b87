//! In-process run directory.
//!
//! Serves single-node deployments without a database. Several orchestrators
//! sharing one instance behave like nodes of a cluster.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{DirectoryEntry, ORPHANED_RUN_ERROR, RunDirectory};
use crate::error::{AppError, AppResult};
use crate::models::{NodeId, RunId, RunState};

#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<HashMap<RunId, DirectoryEntry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<RunId, DirectoryEntry>> {
        self.entries.read().expect("Directory lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RunId, DirectoryEntry>> {
        self.entries.write().expect("Directory lock poisoned")
    }
}

#[async_trait]
impl RunDirectory for MemoryDirectory {
    async fn claim(&self, entry: &DirectoryEntry) -> AppResult<()> {
        let mut entries = self.write();

        if entry.state == RunState::Running
            && entry.exclusive
            && let Some(existing) = entries.values().find(|e| {
                e.test_id == entry.test_id
                    && e.state == RunState::Running
                    && e.exclusive
                    && e.run_id != entry.run_id
            })
        {
            return Err(AppError::AlreadyRunning {
                test_id: entry.test_id,
                run_id: existing.run_id,
            });
        }

        entries.insert(entry.run_id, entry.clone());
        Ok(())
    }

    async fn locate(&self, run_id: RunId) -> AppResult<Option<DirectoryEntry>> {
        Ok(self.read().get(&run_id).cloned())
    }

    async fn running_for_test(&self, test_id: Uuid) -> AppResult<Option<DirectoryEntry>> {
        Ok(self
            .read()
            .values()
            .find(|e| e.test_id == test_id && e.state == RunState::Running)
            .cloned())
    }

    async fn mark_terminal(
        &self,
        run_id: RunId,
        state: RunState,
        error: Option<String>,
    ) -> AppResult<bool> {
        let mut entries = self.write();
        match entries.get_mut(&run_id) {
            Some(entry) if entry.state == RunState::Running => {
                entry.state = state;
                entry.finished_at = Some(Utc::now());
                entry.error = error;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_node(&self, node_id: &NodeId) -> AppResult<u64> {
        let mut entries = self.write();
        let now = Utc::now();
        let mut reaped = 0;

        for entry in entries
            .values_mut()
            .filter(|e| e.is_owned_by(node_id) && e.state == RunState::Running)
        {
            entry.state = RunState::Failed;
            entry.finished_at = Some(now);
            entry.error = Some(ORPHANED_RUN_ERROR.to_string());
            reaped += 1;
        }

        Ok(reaped)
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, e| {
            !(e.state.is_terminal() && e.finished_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - entries.len()) as u64)
    }
}
