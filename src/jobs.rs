//! Job registry: process-wide table of in-flight runs.
//!
//! Every run that started on this node is tracked here until it reaches a
//! terminal state, after which its record moves to a bounded archive so that
//! late stop requests can be answered with "nothing to stop".
//!
//! All mutations go through a single lock, so register / lookup / mark-terminal
//! are atomic with respect to one another for any run id.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{AppError, AppResult};
use crate::models::{NodeId, RunId, RunRecord, RunState};

/// Whether a load test may have more than one run in progress at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateRunPolicy {
    /// At most one running instance per load test.
    Reject,
    /// Concurrent runs of the same load test are allowed.
    Allow,
}

impl DuplicateRunPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reject" => Some(Self::Reject),
            "allow" => Some(Self::Allow),
            _ => None,
        }
    }
}

impl std::fmt::Display for DuplicateRunPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reject => write!(f, "reject"),
            Self::Allow => write!(f, "allow"),
        }
    }
}

/// A live run: its record, the engine driving it and a per-run operation lock.
#[derive(Clone)]
pub struct RunHandle {
    pub record: RunRecord,
    pub engine: Arc<dyn Engine>,
    op_lock: Arc<tokio::sync::Mutex<()>>,
}

impl RunHandle {
    /// Serialize lifecycle operations (stop) on this run.
    pub async fn lock_operations(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.op_lock).lock_owned().await
    }
}

#[derive(Default)]
struct Inner {
    active: HashMap<RunId, RunHandle>,
    /// Runs between reservation and registration, with their load test id.
    launching: HashMap<RunId, Uuid>,
    /// Terminal reports that arrived before registration completed.
    early_terminal: HashMap<RunId, (RunState, Option<String>)>,
    finished: HashMap<RunId, RunRecord>,
    finished_order: VecDeque<RunId>,
}

/// Process-wide table of runs owned by this node.
pub struct JobRegistry {
    inner: Mutex<Inner>,
    policy: DuplicateRunPolicy,
    history: usize,
}

impl JobRegistry {
    /// Create a registry keeping at most `history` terminal records.
    pub fn new(policy: DuplicateRunPolicy, history: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            policy,
            history: history.max(1),
        }
    }

    pub fn policy(&self) -> DuplicateRunPolicy {
        self.policy
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("Job registry mutex poisoned")
    }

    /// Reserve a launch slot for a new run of `test_id`.
    ///
    /// With [`DuplicateRunPolicy::Reject`], fails if the test already has a
    /// running or launching run. The slot is released when dropped unless it is
    /// committed.
    pub fn reserve(&self, test_id: Uuid, run_id: RunId) -> AppResult<LaunchSlot<'_>> {
        let mut inner = self.lock();

        if self.policy == DuplicateRunPolicy::Reject {
            let running = inner
                .active
                .values()
                .find(|h| h.record.test_id == test_id && h.record.state == RunState::Running)
                .map(|h| h.record.run_id);
            let launching = inner
                .launching
                .iter()
                .find(|(_, t)| **t == test_id)
                .map(|(r, _)| *r);

            if let Some(existing) = running.or(launching) {
                return Err(AppError::AlreadyRunning {
                    test_id,
                    run_id: existing,
                });
            }
        }

        inner.launching.insert(run_id, test_id);

        Ok(LaunchSlot {
            registry: self,
            run_id,
            test_id,
            committed: false,
        })
    }

    /// Live run owned by this node.
    pub fn lookup_local(&self, run_id: RunId) -> Option<RunHandle> {
        self.lock().active.get(&run_id).cloned()
    }

    /// Archived record of a run that ended on this node.
    pub fn lookup_finished(&self, run_id: RunId) -> Option<RunRecord> {
        self.lock().finished.get(&run_id).cloned()
    }

    /// Record of a run in any state.
    pub fn get(&self, run_id: RunId) -> Option<RunRecord> {
        let inner = self.lock();
        inner
            .active
            .get(&run_id)
            .map(|h| h.record.clone())
            .or_else(|| inner.finished.get(&run_id).cloned())
    }

    /// Move a run to a terminal state.
    ///
    /// Idempotent: returns the archived record only for the call that performed
    /// the transition. A report for a run that is still being registered is
    /// held until registration.
    pub fn mark_terminal(
        &self,
        run_id: RunId,
        state: RunState,
        error: Option<String>,
    ) -> Option<RunRecord> {
        if !state.is_terminal() {
            return None;
        }

        let mut inner = self.lock();

        if let Some(handle) = inner.active.remove(&run_id) {
            let mut record = handle.record;
            record.finish(state, error);
            debug!("Run {} marked {}", run_id, state);
            self.archive(&mut inner, record.clone());
            return Some(record);
        }

        if inner.launching.contains_key(&run_id) {
            inner.early_terminal.entry(run_id).or_insert((state, error));
        }

        None
    }

    /// Records of all live runs, oldest first.
    pub fn active_records(&self) -> Vec<RunRecord> {
        let mut records: Vec<RunRecord> = self
            .lock()
            .active
            .values()
            .map(|h| h.record.clone())
            .collect();
        records.sort_by_key(|r| r.run_id);
        records
    }

    /// Live runs of one load test.
    pub fn active_for_test(&self, test_id: Uuid) -> Vec<RunId> {
        let mut runs: Vec<RunId> = self
            .lock()
            .active
            .values()
            .filter(|h| h.record.test_id == test_id)
            .map(|h| h.record.run_id)
            .collect();
        runs.sort();
        runs
    }

    /// Number of live runs.
    pub fn len(&self) -> usize {
        self.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn archive(&self, inner: &mut Inner, record: RunRecord) {
        let run_id = record.run_id;
        if inner.finished.insert(run_id, record).is_none() {
            inner.finished_order.push_back(run_id);
        }

        while inner.finished_order.len() > self.history {
            if let Some(oldest) = inner.finished_order.pop_front() {
                inner.finished.remove(&oldest);
            }
        }
    }
}

/// Reservation for one run between duplicate check and registration.
pub struct LaunchSlot<'a> {
    registry: &'a JobRegistry,
    run_id: RunId,
    test_id: Uuid,
    committed: bool,
}

impl LaunchSlot<'_> {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn test_id(&self) -> Uuid {
        self.test_id
    }

    /// Register the started run.
    ///
    /// If the engine already reported a terminal state, the record goes
    /// straight to the archive and is returned in that state.
    pub fn commit(mut self, engine: Arc<dyn Engine>, node_id: NodeId) -> RunRecord {
        let mut inner = self.registry.lock();
        inner.launching.remove(&self.run_id);
        self.committed = true;

        let mut record = RunRecord::running(self.run_id, self.test_id, node_id, engine.kind());

        if let Some((state, error)) = inner.early_terminal.remove(&self.run_id) {
            record.finish(state, error);
            self.registry.archive(&mut inner, record.clone());
            return record;
        }

        inner.active.insert(
            self.run_id,
            RunHandle {
                record: record.clone(),
                engine,
                op_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );

        record
    }
}

impl Drop for LaunchSlot<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let mut inner = self.registry.lock();
        inner.launching.remove(&self.run_id);
        inner.early_terminal.remove(&self.run_id);
    }
}
