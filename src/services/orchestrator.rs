//! Run orchestrator.
//!
//! Resolves a load test, its file and an engine, drives the engine through
//! init and start, and records the run in the job registry and the cluster
//! directory. Stops are served locally when this node owns the run and
//! forwarded to the owning node otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::{DirectoryEntry, ORPHANED_RUN_ERROR, RunDirectory, StopForwarder};
use crate::engine::{Engine, EngineRegistry, InitOutcome, RunContext, RunReporter, TerminalReport};
use crate::error::{AppError, AppResult, Missing};
use crate::jobs::{DuplicateRunPolicy, JobRegistry};
use crate::models::{NodeInfo, RunEventMessage, RunId, RunRecord, RunState, StopOutcome};
use crate::store::{FileStore, LoadTestStore};

use super::{EventBroadcaster, RunWatch};

/// Default bound on `Engine::init`.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on stop acknowledgement before escalating to abort.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default number of terminal runs kept in the local archive.
pub const DEFAULT_FINISHED_HISTORY: usize = 1000;

/// Timeouts applied to engine calls.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub init_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// Cluster collaborators, present only in multi-node deployments.
#[derive(Clone)]
struct Cluster {
    directory: Arc<dyn RunDirectory>,
    forwarder: Arc<dyn StopForwarder>,
}

pub struct Orchestrator {
    node: NodeInfo,
    tests: Arc<dyn LoadTestStore>,
    files: Arc<dyn FileStore>,
    engines: EngineRegistry,
    jobs: Arc<JobRegistry>,
    cluster: Option<Cluster>,
    events: EventBroadcaster,
    reports: mpsc::UnboundedSender<TerminalReport>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn builder(
        node: NodeInfo,
        tests: Arc<dyn LoadTestStore>,
        files: Arc<dyn FileStore>,
        engines: EngineRegistry,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            node,
            tests,
            files,
            engines,
            jobs: None,
            cluster: None,
            events: EventBroadcaster::new(),
            settings: OrchestratorSettings::default(),
        }
    }

    /// Identity of this node.
    pub fn node(&self) -> &NodeInfo {
        &self.node
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    /// Subscribe to run started / finished events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEventMessage> {
        self.events.subscribe()
    }

    /// Follow the events of one run.
    pub fn watch_run(&self, run_id: RunId) -> RunWatch {
        self.events.watch(run_id)
    }

    /// Runs currently owned by this node, oldest first.
    pub fn active_runs(&self) -> Vec<RunRecord> {
        self.jobs.active_records()
    }

    /// Record of a run owned by this node, live or archived.
    pub fn get_run(&self, run_id: RunId) -> Option<RunRecord> {
        self.jobs.get(run_id)
    }

    /// Start a run of a load test.
    pub async fn run(&self, test_id: Uuid) -> AppResult<RunRecord> {
        self.run_with_params(test_id, BTreeMap::new()).await
    }

    /// Start a run of a load test with engine-specific parameters.
    ///
    /// On success the run is registered as running and its record returned.
    /// On any failure no run is registered.
    pub async fn run_with_params(
        &self,
        test_id: Uuid,
        params: BTreeMap<String, String>,
    ) -> AppResult<RunRecord> {
        let test = self
            .tests
            .get(test_id)
            .await?
            .ok_or(AppError::NotFound(Missing::LoadTest(test_id)))?;

        let file = self
            .files
            .get_metadata_by_test_id(test_id)
            .await?
            .ok_or(AppError::NotFound(Missing::FileMetadata { test_id }))?;

        let content = self
            .files
            .get_content(file.id)
            .await?
            .ok_or(AppError::NotFound(Missing::FileContent {
                test_id,
                file_id: file.id,
            }))?;

        let engine: Arc<dyn Engine> = self
            .engines
            .resolve(&file.file_type)
            .map(Arc::from)
            .ok_or_else(|| AppError::UnsupportedType {
                test_id,
                file_type: file.file_type.clone(),
            })?;

        let run_id = RunId::new();
        let slot = self.jobs.reserve(test_id, run_id)?;
        self.check_cluster_duplicate(test_id).await?;

        let context = RunContext::build(&test, &file, content)?.with_params(params);

        debug!(
            "Initializing {} engine for run {} of load test {}",
            engine.kind(),
            run_id,
            test_id
        );
        match timeout(self.settings.init_timeout, engine.init(context)).await {
            Ok(Ok(InitOutcome::Ready)) => {}
            Ok(Ok(InitOutcome::Rejected(reason))) => {
                warn!("Engine rejected load test {}: {}", test_id, reason);
                return Err(AppError::InitFailed { test_id, reason });
            }
            Ok(Err(e)) => {
                error!("Engine init failed for load test {}: {}", test_id, e);
                return Err(e.into());
            }
            Err(_) => {
                warn!(
                    "Engine init for load test {} timed out after {:?}",
                    test_id, self.settings.init_timeout
                );
                engine.abort().await;
                return Err(AppError::InitFailed {
                    test_id,
                    reason: format!(
                        "engine did not initialize within {}s",
                        self.settings.init_timeout.as_secs()
                    ),
                });
            }
        }

        let reporter = RunReporter::new(run_id, test_id, self.reports.clone());
        if let Err(e) = engine.start(reporter).await {
            error!("Engine start failed for load test {}: {}", test_id, e);
            return Err(e.into());
        }

        let record = slot.commit(Arc::clone(&engine), self.node.id.clone());
        self.events.run_started(&record);
        if record.state.is_terminal() {
            // Finished before registration, the drain task saw nothing to mark.
            self.events.run_finished(&record);
        }

        if let Some(ref cluster) = self.cluster {
            let entry = DirectoryEntry::from_record(&record, &self.node)
                .with_exclusive(self.jobs.policy() == DuplicateRunPolicy::Reject);
            match cluster.directory.claim(&entry).await {
                Ok(()) => self.reconcile_claim(cluster, &entry).await,
                Err(AppError::AlreadyRunning {
                    run_id: existing, ..
                }) => {
                    warn!(
                        "Load test {} started concurrently on another node (run {}), stopping run {}",
                        test_id, existing, run_id
                    );
                    self.abandon(
                        run_id,
                        RunState::Stopped,
                        "duplicate run in cluster".to_string(),
                    )
                    .await;
                    return Err(AppError::AlreadyRunning {
                        test_id,
                        run_id: existing,
                    });
                }
                Err(e) => {
                    error!(
                        "Failed to publish run {} to the cluster directory: {}",
                        run_id, e
                    );
                    self.abandon(run_id, RunState::Failed, e.to_string()).await;
                    return Err(e);
                }
            }
        }

        info!(
            "Started run {} of load test {} on node {} ({})",
            run_id, test_id, self.node.id, record.engine
        );

        Ok(record)
    }

    /// Stop a run wherever it executes.
    pub async fn stop(&self, run_id: RunId) -> AppResult<StopOutcome> {
        if let Some(outcome) = self.stop_owned(run_id).await? {
            return Ok(outcome);
        }

        let Some(ref cluster) = self.cluster else {
            return Err(AppError::NotFound(Missing::Run(run_id)));
        };

        let entry = cluster
            .directory
            .locate(run_id)
            .await?
            .ok_or(AppError::NotFound(Missing::Run(run_id)))?;

        if entry.state.is_terminal() {
            return Ok(StopOutcome::NothingToStop);
        }

        if entry.is_owned_by(&self.node.id) {
            // Local registration precedes the claim, look again.
            if let Some(outcome) = self.stop_owned(run_id).await? {
                return Ok(outcome);
            }
            warn!(
                "Run {} is listed as running on this node but is not registered, marking it failed",
                run_id
            );
            cluster
                .directory
                .mark_terminal(run_id, RunState::Failed, Some(ORPHANED_RUN_ERROR.to_string()))
                .await?;
            return Ok(StopOutcome::NothingToStop);
        }

        cluster.forwarder.forward_stop(&entry).await
    }

    /// Stop a run only if this node owns it. Never forwards.
    pub async fn stop_local(&self, run_id: RunId) -> AppResult<StopOutcome> {
        self.stop_owned(run_id)
            .await?
            .ok_or(AppError::NotFound(Missing::Run(run_id)))
    }

    /// Stop every run owned by this node.
    pub async fn shutdown(&self) {
        let runs = self.jobs.active_records();
        if runs.is_empty() {
            return;
        }

        info!("Stopping {} active run(s) before shutdown", runs.len());
        for record in runs {
            if let Err(e) = self.stop_local(record.run_id).await {
                error!("Failed to stop run {} on shutdown: {}", record.run_id, e);
            }
        }
    }

    /// `Some` when this node owns or owned the run, `None` when it never did.
    async fn stop_owned(&self, run_id: RunId) -> AppResult<Option<StopOutcome>> {
        let Some(handle) = self.jobs.lookup_local(run_id) else {
            return Ok(self
                .jobs
                .lookup_finished(run_id)
                .map(|_| StopOutcome::NothingToStop));
        };

        let _guard = handle.lock_operations().await;
        if self.jobs.lookup_local(run_id).is_none() {
            return Ok(Some(StopOutcome::NothingToStop));
        }

        info!("Stopping run {} of load test {}", run_id, handle.record.test_id);
        if let Err(e) = self.halt_engine(run_id, &handle.engine).await {
            self.finish(run_id, RunState::Failed, Some(e.to_string())).await;
            return Err(e);
        }

        self.finish(run_id, RunState::Stopped, None).await;

        // The engine's own report may have archived the run first.
        let stopped = self
            .jobs
            .lookup_finished(run_id)
            .is_some_and(|r| r.state == RunState::Stopped);

        Ok(Some(if stopped {
            StopOutcome::Stopped {
                node_id: handle.record.node_id.clone(),
            }
        } else {
            StopOutcome::NothingToStop
        }))
    }

    /// Halt a just-started run that could not be published and archive it.
    async fn abandon(&self, run_id: RunId, state: RunState, reason: String) {
        if let Some(handle) = self.jobs.lookup_local(run_id) {
            let _guard = handle.lock_operations().await;
            if self.jobs.lookup_local(run_id).is_some()
                && let Err(e) = self.halt_engine(run_id, &handle.engine).await
            {
                error!("Failed to stop unpublished run {}: {}", run_id, e);
            }
        }
        self.finish(run_id, state, Some(reason)).await;
    }

    /// Bring a freshly claimed entry up to date with a run that ended meanwhile.
    ///
    /// A terminal report applied before the claim finds no row to update.
    async fn reconcile_claim(&self, cluster: &Cluster, entry: &DirectoryEntry) {
        if entry.state.is_terminal() {
            return;
        }
        let Some(finished) = self.jobs.lookup_finished(entry.run_id) else {
            return;
        };

        debug!(
            "Run {} ended while being published, recording {}",
            entry.run_id, finished.state
        );
        if let Err(e) = cluster
            .directory
            .mark_terminal(entry.run_id, finished.state, finished.error)
            .await
        {
            warn!(
                "Failed to record end of run {} in the cluster directory: {}",
                entry.run_id, e
            );
        }
    }

    /// Ask an engine to stop, aborting it if it does not acknowledge in time.
    async fn halt_engine(&self, run_id: RunId, engine: &Arc<dyn Engine>) -> AppResult<()> {
        match timeout(self.settings.stop_timeout, engine.stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("Engine failed to stop run {}: {}", run_id, e);
                engine.abort().await;
                Err(e.into())
            }
            Err(_) => {
                warn!(
                    "Run {} did not acknowledge stop within {:?}, aborting",
                    run_id, self.settings.stop_timeout
                );
                engine.abort().await;
                Ok(())
            }
        }
    }

    async fn finish(&self, run_id: RunId, state: RunState, error: Option<String>) {
        finish_run(
            &self.jobs,
            self.cluster.as_ref().map(|c| c.directory.as_ref()),
            &self.events,
            run_id,
            state,
            error,
        )
        .await;
    }

    /// Reject a launch when another node already runs the load test.
    async fn check_cluster_duplicate(&self, test_id: Uuid) -> AppResult<()> {
        if self.jobs.policy() == DuplicateRunPolicy::Allow {
            return Ok(());
        }
        let Some(ref cluster) = self.cluster else {
            return Ok(());
        };

        let Some(existing) = cluster.directory.running_for_test(test_id).await? else {
            return Ok(());
        };

        if existing.is_owned_by(&self.node.id) && self.jobs.lookup_local(existing.run_id).is_none()
        {
            warn!(
                "Clearing stale directory entry for run {} of load test {}",
                existing.run_id, test_id
            );
            cluster
                .directory
                .mark_terminal(
                    existing.run_id,
                    RunState::Failed,
                    Some(ORPHANED_RUN_ERROR.to_string()),
                )
                .await?;
            return Ok(());
        }

        Err(AppError::AlreadyRunning {
            test_id,
            run_id: existing.run_id,
        })
    }
}

/// Record a terminal state in the registry and directory and announce it.
///
/// Only the first terminal transition of a run has any effect.
async fn finish_run(
    jobs: &JobRegistry,
    directory: Option<&dyn RunDirectory>,
    events: &EventBroadcaster,
    run_id: RunId,
    state: RunState,
    error: Option<String>,
) -> Option<RunRecord> {
    let record = jobs.mark_terminal(run_id, state, error)?;

    if let Some(directory) = directory
        && let Err(e) = directory
            .mark_terminal(run_id, record.state, record.error.clone())
            .await
    {
        warn!(
            "Failed to record end of run {} in the cluster directory: {}",
            run_id, e
        );
    }

    match record.error {
        Some(ref err) => warn!(
            "Run {} of load test {} ended {}: {}",
            run_id, record.test_id, record.state, err
        ),
        None => info!(
            "Run {} of load test {} ended {}",
            run_id, record.test_id, record.state
        ),
    }

    events.run_finished(&record);

    Some(record)
}

/// Apply terminal reports from engines until every reporter is gone.
async fn drain_reports(
    mut reports: mpsc::UnboundedReceiver<TerminalReport>,
    jobs: Arc<JobRegistry>,
    directory: Option<Arc<dyn RunDirectory>>,
    events: EventBroadcaster,
) {
    while let Some(report) = reports.recv().await {
        debug!("Run {} reported {}", report.run_id, report.state);
        finish_run(
            &jobs,
            directory.as_deref(),
            &events,
            report.run_id,
            report.state,
            report.error,
        )
        .await;
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    node: NodeInfo,
    tests: Arc<dyn LoadTestStore>,
    files: Arc<dyn FileStore>,
    engines: EngineRegistry,
    jobs: Option<Arc<JobRegistry>>,
    cluster: Option<Cluster>,
    events: EventBroadcaster,
    settings: OrchestratorSettings,
}

impl OrchestratorBuilder {
    /// Use an existing job registry. Defaults to a rejecting registry.
    pub fn jobs(mut self, jobs: Arc<JobRegistry>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Join a cluster through a shared directory.
    pub fn cluster(
        mut self,
        directory: Arc<dyn RunDirectory>,
        forwarder: Arc<dyn StopForwarder>,
    ) -> Self {
        self.cluster = Some(Cluster {
            directory,
            forwarder,
        });
        self
    }

    pub fn events(mut self, events: EventBroadcaster) -> Self {
        self.events = events;
        self
    }

    pub fn settings(mut self, settings: OrchestratorSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Build the orchestrator and spawn its report task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Orchestrator {
        let jobs = self.jobs.unwrap_or_else(|| {
            Arc::new(JobRegistry::new(
                DuplicateRunPolicy::Reject,
                DEFAULT_FINISHED_HISTORY,
            ))
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_reports(
            rx,
            Arc::clone(&jobs),
            self.cluster.as_ref().map(|c| Arc::clone(&c.directory)),
            self.events.clone(),
        ));

        Orchestrator {
            node: self.node,
            tests: self.tests,
            files: self.files,
            engines: self.engines,
            jobs,
            cluster: self.cluster,
            events: self.events,
            reports: tx,
            settings: self.settings,
        }
    }
}
