//! Runs and stops across several nodes sharing a cluster directory.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use loadrun_lib::cluster::{DirectoryEntry, MemoryDirectory, ORPHANED_RUN_ERROR, RunDirectory};
use loadrun_lib::error::{AppError, AppResult, Missing};
use loadrun_lib::jobs::{DuplicateRunPolicy, JobRegistry};
use loadrun_lib::models::{NodeId, NodeInfo, RunId, RunRecord, RunState, StopOutcome};
use loadrun_lib::services::{Orchestrator, reap_on_startup};

use crate::support::{
    PeerForwarder, Probe, SCRIPTED, Script, Stores, TestCluster, settings, wait_for_finish,
};

#[tokio::test]
async fn test_run_is_published_to_directory() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;

    let record = cluster.node(0).orchestrator.run(test.id).await.unwrap();

    let entry = cluster.directory.locate(record.run_id).await.unwrap().unwrap();
    assert_eq!(entry.node_id, cluster.node(0).id());
    assert_eq!(entry.node_url, "http://node-a:8080");
    assert_eq!(entry.state, RunState::Running);
    assert!(entry.exclusive);
}

#[tokio::test]
async fn test_stop_is_forwarded_to_owning_node() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let record = cluster.node(0).orchestrator.run(test.id).await.unwrap();

    let outcome = cluster.node(1).orchestrator.stop(record.run_id).await.unwrap();

    assert_eq!(
        outcome,
        StopOutcome::Stopped {
            node_id: cluster.node(0).id()
        }
    );
    assert_eq!(cluster.forwarder.forwarded.load(Ordering::SeqCst), 1);
    assert_eq!(Probe::count(&cluster.node(0).probe.stops), 1);
    assert_eq!(Probe::count(&cluster.node(1).probe.stops), 0);
    assert!(cluster.node(0).orchestrator.jobs().is_empty());
    assert_eq!(
        cluster.directory_state(record.run_id).await,
        Some(RunState::Stopped)
    );
}

#[tokio::test]
async fn test_local_stop_is_not_forwarded() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let record = cluster.node(0).orchestrator.run(test.id).await.unwrap();

    cluster.node(0).orchestrator.stop(record.run_id).await.unwrap();

    assert_eq!(cluster.forwarder.forwarded.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_local_never_forwards() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let record = cluster.node(0).orchestrator.run(test.id).await.unwrap();

    let err = cluster
        .node(1)
        .orchestrator
        .stop_local(record.run_id)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::NotFound(Missing::Run(_))));
    assert_eq!(cluster.forwarder.forwarded.load(Ordering::SeqCst), 0);
    assert!(cluster.node(0).orchestrator.jobs().lookup_local(record.run_id).is_some());
}

#[tokio::test]
async fn test_remote_stop_of_finished_run_has_nothing_to_stop() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let owner = cluster.node(0);
    let record = owner.orchestrator.run(test.id).await.unwrap();
    let mut events = owner.orchestrator.subscribe();

    owner.probe.reporter(record.run_id).completed();
    wait_for_finish(&mut events, record.run_id).await;

    let outcome = cluster.node(1).orchestrator.stop(record.run_id).await.unwrap();
    assert_eq!(outcome, StopOutcome::NothingToStop);
    assert_eq!(cluster.forwarder.forwarded.load(Ordering::SeqCst), 0);
    assert_eq!(
        cluster.directory_state(record.run_id).await,
        Some(RunState::Completed)
    );
}

#[tokio::test]
async fn test_run_unknown_to_every_node_is_not_found() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let run_id = RunId::new();

    match cluster.node(1).orchestrator.stop(run_id).await.unwrap_err() {
        AppError::NotFound(Missing::Run(id)) => assert_eq!(id, run_id),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_unreachable_owner_is_a_cluster_error() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let record = cluster.node(0).orchestrator.run(test.id).await.unwrap();
    cluster.forwarder.remove_peer(&cluster.node(0).id());

    let err = cluster.node(1).orchestrator.stop(record.run_id).await.unwrap_err();

    assert!(matches!(err, AppError::Cluster(_)));
    assert!(err.is_fatal());
    assert!(cluster.node(0).orchestrator.jobs().lookup_local(record.run_id).is_some());
}

#[tokio::test]
async fn test_reject_policy_applies_across_nodes() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let first = cluster.node(0).orchestrator.run(test.id).await.unwrap();

    match cluster.node(1).orchestrator.run(test.id).await.unwrap_err() {
        AppError::AlreadyRunning { run_id, .. } => assert_eq!(run_id, first.run_id),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(Probe::count(&cluster.node(1).probe.inits), 0);
    assert!(cluster.node(1).orchestrator.jobs().is_empty());

    // Once stopped anywhere, another node may run the test.
    cluster.node(1).orchestrator.stop(first.run_id).await.unwrap();
    cluster.node(1).orchestrator.run(test.id).await.unwrap();
}

#[tokio::test]
async fn test_allow_policy_runs_on_several_nodes() {
    let cluster = pair(DuplicateRunPolicy::Allow);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;

    let first = cluster.node(0).orchestrator.run(test.id).await.unwrap();
    let second = cluster.node(1).orchestrator.run(test.id).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    let entry = cluster.directory.locate(second.run_id).await.unwrap().unwrap();
    assert_eq!(entry.state, RunState::Running);
    assert!(!entry.exclusive);
}

#[tokio::test]
async fn test_stale_own_entry_does_not_block_new_run() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let owner = cluster.node(0);

    // Left behind by an earlier process with the same node id.
    let stale = stale_entry(test.id, owner.orchestrator.node());
    cluster.directory.claim(&stale).await.unwrap();

    owner.orchestrator.run(test.id).await.unwrap();

    let stale = cluster.directory.locate(stale.run_id).await.unwrap().unwrap();
    assert_eq!(stale.state, RunState::Failed);
    assert_eq!(stale.error.as_deref(), Some(ORPHANED_RUN_ERROR));
}

#[tokio::test]
async fn test_stop_of_stale_own_entry_marks_it_failed() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let owner = cluster.node(0);
    let stale = stale_entry(Uuid::now_v7(), owner.orchestrator.node());
    cluster.directory.claim(&stale).await.unwrap();

    let outcome = owner.orchestrator.stop(stale.run_id).await.unwrap();

    assert_eq!(outcome, StopOutcome::NothingToStop);
    assert_eq!(
        cluster.directory_state(stale.run_id).await,
        Some(RunState::Failed)
    );
}

#[tokio::test]
async fn test_startup_reaping_fails_entries_of_restarted_node() {
    let cluster = pair(DuplicateRunPolicy::Reject);
    let (test, _) = cluster.stores.add_load_test(SCRIPTED).await;
    let record = cluster.node(1).orchestrator.run(test.id).await.unwrap();
    let stale = stale_entry(Uuid::now_v7(), cluster.node(0).orchestrator.node());
    cluster.directory.claim(&stale).await.unwrap();

    let reaped = reap_on_startup(cluster.directory.as_ref(), &cluster.node(0).id())
        .await
        .unwrap();

    assert_eq!(reaped, 1);
    assert_eq!(
        cluster.directory_state(stale.run_id).await,
        Some(RunState::Failed)
    );
    assert_eq!(
        cluster.directory_state(record.run_id).await,
        Some(RunState::Running)
    );
}

#[tokio::test]
async fn test_losing_claim_race_stops_the_new_run() {
    let stores = Stores::default();
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let directory = Arc::new(WrappedDirectory::blind());
    let winner = stale_entry(
        test.id,
        &NodeInfo::new(NodeId::new("node-b"), "http://node-b:8080"),
    );
    directory.inner.claim(&winner).await.unwrap();

    let probe = Arc::new(Probe::default());
    let orchestrator = wrapped_node(&stores, directory.clone(), &probe);
    let mut events = orchestrator.subscribe();

    match orchestrator.run(test.id).await.unwrap_err() {
        AppError::AlreadyRunning { run_id, .. } => assert_eq!(run_id, winner.run_id),
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(Probe::count(&probe.starts), 1);
    assert_eq!(Probe::count(&probe.stops), 1);
    assert!(orchestrator.jobs().is_empty());

    // Announced as started, then as stopped.
    let started = events.recv().await.unwrap();
    let (state, _) = wait_for_finish(&mut events, started.run_id()).await;
    assert_eq!(state, RunState::Stopped);
}

#[tokio::test]
async fn test_run_ending_during_claim_is_recorded_terminal() {
    let stores = Stores::default();
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let (claims_tx, mut claims) = mpsc::unbounded_channel();
    let directory = Arc::new(WrappedDirectory::slow_claim(
        claims_tx,
        Duration::from_millis(100),
    ));

    let probe = Arc::new(Probe::default());
    let orchestrator = Arc::new(wrapped_node(&stores, directory.clone(), &probe));
    let mut events = orchestrator.subscribe();

    let launch = {
        let orchestrator = Arc::clone(&orchestrator);
        let test_id = test.id;
        tokio::spawn(async move { orchestrator.run(test_id).await })
    };

    // The run is registered locally and its claim is in flight.
    let claimed = claims.recv().await.unwrap();
    probe.reporter(claimed.run_id).completed();
    wait_for_finish(&mut events, claimed.run_id).await;

    let record = launch.await.unwrap().unwrap();
    assert_eq!(record.run_id, claimed.run_id);
    assert_eq!(
        orchestrator.get_run(record.run_id).unwrap().state,
        RunState::Completed
    );

    let entry = directory.inner.locate(record.run_id).await.unwrap().unwrap();
    assert_eq!(entry.state, RunState::Completed);
    assert!(directory.inner.running_for_test(test.id).await.unwrap().is_none());

    // Another node may run the test again.
    let other = Orchestrator::builder(
        NodeInfo::new(NodeId::new("node-b"), "http://node-b:8080"),
        stores.tests.clone(),
        stores.files.clone(),
        crate::support::scripted_registry(Script::default(), Arc::new(Probe::default())),
    )
    .jobs(Arc::new(JobRegistry::new(DuplicateRunPolicy::Reject, 10)))
    .cluster(
        Arc::new(WrappedDirectory::sharing(&directory)),
        Arc::new(PeerForwarder::default()),
    )
    .settings(settings())
    .build();
    other.run(test.id).await.unwrap();
}

#[tokio::test]
async fn test_failed_claim_halts_run_and_propagates_error() {
    let stores = Stores::default();
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let directory = Arc::new(WrappedDirectory::failing_claim());

    let probe = Arc::new(Probe::default());
    let orchestrator = wrapped_node(&stores, directory.clone(), &probe);
    let mut events = orchestrator.subscribe();

    let err = orchestrator.run(test.id).await.unwrap_err();
    assert!(matches!(err, AppError::Database(_)));
    assert!(err.is_fatal());

    assert_eq!(Probe::count(&probe.stops), 1);
    assert!(orchestrator.jobs().is_empty());
    assert!(orchestrator.active_runs().is_empty());

    let started = events.recv().await.unwrap();
    let (state, error) = wait_for_finish(&mut events, started.run_id()).await;
    assert_eq!(state, RunState::Failed);
    assert!(error.is_some());
    assert_eq!(
        orchestrator.get_run(started.run_id()).unwrap().state,
        RunState::Failed
    );
}

fn pair(policy: DuplicateRunPolicy) -> TestCluster {
    TestCluster::new(&["node-a", "node-b"], Script::default(), policy)
}

fn stale_entry(test_id: Uuid, node: &NodeInfo) -> DirectoryEntry {
    let record = RunRecord::running(RunId::new(), test_id, node.id.clone(), "scripted");
    DirectoryEntry::from_record(&record, node)
}

fn wrapped_node(
    stores: &Stores,
    directory: Arc<WrappedDirectory>,
    probe: &Arc<Probe>,
) -> Orchestrator {
    Orchestrator::builder(
        NodeInfo::new(NodeId::new("node-a"), "http://node-a:8080"),
        stores.tests.clone(),
        stores.files.clone(),
        crate::support::scripted_registry(Script::default(), Arc::clone(probe)),
    )
    .jobs(Arc::new(JobRegistry::new(DuplicateRunPolicy::Reject, 10)))
    .cluster(directory, Arc::new(PeerForwarder::default()))
    .settings(settings())
    .build()
}

enum ClaimBehavior {
    Pass,
    /// Report the entry, then hold the claim for a while before writing it.
    Slow(mpsc::UnboundedSender<DirectoryEntry>, Duration),
    Fail,
}

/// Memory directory with scripted claim and lookup behavior.
struct WrappedDirectory {
    inner: Arc<MemoryDirectory>,
    /// Duplicate lookups miss, as when two nodes check at the same moment.
    blind: bool,
    claim: ClaimBehavior,
}

impl WrappedDirectory {
    fn with(blind: bool, claim: ClaimBehavior) -> Self {
        Self {
            inner: Arc::new(MemoryDirectory::new()),
            blind,
            claim,
        }
    }

    fn blind() -> Self {
        Self::with(true, ClaimBehavior::Pass)
    }

    fn slow_claim(claims: mpsc::UnboundedSender<DirectoryEntry>, delay: Duration) -> Self {
        Self::with(false, ClaimBehavior::Slow(claims, delay))
    }

    fn failing_claim() -> Self {
        Self::with(false, ClaimBehavior::Fail)
    }

    /// A plain view over another wrapper's entries.
    fn sharing(other: &WrappedDirectory) -> Self {
        Self {
            inner: Arc::clone(&other.inner),
            blind: false,
            claim: ClaimBehavior::Pass,
        }
    }
}

#[async_trait]
impl RunDirectory for WrappedDirectory {
    async fn claim(&self, entry: &DirectoryEntry) -> AppResult<()> {
        match &self.claim {
            ClaimBehavior::Pass => {}
            ClaimBehavior::Slow(claims, delay) => {
                let _ = claims.send(entry.clone());
                tokio::time::sleep(*delay).await;
            }
            ClaimBehavior::Fail => {
                return Err(AppError::Database("connection reset".to_string()));
            }
        }
        self.inner.claim(entry).await
    }

    async fn locate(&self, run_id: RunId) -> AppResult<Option<DirectoryEntry>> {
        self.inner.locate(run_id).await
    }

    async fn running_for_test(&self, test_id: Uuid) -> AppResult<Option<DirectoryEntry>> {
        if self.blind {
            return Ok(None);
        }
        self.inner.running_for_test(test_id).await
    }

    async fn mark_terminal(
        &self,
        run_id: RunId,
        state: RunState,
        error: Option<String>,
    ) -> AppResult<bool> {
        self.inner.mark_terminal(run_id, state, error).await
    }

    async fn reap_node(&self, node_id: &NodeId) -> AppResult<u64> {
        self.inner.reap_node(node_id).await
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        self.inner.purge_finished(cutoff).await
    }
}
