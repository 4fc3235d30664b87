//! Launching runs on a single node.

use std::collections::BTreeMap;

use loadrun_lib::error::{AppError, Missing};
use loadrun_lib::jobs::DuplicateRunPolicy;
use loadrun_lib::models::{RunEvent, RunState};
use loadrun_lib::store::LoadTestStore;
use uuid::Uuid;

use crate::support::{
    InitBehavior, Probe, SCRIPTED, Script, Stores, single_node, wait_for_finish,
};

#[tokio::test]
async fn test_run_registers_running_record() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, file_id) = stores.add_load_test(SCRIPTED).await;
    let mut events = node.orchestrator.subscribe();

    let record = node.orchestrator.run(test.id).await.unwrap();

    assert_eq!(record.test_id, test.id);
    assert_eq!(record.state, RunState::Running);
    assert_eq!(record.engine, "scripted");
    assert_eq!(record.node_id, node.id());
    assert_ne!(record.run_id.as_uuid(), test.id);

    let handle = node.orchestrator.jobs().lookup_local(record.run_id).unwrap();
    assert_eq!(handle.record, record);
    assert_eq!(node.orchestrator.active_runs(), vec![record.clone()]);

    let context = node.probe.last_context().unwrap();
    assert_eq!(context.test_id(), test.id);
    assert_eq!(context.file_id(), file_id);
    assert_eq!(context.content(), b"scripted plan");

    match events.recv().await.unwrap().event {
        RunEvent::RunStarted(payload) => {
            assert_eq!(payload.run_id, record.run_id);
            assert_eq!(payload.node_id, node.id());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_run_passes_params_to_engine() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let params = BTreeMap::from([("threads".to_string(), "50".to_string())]);
    node.orchestrator
        .run_with_params(test.id, params.clone())
        .await
        .unwrap();

    assert_eq!(node.probe.last_context().unwrap().params(), &params);
}

#[tokio::test]
async fn test_missing_preconditions_are_distinct_not_found_errors() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);

    // No definition at all.
    let unknown = Uuid::now_v7();
    match node.orchestrator.run(unknown).await.unwrap_err() {
        AppError::NotFound(Missing::LoadTest(id)) => assert_eq!(id, unknown),
        other => panic!("unexpected error: {other:?}"),
    }

    // Definition without a linked file.
    let bare = loadrun_lib::models::LoadTest::new("alpha", "no file yet");
    stores.tests.insert(&bare).await.unwrap();
    match node.orchestrator.run(bare.id).await.unwrap_err() {
        AppError::NotFound(Missing::FileMetadata { test_id }) => assert_eq!(test_id, bare.id),
        other => panic!("unexpected error: {other:?}"),
    }

    // Metadata present, content gone.
    let (test, file_id) = stores.add_load_test(SCRIPTED).await;
    assert!(stores.files.remove_content(file_id));
    match node.orchestrator.run(test.id).await.unwrap_err() {
        AppError::NotFound(Missing::FileContent {
            test_id,
            file_id: missing,
        }) => {
            assert_eq!(test_id, test.id);
            assert_eq!(missing, file_id);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(Probe::count(&node.probe.inits), 0);
    assert!(node.orchestrator.jobs().is_empty());
}

#[tokio::test]
async fn test_unrecognized_file_type_is_rejected_before_any_engine_call() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test("gatling").await;

    match node.orchestrator.run(test.id).await.unwrap_err() {
        AppError::UnsupportedType { test_id, file_type } => {
            assert_eq!(test_id, test.id);
            assert_eq!(file_type, "GATLING");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    assert_eq!(Probe::count(&node.probe.inits), 0);
    assert!(node.orchestrator.jobs().is_empty());
}

#[tokio::test]
async fn test_file_type_lookup_ignores_case() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(" scripted ").await;

    node.orchestrator.run(test.id).await.unwrap();
}

#[tokio::test]
async fn test_rejected_init_registers_nothing() {
    let stores = Stores::default();
    let script = Script {
        init: InitBehavior::Reject("thread group missing".to_string()),
        ..Script::default()
    };
    let node = single_node(&stores, script, DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let err = node.orchestrator.run(test.id).await.unwrap_err();
    match &err {
        AppError::InitFailed { test_id, reason } => {
            assert_eq!(*test_id, test.id);
            assert_eq!(reason, "thread group missing");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_fatal());

    assert_eq!(Probe::count(&node.probe.starts), 0);
    assert!(node.orchestrator.jobs().is_empty());

    // The launch slot was released: nothing blocks a later attempt.
    assert!(node.orchestrator.jobs().reserve(test.id, Default::default()).is_ok());
}

#[tokio::test]
async fn test_init_fault_is_fatal() {
    let stores = Stores::default();
    let script = Script {
        init: InitBehavior::Fail,
        ..Script::default()
    };
    let node = single_node(&stores, script, DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let err = node.orchestrator.run(test.id).await.unwrap_err();
    assert!(matches!(err, AppError::Engine(_)));
    assert!(err.is_fatal());
    assert!(node.orchestrator.jobs().is_empty());
}

#[tokio::test]
async fn test_init_timeout_aborts_engine() {
    let stores = Stores::default();
    let script = Script {
        init: InitBehavior::Hang,
        ..Script::default()
    };
    let node = single_node(&stores, script, DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let err = node.orchestrator.run(test.id).await.unwrap_err();
    assert!(matches!(err, AppError::InitFailed { .. }));
    assert_eq!(Probe::count(&node.probe.aborts), 1);
    assert!(node.orchestrator.jobs().is_empty());
}

#[tokio::test]
async fn test_start_failure_registers_nothing() {
    let stores = Stores::default();
    let script = Script {
        start_fails: true,
        ..Script::default()
    };
    let node = single_node(&stores, script, DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let err = node.orchestrator.run(test.id).await.unwrap_err();
    assert!(matches!(err, AppError::Engine(_)));
    assert!(node.orchestrator.jobs().is_empty());
    assert!(node.orchestrator.active_runs().is_empty());
}

#[tokio::test]
async fn test_reject_policy_refuses_concurrent_run() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let first = node.orchestrator.run(test.id).await.unwrap();
    match node.orchestrator.run(test.id).await.unwrap_err() {
        AppError::AlreadyRunning { test_id, run_id } => {
            assert_eq!(test_id, test.id);
            assert_eq!(run_id, first.run_id);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(Probe::count(&node.probe.inits), 1);
    assert_eq!(node.orchestrator.jobs().len(), 1);

    // After the first run stops the test can run again.
    node.orchestrator.stop(first.run_id).await.unwrap();
    let second = node.orchestrator.run(test.id).await.unwrap();
    assert_ne!(second.run_id, first.run_id);
}

#[tokio::test]
async fn test_allow_policy_runs_concurrently_with_distinct_ids() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Allow);
    let (test, _) = stores.add_load_test(SCRIPTED).await;

    let first = node.orchestrator.run(test.id).await.unwrap();
    let second = node.orchestrator.run(test.id).await.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(
        node.orchestrator.jobs().active_for_test(test.id),
        vec![first.run_id, second.run_id]
    );
}

#[tokio::test]
async fn test_concurrent_launches_under_reject_start_exactly_one() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let test_id = test.id;

    let launches: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = node.orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(test_id).await })
        })
        .collect();

    let mut started = 0;
    for launch in launches {
        match launch.await.unwrap() {
            Ok(_) => started += 1,
            Err(AppError::AlreadyRunning { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(started, 1);
    assert_eq!(node.orchestrator.jobs().len(), 1);
}

#[tokio::test]
async fn test_concurrent_launches_of_different_tests_are_independent() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (first_test, _) = stores.add_load_test(SCRIPTED).await;
    let (second_test, _) = stores.add_load_test(SCRIPTED).await;

    let (first, second) = tokio::join!(
        node.orchestrator.run(first_test.id),
        node.orchestrator.run(second_test.id)
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(first.test_id, first_test.id);
    assert_eq!(second.test_id, second_test.id);
    assert_eq!(node.orchestrator.jobs().len(), 2);

    node.orchestrator.stop(first.run_id).await.unwrap();
    assert!(node.orchestrator.jobs().lookup_local(first.run_id).is_none());
    assert!(node.orchestrator.jobs().lookup_local(second.run_id).is_some());

    node.orchestrator.stop(second.run_id).await.unwrap();
    assert!(node.orchestrator.jobs().is_empty());
    assert_eq!(Probe::count(&node.probe.stops), 2);
}

#[tokio::test]
async fn test_engine_completion_archives_run() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let mut events = node.orchestrator.subscribe();

    let record = node.orchestrator.run(test.id).await.unwrap();
    node.probe.reporter(record.run_id).completed();

    let (state, error) = wait_for_finish(&mut events, record.run_id).await;
    assert_eq!(state, RunState::Completed);
    assert!(error.is_none());

    assert!(node.orchestrator.jobs().lookup_local(record.run_id).is_none());
    let archived = node.orchestrator.get_run(record.run_id).unwrap();
    assert_eq!(archived.state, RunState::Completed);
    assert!(archived.finished_at.is_some());
}

#[tokio::test]
async fn test_engine_failure_is_recorded_with_reason() {
    let stores = Stores::default();
    let node = single_node(&stores, Script::default(), DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let mut events = node.orchestrator.subscribe();

    let record = node.orchestrator.run(test.id).await.unwrap();
    node.probe.reporter(record.run_id).failed("exit status 1");

    let (state, error) = wait_for_finish(&mut events, record.run_id).await;
    assert_eq!(state, RunState::Failed);
    assert_eq!(error.as_deref(), Some("exit status 1"));
}

#[tokio::test]
async fn test_run_finishing_during_start_is_archived_on_registration() {
    let stores = Stores::default();
    let script = Script {
        finish_on_start: Some(RunState::Completed),
        ..Script::default()
    };
    let node = single_node(&stores, script, DuplicateRunPolicy::Reject);
    let (test, _) = stores.add_load_test(SCRIPTED).await;
    let mut events = node.orchestrator.subscribe();

    let record = node.orchestrator.run(test.id).await.unwrap();

    let (state, _) = wait_for_finish(&mut events, record.run_id).await;
    assert_eq!(state, RunState::Completed);
    assert!(node.orchestrator.jobs().lookup_local(record.run_id).is_none());
    assert_eq!(
        node.orchestrator.get_run(record.run_id).unwrap().state,
        RunState::Completed
    );

    // Finished runs never block a new one.
    node.orchestrator.run(test.id).await.unwrap();
}
