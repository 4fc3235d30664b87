//! Run lifecycle events fanned out to in-process observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{NodeId, RunId, RunState};

/// Event emitted when a run changes state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was registered as running.
    RunStarted(RunStartedPayload),
    /// A run reached a terminal state.
    RunFinished(RunFinishedPayload),
}

/// Payload for run_started event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub test_id: Uuid,
    pub node_id: NodeId,
    pub engine: String,
}

/// Payload for run_finished event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinishedPayload {
    pub run_id: RunId,
    pub test_id: Uuid,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wrapper that includes timestamp with every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventMessage {
    #[serde(flatten)]
    pub event: RunEvent,
    pub timestamp: DateTime<Utc>,
}

impl RunEventMessage {
    /// Create a new event message with the current timestamp.
    pub fn new(event: RunEvent) -> Self {
        Self {
            event,
            timestamp: Utc::now(),
        }
    }

    pub fn run_id(&self) -> RunId {
        match &self.event {
            RunEvent::RunStarted(p) => p.run_id,
            RunEvent::RunFinished(p) => p.run_id,
        }
    }
}

impl RunEvent {
    pub fn run_started(run_id: RunId, test_id: Uuid, node_id: NodeId, engine: &str) -> Self {
        RunEvent::RunStarted(RunStartedPayload {
            run_id,
            test_id,
            node_id,
            engine: engine.to_string(),
        })
    }

    pub fn run_finished(
        run_id: RunId,
        test_id: Uuid,
        state: RunState,
        error: Option<String>,
    ) -> Self {
        RunEvent::RunFinished(RunFinishedPayload {
            run_id,
            test_id,
            state,
            error,
        })
    }
}
