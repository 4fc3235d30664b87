//! Execution engines.
//!
//! An [`Engine`] drives one run of a load test. Engines are selected by the
//! declared type of the test file through the [`EngineRegistry`], initialized
//! with a [`RunContext`], started, and eventually stopped.
//!
//! Lifecycle: `Created -> Initialized -> Running -> {Completed, Stopped, Failed}`.
//! Variants share the transition rules through [`Lifecycle`].

pub mod context;
pub mod jmeter;
pub mod lifecycle;
pub mod registry;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::models::{RunId, RunState};

pub use context::RunContext;
pub use jmeter::{JmeterEngine, JmeterEngineFactory, JmeterSettings};
pub use lifecycle::Lifecycle;
pub use registry::{EngineFactory, EngineRegistry, default_registry};

/// State of one engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Run state equivalent of a running or terminal engine state.
    pub fn as_run_state(&self) -> Option<RunState> {
        match self {
            Self::Running => Some(RunState::Running),
            Self::Stopped => Some(RunState::Stopped),
            Self::Completed => Some(RunState::Completed),
            Self::Failed => Some(RunState::Failed),
            Self::Created | Self::Initialized => None,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of [`Engine::init`] when no internal fault occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Context accepted; the engine can be started.
    Ready,
    /// Context rejected (e.g. malformed test plan). Carries a user-facing reason.
    Rejected(String),
}

/// Engine faults. Context rejections are not errors, see [`InitOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cannot {operation} engine in state '{state}'")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn workload: {0}")]
    Spawn(String),

    #[error("{0}")]
    Internal(String),
}

/// Terminal state reported by an engine for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalReport {
    pub run_id: RunId,
    pub test_id: Uuid,
    pub state: RunState,
    pub error: Option<String>,
}

/// Handle an engine uses to report how its run ended.
///
/// Reports flow to the orchestrator, which updates the job registry and the
/// cluster directory.
#[derive(Debug, Clone)]
pub struct RunReporter {
    run_id: RunId,
    test_id: Uuid,
    sender: mpsc::UnboundedSender<TerminalReport>,
}

impl RunReporter {
    pub fn new(
        run_id: RunId,
        test_id: Uuid,
        sender: mpsc::UnboundedSender<TerminalReport>,
    ) -> Self {
        Self {
            run_id,
            test_id,
            sender,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn test_id(&self) -> Uuid {
        self.test_id
    }

    pub fn completed(&self) {
        self.report(RunState::Completed, None);
    }

    pub fn stopped(&self) {
        self.report(RunState::Stopped, None);
    }

    pub fn failed(&self, error: impl Into<String>) {
        self.report(RunState::Failed, Some(error.into()));
    }

    fn report(&self, state: RunState, error: Option<String>) {
        let report = TerminalReport {
            run_id: self.run_id,
            test_id: self.test_id,
            state,
            error,
        };

        if self.sender.send(report).is_err() {
            warn!(
                "Dropped terminal report for run {} ({}): orchestrator is gone",
                self.run_id, state
            );
        }
    }
}

/// Pluggable execution backend.
///
/// Implementations must be cheap to construct; one instance drives exactly one run.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Variant name, e.g. `jmeter`.
    fn kind(&self) -> &'static str;

    fn state(&self) -> EngineState;

    /// Validate and prepare the run.
    ///
    /// Returns [`InitOutcome::Rejected`] for recoverable setup failures and an
    /// error only for unexpected internal faults.
    async fn init(&self, context: RunContext) -> Result<InitOutcome, EngineError>;

    /// Begin execution. Must return once the workload has been submitted.
    async fn start(&self, reporter: RunReporter) -> Result<(), EngineError>;

    /// Request graceful termination. Idempotent: stopping a finished or
    /// already-stopped engine is a no-op.
    async fn stop(&self) -> Result<(), EngineError>;

    /// Reclaim resources after `stop` was not acknowledged in time.
    async fn abort(&self) {}
}
