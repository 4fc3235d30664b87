//! JMeter engine: runs a JMX test plan with an external `jmeter` process in non-GUI mode.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{
    Engine, EngineError, EngineFactory, EngineState, InitOutcome, Lifecycle, RunContext,
    RunReporter,
};
use crate::models::RunId;

/// Root element every JMeter test plan carries.
const TEST_PLAN_ROOT: &str = "<jmeterTestPlan";

const PLAN_FILE: &str = "plan.jmx";
const RESULTS_FILE: &str = "results.jtl";
const LOG_FILE: &str = "jmeter.log";

/// Where the JMeter binary lives and where run artifacts are written.
#[derive(Debug, Clone)]
pub struct JmeterSettings {
    pub jmeter_bin: PathBuf,
    pub work_dir: PathBuf,
}

impl JmeterSettings {
    /// Directory holding the plan, results and log of one run.
    pub fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.work_dir.join(run_id.to_string())
    }
}

/// Creates [`JmeterEngine`] instances.
pub struct JmeterEngineFactory {
    settings: JmeterSettings,
}

impl JmeterEngineFactory {
    pub fn new(settings: JmeterSettings) -> Self {
        Self { settings }
    }
}

impl EngineFactory for JmeterEngineFactory {
    fn create(&self) -> Box<dyn Engine> {
        Box::new(JmeterEngine::new(self.settings.clone()))
    }
}

/// Supervisor task of a started run.
struct Supervisor {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

/// Engine variant for JMX test plans.
pub struct JmeterEngine {
    settings: JmeterSettings,
    lifecycle: Arc<Lifecycle>,
    context: Mutex<Option<RunContext>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
}

impl JmeterEngine {
    pub fn new(settings: JmeterSettings) -> Self {
        Self {
            settings,
            lifecycle: Arc::new(Lifecycle::new()),
            context: Mutex::new(None),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    fn context(&self) -> Option<RunContext> {
        self.context
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Write the plan into the run directory and spawn JMeter on it.
    async fn launch(&self, context: &RunContext, run_id: RunId) -> Result<Child, EngineError> {
        let run_dir = self.settings.run_dir(run_id);
        tokio::fs::create_dir_all(&run_dir).await?;

        let plan_path = run_dir.join(PLAN_FILE);
        tokio::fs::write(&plan_path, context.content()).await?;

        let mut command = build_command(&self.settings.jmeter_bin, &run_dir, context);
        let child = command.spawn().map_err(|e| {
            EngineError::Spawn(format!(
                "{}: {}",
                self.settings.jmeter_bin.display(),
                e
            ))
        })?;

        info!(
            "JMeter started for run {} (test {}, pid {:?})",
            run_id,
            context.test_id(),
            child.id()
        );

        Ok(child)
    }
}

/// Check that the content looks like a JMeter test plan.
fn validate_plan(content: &[u8]) -> Result<(), String> {
    if content.is_empty() {
        return Err("test plan is empty".to_string());
    }

    let text =
        std::str::from_utf8(content).map_err(|_| "test plan is not valid UTF-8".to_string())?;

    if !text.contains(TEST_PLAN_ROOT) {
        return Err("test plan has no jmeterTestPlan root element".to_string());
    }

    Ok(())
}

fn build_command(jmeter_bin: &Path, run_dir: &Path, context: &RunContext) -> Command {
    let mut command = Command::new(jmeter_bin);
    command
        .arg("-n")
        .arg("-t")
        .arg(run_dir.join(PLAN_FILE))
        .arg("-l")
        .arg(run_dir.join(RESULTS_FILE))
        .arg("-j")
        .arg(run_dir.join(LOG_FILE));

    for (key, value) in context.params() {
        command.arg(format!("-J{}={}", key, value));
    }

    command
        .current_dir(run_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    command
}

/// Wait for JMeter to exit or for a stop request, then report the outcome.
async fn supervise(
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    lifecycle: Arc<Lifecycle>,
    reporter: RunReporter,
) {
    let run_id = reporter.run_id();

    tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => {
                if lifecycle.finish(EngineState::Completed) {
                    info!("JMeter run {} completed", run_id);
                    reporter.completed();
                }
            }
            Ok(status) => {
                if lifecycle.finish(EngineState::Failed) {
                    warn!("JMeter run {} exited with {}", run_id, status);
                    reporter.failed(format!("jmeter exited with {}", status));
                }
            }
            Err(e) => {
                if lifecycle.finish(EngineState::Failed) {
                    warn!("Lost track of JMeter process for run {}: {}", run_id, e);
                    reporter.failed(format!("failed to wait for jmeter: {}", e));
                }
            }
        },
        // A dropped sender means the engine itself is gone; stop the process either way.
        _ = stop_rx => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill JMeter process for run {}: {}", run_id, e);
            }
            if lifecycle.finish(EngineState::Stopped) {
                info!("JMeter run {} stopped", run_id);
                reporter.stopped();
            }
        }
    }
}

#[async_trait]
impl Engine for JmeterEngine {
    fn kind(&self) -> &'static str {
        "jmeter"
    }

    fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    async fn init(&self, context: RunContext) -> Result<InitOutcome, EngineError> {
        if let Err(reason) = validate_plan(context.content()) {
            return Ok(InitOutcome::Rejected(reason));
        }

        self.lifecycle.initialized()?;
        *self.context.lock().unwrap_or_else(|e| e.into_inner()) = Some(context);

        Ok(InitOutcome::Ready)
    }

    async fn start(&self, reporter: RunReporter) -> Result<(), EngineError> {
        let context = self.context().ok_or(EngineError::InvalidState {
            operation: "start",
            state: self.lifecycle.state(),
        })?;

        self.lifecycle.begin_start()?;

        let child = match self.launch(&context, reporter.run_id()).await {
            Ok(child) => child,
            Err(e) => {
                self.lifecycle.finish(EngineState::Failed);
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(supervise(
            child,
            stop_rx,
            Arc::clone(&self.lifecycle),
            reporter,
        ));

        *self.supervisor.lock().await = Some(Supervisor {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        });

        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut guard = self.supervisor.lock().await;
        let Some(supervisor) = guard.as_mut() else {
            return Ok(());
        };

        if let Some(stop_tx) = supervisor.stop_tx.take() {
            // The supervisor may already have exited on its own.
            let _ = stop_tx.send(());
        }

        if let Some(handle) = supervisor.handle.as_mut() {
            if let Err(e) = handle.await {
                warn!("JMeter supervisor ended abnormally: {}", e);
            }
            supervisor.handle = None;
        }

        Ok(())
    }

    async fn abort(&self) {
        let mut guard = self.supervisor.lock().await;
        if let Some(handle) = guard.as_mut().and_then(|s| s.handle.take()) {
            // Dropping the supervisor drops the child, which kills it.
            handle.abort();
        }
        self.lifecycle.finish(EngineState::Stopped);
    }
}
