//! Engine state machine shared by engine variants.

use std::sync::Mutex;

use super::{EngineError, EngineState};

/// Thread-safe engine state with the legal transitions:
/// `Created -> Initialized -> Running -> {Completed, Stopped, Failed}`.
#[derive(Debug)]
pub struct Lifecycle {
    state: Mutex<EngineState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Created),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    /// Record a successful `init`. Re-initializing before start is allowed.
    pub fn initialized(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        match *state {
            EngineState::Created | EngineState::Initialized => {
                *state = EngineState::Initialized;
                Ok(())
            }
            other => Err(EngineError::InvalidState {
                operation: "init",
                state: other,
            }),
        }
    }

    /// Enter `Running`. Fails unless the engine was initialized.
    pub fn begin_start(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        match *state {
            EngineState::Initialized => {
                *state = EngineState::Running;
                Ok(())
            }
            other => Err(EngineError::InvalidState {
                operation: "start",
                state: other,
            }),
        }
    }

    /// Move a running engine into a terminal state.
    ///
    /// Returns false when the engine was not running, so only the first
    /// terminal transition wins.
    pub fn finish(&self, terminal: EngineState) -> bool {
        debug_assert!(terminal.is_terminal());
        let mut state = self.lock();
        if *state == EngineState::Running {
            *state = terminal;
            true
        } else {
            false
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        // State is a plain Copy value, a poisoned lock still holds a valid one.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
