//! Event broadcaster for run lifecycle events.
//!
//! Uses tokio::sync::broadcast to fan out events to every subscriber.
//! [`RunWatch`] narrows a subscription down to a single run.

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::models::{RunEvent, RunEventMessage, RunFinishedPayload, RunId, RunRecord};

/// Default capacity for the broadcast channel.
const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Fans out run events to all subscribers.
#[derive(Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<RunEventMessage>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEventMessage> {
        self.sender.subscribe()
    }

    /// Subscribe to future events of one run.
    pub fn watch(&self, run_id: RunId) -> RunWatch {
        RunWatch {
            run_id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Announce a run registered as running.
    pub fn run_started(&self, record: &RunRecord) -> usize {
        self.send(RunEventMessage::new(RunEvent::run_started(
            record.run_id,
            record.test_id,
            record.node_id.clone(),
            &record.engine,
        )))
    }

    /// Announce a run that reached its terminal state.
    pub fn run_finished(&self, record: &RunRecord) -> usize {
        self.send(RunEventMessage::new(RunEvent::run_finished(
            record.run_id,
            record.test_id,
            record.state,
            record.error.clone(),
        )))
    }

    /// Broadcast an event. Returns the number of receivers, 0 when nobody listens.
    pub fn send(&self, event: RunEventMessage) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription filtered to the events of a single run.
pub struct RunWatch {
    run_id: RunId,
    receiver: broadcast::Receiver<RunEventMessage>,
}

impl RunWatch {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event of the watched run, `None` once the broadcaster is gone.
    ///
    /// Events lost to a lagging receiver are skipped.
    pub async fn next(&mut self) -> Option<RunEventMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.run_id() == self.run_id => return Some(message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "Watcher of run {} lagged, {} event(s) skipped",
                        self.run_id, skipped
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Wait for the run to finish.
    pub async fn finished(&mut self) -> Option<RunFinishedPayload> {
        while let Some(message) = self.next().await {
            if let RunEvent::RunFinished(payload) = message.event {
                return Some(payload);
            }
        }
        None
    }
}
