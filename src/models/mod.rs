//! Domain models for the load test run orchestrator.

pub mod run;
pub mod run_event;
pub mod test_file;

// Re-export commonly used types
pub use load_test::{EditLoadTestRequest, LoadTest, QueryLoadTestsParams, SaveLoadTestRequest};
pub use run::{NodeId, NodeInfo, RunId, RunRecord, RunState, StopOutcome};
pub use run_event::{RunEvent, RunEventMessage, RunFinishedPayload, RunStartedPayload};
pub use test_file::{FileContent, FileUpload, LoadTestFileType, TestFile, normalize_file_type};
