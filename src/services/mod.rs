//! Business logic services.

pub mod event_broadcaster;
pub mod fixtures;
pub mod orchestrator;
pub mod reaper;

pub use event_broadcaster::{EventBroadcaster, RunWatch};
pub use fixtures::{DEFAULT_FIXTURE_COUNT, seed_demo_load_tests};
pub use load_test::LoadTestService;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, OrchestratorSettings};
pub use reaper::{ReaperConfig, reap_on_startup, start_reaper_task};
