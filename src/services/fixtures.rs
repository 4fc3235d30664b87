//! Demo data for development environments.
//!
//! Seeding is explicit: it only happens when requested at startup and only
//! into an empty store.

use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::LoadTest;
use crate::store::LoadTestStore;

/// Number of demo load tests seeded by default.
pub const DEFAULT_FIXTURE_COUNT: usize = 100;

/// Insert `count` demo load tests spread randomly across `projects`.
///
/// Does nothing when the store already holds load tests. Returns the number
/// of tests inserted.
pub async fn seed_demo_load_tests(
    store: &dyn LoadTestStore,
    projects: &[String],
    count: usize,
) -> AppResult<usize> {
    if store.count().await? > 0 {
        info!("Load test store is not empty, skipping demo fixtures");
        return Ok(0);
    }

    if projects.is_empty() {
        return Err(AppError::InvalidInput(
            "at least one project is required to seed demo load tests".to_string(),
        ));
    }

    for i in 0..count {
        let project = &projects[rand::random_range(0..projects.len())];
        let mut test = LoadTest::new(project.clone(), format!("load test {}", i));
        test.description = Uuid::new_v4().to_string();
        test.scenario_definition = Uuid::new_v4().to_string();
        store.insert(&test).await?;
    }

    info!(
        "Seeded {} demo load tests across {} project(s)",
        count,
        projects.len()
    );

    Ok(count)
}
