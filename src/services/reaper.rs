//! Reclaiming stale cluster directory entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::cluster::RunDirectory;
use crate::error::AppResult;
use crate::models::NodeId;

/// Configuration for the reaper task.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How long terminal entries are kept, in hours
    pub retention_hours: u64,
    /// How often to purge (in seconds)
    pub interval_secs: u64,
}

/// Fail every entry this node still lists as running.
///
/// Runs once at startup, before requests are served: a previous process
/// with the same node id owned those runs and is gone.
pub async fn reap_on_startup(directory: &dyn RunDirectory, node_id: &NodeId) -> AppResult<u64> {
    let reaped = directory.reap_node(node_id).await?;
    if reaped > 0 {
        warn!(
            "Marked {} run(s) left over from a previous process on node {} as failed",
            reaped, node_id
        );
    }
    Ok(reaped)
}

/// Start the background task that purges old terminal entries.
pub fn start_reaper_task(directory: Arc<dyn RunDirectory>, config: ReaperConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Starting reaper (retention: {} hours, interval: {} seconds)",
            config.retention_hours, config.interval_secs
        );

        let mut ticker = interval(Duration::from_secs(config.interval_secs.max(1)));

        loop {
            ticker.tick().await;

            match purge_once(directory.as_ref(), &config).await {
                Ok(0) => debug!("Reaper found nothing to purge"),
                Ok(purged) => info!("Purged {} finished run record(s)", purged),
                Err(e) => error!("Reaper task error: {}", e),
            }
        }
    })
}

async fn purge_once(directory: &dyn RunDirectory, config: &ReaperConfig) -> AppResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::hours(config.retention_hours as i64);
    directory.purge_finished(cutoff).await
}
