//! Forwarding stop requests to the node that owns a run.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{info, warn};

use super::DirectoryEntry;
use crate::auth::ClusterToken;
use crate::error::{AppError, AppResult, ErrorResponse, Missing};
use crate::models::StopOutcome;

/// Header carrying the shared secret on peer requests.
pub const CLUSTER_TOKEN_HEADER: &str = "X-Cluster-Token";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers a stop request to a run's owning node.
#[async_trait]
pub trait StopForwarder: Send + Sync {
    async fn forward_stop(&self, entry: &DirectoryEntry) -> AppResult<StopOutcome>;
}

/// Forwards over the peer HTTP API.
#[derive(Clone)]
pub struct HttpStopForwarder {
    client: reqwest::Client,
    token: ClusterToken,
}

impl HttpStopForwarder {
    pub fn new(token: ClusterToken, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Cluster(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, token })
    }

    fn stop_url(entry: &DirectoryEntry) -> String {
        format!(
            "{}/api/v1/cluster/runs/{}/stop",
            entry.node_url.trim_end_matches('/'),
            entry.run_id
        )
    }
}

#[async_trait]
impl StopForwarder for HttpStopForwarder {
    async fn forward_stop(&self, entry: &DirectoryEntry) -> AppResult<StopOutcome> {
        let url = Self::stop_url(entry);
        info!(
            "Forwarding stop of run {} to node {} ({})",
            entry.run_id, entry.node_id, url
        );

        let mut request = self.client.post(&url);
        if let Some(token) = self.token.header_value() {
            request = request.header(CLUSTER_TOKEN_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            AppError::Cluster(format!(
                "Failed to reach node {} for run {}: {}",
                entry.node_id, entry.run_id, e
            ))
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json::<StopOutcome>().await.map_err(|e| {
                AppError::Cluster(format!(
                    "Invalid stop response from node {}: {}",
                    entry.node_id, e
                ))
            });
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map(|body| body.message)
            .unwrap_or_else(|_| status.to_string());
        warn!(
            "Node {} refused stop of run {}: {} {}",
            entry.node_id, entry.run_id, status, message
        );

        match status {
            StatusCode::NOT_FOUND => Err(AppError::NotFound(Missing::Run(entry.run_id))),
            _ => Err(AppError::Cluster(format!(
                "Node {} failed to stop run {}: {}",
                entry.node_id, entry.run_id, message
            ))),
        }
    }
}
