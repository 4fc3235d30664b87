//! Peer endpoints used by other nodes of the cluster.
//!
//! Stop requests arriving here are never forwarded again: a node only acts on
//! runs it owns.

use actix_web::{HttpResponse, get, post, web};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::ClusterAuth;
use crate::error::AppResult;
use crate::models::{NodeId, RunId, RunRecord};
use crate::services::Orchestrator;

/// Runs owned by the answering node.
#[derive(Debug, Serialize, ToSchema)]
pub struct ActiveRunsResponse {
    pub node_id: NodeId,
    pub runs: Vec<RunRecord>,
}

/// List the runs this node currently owns.
#[utoipa::path(
    get,
    path = "/api/v1/cluster/runs",
    tag = "Cluster",
    responses(
        (status = 200, description = "Active runs on this node", body = ActiveRunsResponse),
        (status = 401, description = "Missing or invalid cluster token", body = crate::error::ErrorResponse)
    ),
    security(("cluster_token" = []))
)]
#[get("/cluster/runs")]
pub async fn list_active_runs(
    _auth: ClusterAuth,
    orchestrator: web::Data<Orchestrator>,
) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(ActiveRunsResponse {
        node_id: orchestrator.node().id.clone(),
        runs: orchestrator.active_runs(),
    }))
}

/// Stop a run owned by this node.
#[utoipa::path(
    post,
    path = "/api/v1/cluster/runs/{run_id}/stop",
    tag = "Cluster",
    params(
        ("run_id" = Uuid, Path, description = "Run ID")
    ),
    responses(
        (status = 200, description = "Stop outcome", body = crate::models::StopOutcome),
        (status = 401, description = "Missing or invalid cluster token", body = crate::error::ErrorResponse),
        (status = 404, description = "Run is not owned by this node", body = crate::error::ErrorResponse)
    ),
    security(("cluster_token" = []))
)]
#[post("/cluster/runs/{run_id}/stop")]
pub async fn stop_run(
    _auth: ClusterAuth,
    orchestrator: web::Data<Orchestrator>,
    path: web::Path<Uuid>,
) -> AppResult<HttpResponse> {
    let run_id = RunId::from(path.into_inner());
    tracing::info!("Peer requested stop of run {}", run_id);

    let outcome = orchestrator.stop_local(run_id).await?;
    Ok(HttpResponse::Ok().json(outcome))
}

/// Configure cluster routes.
pub fn configure_cluster_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(list_active_runs).service(stop_run);
}
