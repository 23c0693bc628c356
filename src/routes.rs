use std::sync::Arc;

use axum::{
    extract::State,
    http::{Method, StatusCode},
    routing::{get, post},
    Json,
    Router,
};
use data_model::{MembershipDelta, QueryExecRequest, QuerySchedule};
use tokio::sync::mpsc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

use crate::{
    http_objects::{ApiError, BackendsList, SchedulerStats},
    scheduler::Scheduler,
};

#[derive(Clone)]
pub struct RouteState {
    pub scheduler: Arc<Scheduler>,
    /// Feed of the membership updater. `None` when the membership is static.
    pub membership_tx: Option<mpsc::Sender<MembershipDelta>>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route("/backends", get(list_backends))
        .route("/v1/schedule", post(schedule_query))
        .route("/internal/membership", post(update_membership))
        .route("/internal/scheduler/stats", get(scheduler_stats))
        .with_state(route_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[tracing::instrument(skip_all)]
async fn index() -> &'static str {
    "Scan Range Scheduler"
}

#[tracing::instrument(skip_all)]
async fn list_backends(State(state): State<RouteState>) -> Json<BackendsList> {
    let backends = state.scheduler.backend_config().backend_addresses();
    Json(BackendsList { backends })
}

#[tracing::instrument(skip_all)]
async fn schedule_query(
    State(state): State<RouteState>,
    Json(request): Json<QueryExecRequest>,
) -> Result<Json<QuerySchedule>, ApiError> {
    let schedule = state.scheduler.schedule(&request)?;
    Ok(Json(schedule))
}

#[tracing::instrument(skip_all)]
async fn update_membership(
    State(state): State<RouteState>,
    Json(delta): Json<MembershipDelta>,
) -> Result<StatusCode, ApiError> {
    let Some(membership_tx) = state.membership_tx else {
        return Err(ApiError::bad_request(
            "membership is static, deltas are not accepted",
        ));
    };
    info!(
        num_entries = delta.entries.len(),
        num_deletions = delta.deletions.len(),
        is_delta = delta.is_delta,
        "received membership delta"
    );
    membership_tx
        .send(delta)
        .await
        .map_err(|_| ApiError::unavailable("membership updater is not running"))?;
    Ok(StatusCode::ACCEPTED)
}

#[tracing::instrument(skip_all)]
async fn scheduler_stats(State(state): State<RouteState>) -> Json<SchedulerStats> {
    let metrics = state.scheduler.metrics();
    Json(SchedulerStats {
        total_assignments: metrics.num_assignments(),
        total_local_assignments: metrics.num_local_assignments(),
        num_backends: metrics.num_backends(),
        num_backend_hosts: state.scheduler.backend_config().num_backend_hosts(),
    })
}
