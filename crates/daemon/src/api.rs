use crate::allocator::PortAllocator;
use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use portalloc_common::{
    AllocateRequest, AllocationError, AvailabilityResponse, BatchAllocateRequest, PortAllocation, PortQuery,
    RangeQuery, RangeResponse, ReleaseOwnerRequest, ReleaseRequest,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<dyn PortAllocator>,
}

impl AppState {
    pub fn new(allocator: Arc<dyn PortAllocator>) -> Self {
        Self { allocator }
    }
}

/// Allocation errors rendered as a JSON body with a matching status code.
#[derive(Debug)]
pub struct ApiError(pub AllocationError);

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AllocationError::InvalidPort { .. }
            | AllocationError::InvalidProtocol { .. }
            | AllocationError::InvalidOwner { .. } => StatusCode::BAD_REQUEST,
            AllocationError::PortConflict { .. } => StatusCode::CONFLICT,
            AllocationError::PortNotFound { .. } => StatusCode::NOT_FOUND,
            AllocationError::Store { .. } | AllocationError::RollbackFailed { .. } => {
                error!("{}", self.0);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(self.0)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct ServerQuery {
    server_id: i64,
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner_id: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alloc", post(allocate_port))
        .route("/alloc/batch", post(allocate_batch))
        .route("/release", post(release_port))
        .route("/release/owner", post(release_owner))
        .route("/allocation", get(get_allocation))
        .route("/available", get(check_available))
        .route("/list", get(list_server))
        .route("/owner", get(list_owner))
        .route("/range", get(available_range))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Store calls block on SQLite, so they run off the async workers.
async fn run_blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&dyn PortAllocator) -> Result<T, AllocationError> + Send + 'static,
    T: Send + 'static,
{
    let allocator = Arc::clone(&state.allocator);
    tokio::task::spawn_blocking(move || f(allocator.as_ref()))
        .await
        .map_err(AllocationError::store)?
        .map_err(ApiError)
}

async fn allocate_port(
    State(state): State<AppState>,
    Json(payload): Json<AllocateRequest>,
) -> Result<(StatusCode, Json<PortAllocation>), ApiError> {
    let allocation = run_blocking(&state, move |allocator| {
        allocator.allocate_port(payload.server_id, payload.port, &payload.protocol, payload.owner_id)?;
        allocator.get_port_allocation(payload.server_id, payload.port, &payload.protocol)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(allocation)))
}

async fn allocate_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchAllocateRequest>,
) -> Result<(StatusCode, Json<Vec<PortAllocation>>), ApiError> {
    let allocations = run_blocking(&state, move |allocator| {
        allocator.allocate_multiple_ports(payload.server_id, &payload.bindings, payload.owner_id)?;
        let held = allocator.list_ports_by_owner(payload.owner_id)?;
        Ok(held
            .into_iter()
            .filter(|a| {
                a.server_id == payload.server_id
                    && payload
                        .bindings
                        .iter()
                        .any(|b| b.host_port == i64::from(a.port) && b.protocol == a.protocol.as_str())
            })
            .collect())
    })
    .await?;
    Ok((StatusCode::CREATED, Json(allocations)))
}

async fn release_port(
    State(state): State<AppState>,
    Json(payload): Json<ReleaseRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(&state, move |allocator| {
        allocator.deallocate_port(payload.server_id, payload.port, &payload.protocol)
    })
    .await?;
    Ok(StatusCode::OK)
}

async fn release_owner(
    State(state): State<AppState>,
    Json(payload): Json<ReleaseOwnerRequest>,
) -> Result<StatusCode, ApiError> {
    run_blocking(&state, move |allocator| allocator.deallocate_ports_by_owner(payload.owner_id)).await?;
    Ok(StatusCode::OK)
}

async fn get_allocation(
    State(state): State<AppState>,
    Query(params): Query<PortQuery>,
) -> Result<Json<PortAllocation>, ApiError> {
    let allocation = run_blocking(&state, move |allocator| {
        allocator.get_port_allocation(params.server_id, params.port, &params.protocol)
    })
    .await?;
    Ok(Json(allocation))
}

async fn check_available(
    State(state): State<AppState>,
    Query(params): Query<PortQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    run_blocking(&state, move |allocator| {
        let available = allocator.is_port_available(params.server_id, params.port, &params.protocol)?;
        Ok(AvailabilityResponse {
            server_id: params.server_id,
            port: params.port,
            protocol: params.protocol,
            available,
        })
    })
    .await
    .map(Json)
}

async fn list_server(
    State(state): State<AppState>,
    Query(params): Query<ServerQuery>,
) -> Result<Json<Vec<PortAllocation>>, ApiError> {
    run_blocking(&state, move |allocator| allocator.list_allocated_ports(params.server_id))
        .await
        .map(Json)
}

async fn list_owner(
    State(state): State<AppState>,
    Query(params): Query<OwnerQuery>,
) -> Result<Json<Vec<PortAllocation>>, ApiError> {
    run_blocking(&state, move |allocator| allocator.list_ports_by_owner(params.owner_id))
        .await
        .map(Json)
}

async fn available_range(
    State(state): State<AppState>,
    Query(params): Query<RangeQuery>,
) -> Result<Json<RangeResponse>, ApiError> {
    let ports = run_blocking(&state, move |allocator| {
        allocator.get_available_ports_in_range(
            params.server_id,
            &params.protocol,
            params.start,
            params.end,
            params.limit,
        )
    })
    .await?;
    Ok(Json(RangeResponse { ports }))
}

async fn health() -> &'static str {
    "ok"
}
