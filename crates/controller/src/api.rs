//! HTTP API: health, Prometheus metrics, diagnostics and southbound events

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use fabric_lib::{
    health::{ComponentStatus, HealthRegistry},
    scheduler::SchedulerSnapshot,
    sinks::{PlacementStore, RouteTable, SliceStore},
    FabricController, HostAddr, PlacementTable, PortCounters, RouteRule, SchedulerError,
    SliceTable, StoreError,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub controller: Arc<FabricController>,
    pub placements: Arc<dyn PlacementStore>,
    pub slices: Arc<dyn SliceStore>,
    /// Rules handed to the southbound adapter
    pub routes: Arc<RouteTable>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        controller: Arc<FabricController>,
        placements: Arc<dyn PlacementStore>,
        slices: Arc<dyn SliceStore>,
        routes: Arc<RouteTable>,
    ) -> Self {
        Self {
            health_registry,
            controller,
            placements,
            slices,
            routes,
        }
    }
}

/// Error body returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::UnknownSwitch(_) => StatusCode::NOT_FOUND,
            SchedulerError::TransportClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        warn!(error = %e, "Store read failed");
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        }
    }
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn snapshot(State(state): State<Arc<AppState>>) -> Json<SchedulerSnapshot> {
    Json(state.controller.scheduler().snapshot().await)
}

async fn placements(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PlacementTable>, ApiError> {
    Ok(Json(state.placements.read_all().await?))
}

async fn slices(State(state): State<Arc<AppState>>) -> Result<Json<SliceTable>, ApiError> {
    Ok(Json(state.slices.read_all().await?))
}

#[derive(Debug, Deserialize)]
pub struct RoutesQuery {
    pub dpid: Option<u16>,
}

async fn routes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RoutesQuery>,
) -> Json<Vec<RouteRule>> {
    let rules = match query.dpid {
        Some(dpid) => state.routes.rules_for(dpid),
        None => state.routes.list(),
    };
    Json(rules)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchConnectedEvent {
    pub dpid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SwitchConnectedResponse {
    pub switch: String,
    pub dpid: u16,
}

async fn switch_connected(
    State(state): State<Arc<AppState>>,
    Json(event): Json<SwitchConnectedEvent>,
) -> Result<Json<SwitchConnectedResponse>, ApiError> {
    let switch = state.controller.switch_connected(event.dpid).await?;
    Ok(Json(SwitchConnectedResponse {
        switch: switch.name(),
        dpid: switch.dpid(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortStatsEvent {
    pub dpid: u64,
    pub stats: Vec<PortCounters>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PortStatsResponse {
    pub merged: usize,
}

async fn port_stats(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PortStatsEvent>,
) -> Json<PortStatsResponse> {
    let merged = state
        .controller
        .port_stats_reply(event.dpid, &event.stats)
        .await;
    Json(PortStatsResponse { merged })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PacketInEvent {
    pub dpid: u64,
    pub src: HostAddr,
    pub dst: HostAddr,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PacketInResponse {
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RouteRule>,
}

async fn packet_in(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PacketInEvent>,
) -> Result<Json<PacketInResponse>, ApiError> {
    let rule = state
        .controller
        .packet_in(event.dpid, event.src, event.dst)
        .await?;
    Ok(Json(PacketInResponse {
        installed: rule.is_some(),
        rule,
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/snapshot", get(snapshot))
        .route("/api/v1/placements", get(placements))
        .route("/api/v1/slices", get(slices))
        .route("/api/v1/routes", get(routes))
        .route("/api/v1/events/switch-connected", post(switch_connected))
        .route("/api/v1/events/port-stats", post(port_stats))
        .route("/api/v1/events/packet-in", post(packet_in))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
