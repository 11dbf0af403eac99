//! HTTP API handlers for coldtrack.
//!
//! Handlers are thin: they decode the request, call into
//! [`TelemetryService`], log the outcome and map [`CoreError`] to a status
//! code. Rejected arguments are `400`, unknown devices `404`, store failures
//! `500`. The in-memory registry keeps serving when the store is down.
//!
//! Time parameters are RFC 3339 (`2024-05-01T08:00:00Z`).

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::aggregation::DeviceReport;
use crate::error::CoreError;
use crate::model::{
    ChartQuery, ChartResponse, ClusterQuery, ClusterResponse, DeviceListQuery, DeviceState,
    FleetSummary, HistoryRecord, IngestResponse, RawTelemetry, TrackSummary, WindowQuery,
};
use crate::service::TelemetryService;
use crate::sync::PersistReport;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TelemetryService>,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/telemetry", post(post_telemetry))
        .route("/devices", get(list_devices))
        .route("/devices/:id", get(get_device).delete(delete_device))
        .route("/devices/:id/history", get(get_history))
        .route("/devices/:id/chart", get(get_chart))
        .route("/devices/:id/report", get(get_report))
        .route("/devices/:id/track", get(get_track))
        .route("/fleet/summary", get(get_fleet_summary))
        .route("/map/clusters", get(get_clusters))
        .route("/sync", post(post_sync))
        .route("/history", delete(purge_history))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn status_for(error: &CoreError) -> StatusCode {
    match error {
        CoreError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Persist(_) | CoreError::Store(_) | CoreError::Task(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// POST /telemetry - Ingest one device reading.
///
/// # Request Body
///
/// ```json
/// {
///     "id": "truck-7",
///     "status": "NORMAL",
///     "temperature": "4.2°C",
///     "humidity": 61,
///     "oxygen_level": "20.9%",
///     "location": { "lat": 31.23, "lng": 121.47 }
/// }
/// ```
///
/// Numeric fields accept numbers or unit-suffixed strings. Unparsable values
/// are stored as `0.0` and listed in `warnings`.
///
/// # Response
///
/// Returns `202 Accepted` with an [`IngestResponse`]. The store is never
/// awaited; `flush_queued` says whether a background flush was requested.
#[instrument(skip(state, telemetry), fields(device_id))]
pub async fn post_telemetry(
    State(state): State<AppState>,
    Json(telemetry): Json<RawTelemetry>,
) -> (StatusCode, Json<IngestResponse>) {
    tracing::Span::current().record("device_id", telemetry.id.as_str());

    let response = state.service.ingest(telemetry);

    if !response.warnings.is_empty() {
        warn!(
            device_id = %response.device_id,
            warnings = response.warnings.len(),
            "Telemetry accepted with data-quality warnings"
        );
    }

    (StatusCode::ACCEPTED, Json(response))
}

/// GET /devices - Current state of every live device, ordered by id.
///
/// # Query Parameters
///
/// - `status` (optional): `NORMAL`, `WARNING` or `ERROR`
pub async fn list_devices(
    State(state): State<AppState>,
    Query(query): Query<DeviceListQuery>,
) -> Json<Vec<DeviceState>> {
    Json(state.service.devices(query.status))
}

/// GET /fleet/summary - Live device counts by status.
///
/// # Response
///
/// ```json
/// {
///     "total": 4,
///     "status_counts": { "NORMAL": 2, "WARNING": 1, "ERROR": 1 },
///     "abnormal_count": 2,
///     "abnormal_rate": 0.5
/// }
/// ```
pub async fn get_fleet_summary(State(state): State<AppState>) -> Json<FleetSummary> {
    let summary = state.service.fleet_summary();
    info!(
        total = summary.total,
        abnormal = summary.abnormal_count,
        "Fleet summary queried"
    );
    Json(summary)
}

/// GET /devices/:id - Current state of one device.
#[instrument(skip(state))]
pub async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceState>, StatusCode> {
    state
        .service
        .device(&id)
        .map(|device| Json(device.as_ref().clone()))
        .map_err(|e| status_for(&e))
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveQuery {
    /// Also delete the device's persisted history and device row.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub device_id: String,
    pub purged_records: u64,
}

/// DELETE /devices/:id - Remove a device from the live registry.
///
/// Pending state is flushed before removal. With `?purge=true` its persisted
/// history is deleted first; if that fails the device stays registered.
#[instrument(skip(state))]
pub async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<RemoveResponse>, StatusCode> {
    match state.service.remove_device(&id, query.purge).await {
        Ok(retired) => Ok(Json(RemoveResponse {
            device_id: id,
            purged_records: retired.purged_records,
        })),
        Err(e) => {
            warn!(device_id = %id, purge = query.purge, error = %e, "Failed to remove device");
            Err(status_for(&e))
        }
    }
}

/// GET /devices/:id/history - Raw persisted history, ascending by time.
///
/// # Query Parameters
///
/// - `start` (optional): defaults to 24 hours before `end`
/// - `end` (optional): defaults to now
#[instrument(skip(state))]
pub async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Vec<HistoryRecord>>, StatusCode> {
    match state.service.history(&id, query.start, query.end).await {
        Ok(records) => {
            info!(device_id = %id, records = records.len(), "History queried");
            Ok(Json(records))
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "Failed to query history");
            Err(status_for(&e))
        }
    }
}

/// GET /devices/:id/chart - Downsampled series for one metric.
///
/// # Query Parameters
///
/// - `metric` (optional): `temperature` (default), `humidity` or `oxygen_level`
/// - `start`, `end` (optional): as for history
/// - `max_points` (optional): at least 2; defaults to the configured target
#[instrument(skip(state))]
pub async fn get_chart(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<ChartResponse>, StatusCode> {
    match state.service.chart(&id, query).await {
        Ok(chart) => {
            info!(
                device_id = %id,
                metric = ?chart.metric,
                source_points = chart.source_points,
                points = chart.points.len(),
                "Chart queried"
            );
            Ok(Json(chart))
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "Failed to build chart");
            Err(status_for(&e))
        }
    }
}

/// GET /devices/:id/report - Statistics, status distribution and durations.
#[instrument(skip(state))]
pub async fn get_report(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<DeviceReport>, StatusCode> {
    match state.service.report(&id, query.start, query.end).await {
        Ok(report) => {
            info!(device_id = %id, records = report.record_count, "Report generated");
            Ok(Json(report))
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "Failed to generate report");
            Err(status_for(&e))
        }
    }
}

/// GET /devices/:id/track - Located history with distance and average speed.
#[instrument(skip(state))]
pub async fn get_track(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<TrackSummary>, StatusCode> {
    match state.service.track(&id, query.start, query.end).await {
        Ok(track) => {
            info!(
                device_id = %id,
                points = track.points.len(),
                distance_m = track.total_distance_m,
                "Track queried"
            );
            Ok(Json(track))
        }
        Err(e) => {
            warn!(device_id = %id, error = %e, "Failed to query track");
            Err(status_for(&e))
        }
    }
}

/// GET /map/clusters - Cluster the live devices for map display.
///
/// # Query Parameters
///
/// - `radius_m` (optional): cluster radius in meters, defaults to the
///   configured radius
#[instrument(skip(state))]
pub async fn get_clusters(
    State(state): State<AppState>,
    Query(query): Query<ClusterQuery>,
) -> Result<Json<ClusterResponse>, StatusCode> {
    match state.service.clusters(query.radius_m) {
        Ok(response) => {
            info!(
                radius_m = response.radius_m,
                located = response.located_devices,
                clusters = response.clusters.len(),
                "Clusters queried"
            );
            Ok(Json(response))
        }
        Err(e) => {
            warn!(radius_m = ?query.radius_m, error = %e, "Failed to cluster devices");
            Err(status_for(&e))
        }
    }
}

/// POST /sync - Flush every device changed since the last flush.
#[instrument(skip(state))]
pub async fn post_sync(State(state): State<AppState>) -> Result<Json<PersistReport>, StatusCode> {
    match state.service.sync_now().await {
        Ok(report) => {
            info!(
                records = report.records_written,
                attempts = report.attempts,
                "Manual sync completed"
            );
            Ok(Json(report))
        }
        Err(e) => {
            warn!(error = %e, "Manual sync failed");
            Err(status_for(&e))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PurgeQuery {
    pub before: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub before: DateTime<Utc>,
    pub purged_records: u64,
}

/// DELETE /history?before= - Retention purge across all devices.
#[instrument(skip(state))]
pub async fn purge_history(
    State(state): State<AppState>,
    Query(query): Query<PurgeQuery>,
) -> Result<Json<PurgeResponse>, StatusCode> {
    match state.service.purge_before(query.before).await {
        Ok(purged_records) => Ok(Json(PurgeResponse {
            before: query.before,
            purged_records,
        })),
        Err(e) => {
            warn!(before = %query.before, error = %e, "Failed to purge history");
            Err(status_for(&e))
        }
    }
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}
