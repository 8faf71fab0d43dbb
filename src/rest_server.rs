use crate::admin::{AdminError, AdminService};
use crate::connection_manager::{ConnectionStatus, UpdateOutcome};
use crate::db::StoreError;
use crate::dispatcher::{dispatch_http_reading, HttpReading, IngestError, MessageDispatcher};
use crate::fanout::{FanoutEvent, RealtimeFanout};
use crate::models::{BrokerConfig, BrokerConfigInput, NewSensorType, Reading, Sensor, SensorFilter, SensorType};
use crate::reading_store::ReadingStore;
use crate::sensor_registry::{SensorRegistration, SensorSettings};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

const DEFAULT_READINGS_LIMIT: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub admin: Arc<AdminService>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub readings: Arc<ReadingStore>,
    pub fanout: RealtimeFanout,
}

/// Error body returned by every endpoint.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }

    fn internal(err: impl std::fmt::Display) -> Self {
        // Details stay in the log.
        error!("Internal error: {}", err);
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", "internal server error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AdminError> for ApiError {
    fn from(err: AdminError) -> Self {
        match err {
            AdminError::Validation(message) => {
                ApiError::new(StatusCode::BAD_REQUEST, "validation", message)
            }
            e @ AdminError::NotFound { .. } => {
                ApiError::new(StatusCode::NOT_FOUND, "not_found", e.to_string())
            }
            AdminError::Conflict(message) => ApiError::new(StatusCode::CONFLICT, "conflict", message),
            e @ (AdminError::Store(_) | AdminError::Worker(_)) => ApiError::internal(e),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            e @ IngestError::UnknownSensor(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "sensor_not_found", e.to_string())
            }
            e @ IngestError::InactiveSensor(_) => {
                ApiError::new(StatusCode::CONFLICT, "sensor_inactive", e.to_string())
            }
            e @ IngestError::InvalidTimestamp(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_timestamp", e.to_string())
            }
            e @ (IngestError::Store(_) | IngestError::Worker(_)) => ApiError::internal(e),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::from(AdminError::from(err))
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connections: Vec<ConnectionStatus>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connections: state.admin.connection_status().await,
    })
}

async fn list_broker_configs(State(state): State<AppState>) -> ApiResult<Vec<BrokerConfig>> {
    Ok(Json(state.admin.list_broker_configs().await?))
}

async fn create_broker_config(
    State(state): State<AppState>,
    Json(input): Json<BrokerConfigInput>,
) -> Result<(StatusCode, Json<BrokerConfig>), ApiError> {
    let config = state.admin.create_broker_config(input).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

async fn get_broker_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<BrokerConfig> {
    Ok(Json(state.admin.get_broker_config(id).await?))
}

async fn update_broker_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(input): Json<BrokerConfigInput>,
) -> ApiResult<BrokerConfig> {
    Ok(Json(state.admin.update_broker_config(id, input).await?))
}

async fn deactivate_broker_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<BrokerConfig> {
    Ok(Json(state.admin.deactivate_broker_config(id).await?))
}

#[derive(Serialize)]
struct ReconnectResponse {
    outcome: &'static str,
}

async fn reconnect_broker_config(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<ReconnectResponse> {
    let outcome = match state.admin.reconnect(id).await? {
        UpdateOutcome::Opened => "opened",
        UpdateOutcome::Reconnected => "reconnected",
        UpdateOutcome::Resubscribed(_) => "resubscribed",
        UpdateOutcome::Closed => "closed",
    };
    Ok(Json(ReconnectResponse { outcome }))
}

async fn list_sensor_types(State(state): State<AppState>) -> ApiResult<Vec<SensorType>> {
    Ok(Json(state.admin.list_sensor_types().await?))
}

async fn get_sensor_type(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<SensorType> {
    Ok(Json(state.admin.get_sensor_type(id).await?))
}

async fn create_sensor_type(
    State(state): State<AppState>,
    Json(input): Json<NewSensorType>,
) -> Result<(StatusCode, Json<SensorType>), ApiError> {
    let sensor_type = state.admin.create_sensor_type(input).await?;
    Ok((StatusCode::CREATED, Json(sensor_type)))
}

async fn list_sensors(
    State(state): State<AppState>,
    Query(filter): Query<SensorFilter>,
) -> ApiResult<Vec<Sensor>> {
    Ok(Json(state.admin.list_sensors(filter).await?))
}

async fn register_sensor(
    State(state): State<AppState>,
    Json(input): Json<SensorRegistration>,
) -> Result<(StatusCode, Json<Sensor>), ApiError> {
    let sensor = state.admin.register_sensor(input).await?;
    Ok((StatusCode::CREATED, Json(sensor)))
}

async fn get_sensor(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Sensor> {
    Ok(Json(state.admin.get_sensor(id).await?))
}

async fn update_sensor_settings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(settings): Json<SensorSettings>,
) -> ApiResult<Sensor> {
    Ok(Json(state.admin.update_sensor_settings(id, settings).await?))
}

/// HTTP ingestion fallback for devices that cannot speak the broker protocol.
async fn ingest_reading(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(reading): Json<HttpReading>,
) -> Result<(StatusCode, Json<Reading>), ApiError> {
    let outcome = dispatch_http_reading(state.dispatcher.clone(), id, reading).await?;
    Ok((StatusCode::CREATED, Json(outcome.reading)))
}

#[derive(Debug, Deserialize)]
struct ReadingRange {
    #[serde(default, with = "time::serde::rfc3339::option")]
    from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    to: Option<OffsetDateTime>,
    limit: Option<usize>,
}

async fn list_readings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(range): Query<ReadingRange>,
) -> ApiResult<Vec<Reading>> {
    // 404 for unknown sensors rather than an empty list.
    state.admin.get_sensor(id).await?;
    let readings = state.readings.clone();
    let limit = range.limit.unwrap_or(DEFAULT_READINGS_LIMIT);
    let rows = tokio::task::spawn_blocking(move || readings.range(id, range.from, range.to, limit))
        .await
        .map_err(ApiError::internal)??;
    Ok(Json(rows))
}

/// Server-sent events feed of the realtime fan-out.
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.fanout.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((Ok(sse_event(&event)), rx)),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn sse_event(event: &FanoutEvent) -> Event {
    let data = match event {
        FanoutEvent::Reading(tick) => serde_json::to_string(tick),
        FanoutEvent::SensorChanged(sensor) => serde_json::to_string(sensor),
    }
    .unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.name()).data(data)
}

pub fn build_router(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/broker-configs",
            get(list_broker_configs).post(create_broker_config),
        )
        .route(
            "/broker-configs/{id}",
            get(get_broker_config).put(update_broker_config),
        )
        .route(
            "/broker-configs/{id}/deactivate",
            post(deactivate_broker_config),
        )
        .route("/broker-configs/{id}/reconnect", post(reconnect_broker_config))
        .route(
            "/sensor-types",
            get(list_sensor_types).post(create_sensor_type),
        )
        .route("/sensor-types/{id}", get(get_sensor_type))
        .route("/sensors", get(list_sensors).post(register_sensor))
        .route("/sensors/{id}", get(get_sensor))
        .route("/sensors/{id}/settings", axum::routing::put(update_sensor_settings))
        .route(
            "/sensors/{id}/readings",
            get(list_readings).post(ingest_reading),
        )
        .route("/events", get(events))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves the API until `shutdown` resolves.
pub async fn run_rest_server(
    state: AppState,
    bind_addr: &str,
    body_limit: usize,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!("REST API listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state, body_limit))
        .with_graceful_shutdown(shutdown)
        .await
}
