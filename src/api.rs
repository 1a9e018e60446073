use std::sync::Arc;

use anyhow::Result;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    clients::{health::HealthChecker, rbmq::RabbitMqClient},
    error::{BrokerError, EngineError},
    models::{
        channel::ChannelType,
        health::HealthStatus,
        message::{NotificationJob, NotificationPayload},
        preference::PreferenceUpdate,
        response::ApiResponse,
    },
    services::engine::{NotificationEngine, SubmitOutcome},
};

pub struct AppState {
    pub health_checker: HealthChecker,
    pub broker: Arc<RabbitMqClient>,
    pub engine: Arc<NotificationEngine>,
}

/// Body of `POST /notifications`. Attempt bookkeeping is owned by the engine.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub channel: ChannelType,
    pub recipient_id: String,
    pub organization_id: String,
    pub payload: NotificationPayload,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl SubmitRequest {
    fn into_job(self) -> NotificationJob {
        let mut job = NotificationJob::new(
            self.channel,
            self.recipient_id,
            self.organization_id,
            self.payload,
        )
        .with_max_attempts(self.max_attempts.unwrap_or(0));
        job.scheduled_at = self.scheduled_at;
        job
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/queues/{name}", get(queue_info))
        .route("/queues/{name}/purge", post(purge_queue))
        .route("/notifications", post(submit_notification))
        .route("/notifications/{id}/cancel", post(cancel_notification))
        .route(
            "/preferences/{organization_id}/{user_id}",
            get(get_preferences).put(update_preferences),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "Operations server started");

    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn queue_info(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.broker.queue_info(&name).await {
        Ok(info) => (
            StatusCode::OK,
            Json(ApiResponse::success(info, "Queue info retrieved".to_string())),
        )
            .into_response(),
        Err(e) => broker_error_response(&name, e),
    }
}

async fn purge_queue(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.broker.purge(&name).await {
        Ok(purged) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                purged,
                format!("Purged {} messages from {}", purged, name),
            )),
        )
            .into_response(),
        Err(e) => broker_error_response(&name, e),
    }
}

fn broker_error_response(queue: &str, error: BrokerError) -> Response {
    let status = match error {
        BrokerError::UnknownQueue(_) => StatusCode::NOT_FOUND,
        BrokerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    };

    warn!(queue, error = %error, "Queue operation failed");

    (
        status,
        Json(ApiResponse::<()>::error(
            error.to_string(),
            "Queue operation failed".to_string(),
        )),
    )
        .into_response()
}

async fn submit_notification(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let job = request.into_job();
    let job_id = job.id.clone();

    match state.engine.submit(job).await {
        Ok(SubmitOutcome::Queued) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(job_id, "Notification queued".to_string())),
        )
            .into_response(),
        Ok(SubmitOutcome::Blocked(rule)) => (
            StatusCode::OK,
            Json(ApiResponse::success(rule, "Notification blocked".to_string())),
        )
            .into_response(),
        Ok(SubmitOutcome::Rejected) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::error(
                "Broker refused the notification".to_string(),
                "Notification not queued".to_string(),
            )),
        )
            .into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn cancel_notification(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.engine.cancel_scheduled(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(id, "Notification cancelled".to_string())),
        )
            .into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    Path((organization_id, user_id)): Path<(String, String)>,
) -> Response {
    match state
        .engine
        .get_preferences(&user_id, &organization_id)
        .await
    {
        Ok(preference) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                preference,
                "Preferences retrieved".to_string(),
            )),
        )
            .into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn update_preferences(
    State(state): State<Arc<AppState>>,
    Path((organization_id, user_id)): Path<(String, String)>,
    Json(update): Json<PreferenceUpdate>,
) -> Response {
    match state
        .engine
        .update_preferences(&user_id, &organization_id, update)
        .await
    {
        Ok(preference) => (
            StatusCode::OK,
            Json(ApiResponse::success(
                preference,
                "Preferences updated".to_string(),
            )),
        )
            .into_response(),
        Err(e) => engine_error_response(e),
    }
}

fn engine_error_response(error: EngineError) -> Response {
    let status = match error {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Store(_) | EngineError::Broker(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    warn!(error = %error, "Engine operation failed");

    (
        status,
        Json(ApiResponse::<()>::error(
            error.to_string(),
            "Request failed".to_string(),
        )),
    )
        .into_response()
}
