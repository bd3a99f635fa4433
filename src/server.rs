//! HTTP API for bulk-upload jobs.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/api/jobs?page&pageSize&status` | List jobs, newest first |
//! | `POST`   | `/api/jobs` | Create a job and queue it for processing |
//! | `GET`    | `/api/jobs/stats` | Aggregate job statistics |
//! | `GET`    | `/api/jobs/{id}` | One job with live progress |
//! | `DELETE` | `/api/jobs/{id}` | Cancel a queued job or delete a finished one |
//! | `GET`    | `/health` | Version and broker connectivity |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Job not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `queue_unavailable` (503), `internal` (500). Datastore failures are logged
//! and reported as `internal` without their detail.

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::IngestError;
use crate::models::{JobQuery, JobStats, JobStatus};
use crate::service::{CreateJobRequest, CreateJobResponse, JobListResponse, JobService, JobView};

/// Builds the router. Split out from [`run_server`] so tests can serve it on
/// their own listener.
pub fn router(service: JobService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(handle_list_jobs).post(handle_create_job))
        .route("/api/jobs/stats", get(handle_stats))
        .route("/api/jobs/{id}", get(handle_get_job).delete(handle_delete_job))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

/// Serves the API on `[server].bind` until `shutdown` is cancelled.
pub async fn run_server(
    config: &Config,
    service: JobService,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let app = router(service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "HTTP API listening");
    println!("Job API listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code,
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidRequest(message)
            | IngestError::Format(message)
            | IngestError::Validation { message, .. } => bad_request(message),
            IngestError::DuplicateKey(_) | IngestError::Referential(_) => {
                bad_request(err.to_string())
            }
            IngestError::NotFound(message) => {
                app_error(StatusCode::NOT_FOUND, "not_found", message)
            }
            IngestError::Conflict(message) => app_error(StatusCode::CONFLICT, "conflict", message),
            IngestError::Queue(message) | IngestError::Transport(message) => app_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "queue_unavailable",
                message,
            ),
            IngestError::Store(inner) => {
                tracing::error!(error = %inner, "datastore error");
                app_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "Internal server error",
                )
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    broker_healthy: bool,
}

async fn handle_health(State(service): State<JobService>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        broker_healthy: service.publisher().is_healthy().await,
    })
}

// ============ GET /api/jobs ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    page: Option<u32>,
    page_size: Option<u32>,
    status: Option<String>,
}

/// `status` may be a name in any case or a numeric code.
async fn handle_list_jobs(
    State(service): State<JobService>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<JobListResponse>, AppError> {
    let Query(params) = params.map_err(|e| bad_request(e.body_text()))?;
    let defaults = JobQuery::default();

    let status = match params.status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<JobStatus>().map_err(bad_request)?),
    };
    let query = JobQuery {
        page: params.page.unwrap_or(defaults.page),
        page_size: params.page_size.unwrap_or(defaults.page_size),
        status,
    };

    Ok(Json(service.list_jobs(query).await?))
}

// ============ POST /api/jobs ============

async fn handle_create_job(
    State(service): State<JobService>,
    body: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<CreateJobResponse>, AppError> {
    let Json(request) = body.map_err(|e| bad_request(e.body_text()))?;
    Ok(Json(service.create_job(request).await?))
}

// ============ GET /api/jobs/stats ============

async fn handle_stats(State(service): State<JobService>) -> Result<Json<JobStats>, AppError> {
    Ok(Json(service.stats().await?))
}

// ============ GET /api/jobs/{id} ============

async fn handle_get_job(
    State(service): State<JobService>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(service.get_job(&id).await?))
}

// ============ DELETE /api/jobs/{id} ============

#[derive(Serialize)]
struct MessageResponse {
    message: &'static str,
}

async fn handle_delete_job(
    State(service): State<JobService>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, AppError> {
    let outcome = service.delete_job(&id).await?;
    Ok(Json(MessageResponse {
        message: outcome.message(),
    }))
}
