//! HTTP routes: `POST /execute`, `GET /status/{job_id}`, `GET /health`

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::api::service::SubmissionService;
use crate::context::AppContext;
use crate::core::{Job, JobStatus};
use crate::error::{Error, ValidationError};
use crate::worker::Heartbeat;

// ---- App State ----

#[derive(Clone)]
struct ApiState {
    service: Arc<SubmissionService>,
    heartbeat: Heartbeat,
}

// ---- Error Handling ----

/// Maps library errors onto status codes and a `{error, kind}` body
pub struct AppError(Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Validation(ValidationError::Overloaded { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "overloaded")
            }
            Error::Validation(v) => (StatusCode::BAD_REQUEST, v.kind()),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            other => {
                error!("Request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string(), "kind": kind }));
        (status, body).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

fn bad_request(rejection: JsonRejection) -> Response {
    let body = Json(serde_json::json!({
        "error": rejection.body_text(),
        "kind": "invalid_request",
    }));
    (StatusCode::BAD_REQUEST, body).into_response()
}

// ---- Request/Response Types ----

#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    language: String,
    code: String,
    #[serde(default)]
    timeout: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub status_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub language: String,
    pub status: JobStatus,
    pub output: String,
    pub error: String,
    pub execution_time_ms: Option<u64>,
    pub exit_code: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for StatusResponse {
    fn from(job: Job) -> Self {
        StatusResponse {
            job_id: job.id,
            language: job.language,
            status: job.status,
            output: job.output,
            error: job.error,
            execution_time_ms: job.execution_time_ms,
            exit_code: job.exit_code,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    queue_depth: Option<u64>,
    version: &'static str,
    last_worker_heartbeat: Option<DateTime<Utc>>,
    jobs_finished: u64,
}

// ---- Handlers ----

async fn execute(
    State(state): State<ApiState>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection),
    };

    match state
        .service
        .submit(&request.language, &request.code, request.timeout)
        .await
    {
        Ok(job) => {
            let body = ExecuteResponse {
                job_id: job.id,
                status: job.status,
                status_url: format!("/status/{}", job.id),
            };
            (StatusCode::ACCEPTED, Json(body)).into_response()
        }
        Err(e) => AppError(e).into_response(),
    }
}

async fn status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    // Malformed ids cannot name a job
    let id = Uuid::parse_str(&job_id).map_err(|_| Error::NotFound(format!("Job {}", job_id)))?;
    let job = state.service.get_status(id).await?;
    // Pollers must see the status change
    Ok((
        [(header::CACHE_CONTROL, "no-cache")],
        Json(StatusResponse::from(job)),
    ))
}

async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let depth = state.service.queue_depth().await;
    let store = state.service.store_healthy().await;
    let (code, status) = match (&depth, &store) {
        (Ok(_), Ok(true)) => (StatusCode::OK, "ok"),
        (Err(e), _) | (_, Err(e)) => {
            error!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "degraded")
        }
        (Ok(_), Ok(false)) => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    let body = HealthResponse {
        status,
        queue_depth: depth.ok(),
        version: crate::VERSION,
        last_worker_heartbeat: state.heartbeat.last_beat(),
        jobs_finished: state.heartbeat.jobs_finished(),
    };
    (code, Json(body))
}

// ---- Router ----

/// Build the API router over a context
pub fn router(context: &AppContext) -> Router {
    let state = ApiState {
        service: Arc::new(SubmissionService::new(context)),
        heartbeat: context.heartbeat.clone(),
    };

    let router = Router::new()
        .route("/execute", post(execute))
        .route("/status/{job_id}", get(status))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new()),
        );

    if context.config.server.cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::JobOutcome;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app() -> (AppContext, Router) {
        let context = AppContext::in_memory(Config::default()).unwrap();
        let app = router(&context);
        (context, app)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_execute(body: serde_json::Value) -> Request<Body> {
        Request::post("/execute")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_path(path: &str) -> Request<Body> {
        Request::get(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_then_status() {
        let (_context, app) = app();

        let (status, body) = send(
            &app,
            post_execute(serde_json::json!({"language": "python", "code": "print('hello')"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "PENDING");
        let job_id = body["job_id"].as_str().unwrap().to_string();
        assert_eq!(body["status_url"], format!("/status/{}", job_id));

        let (status, body) = send(&app, get_path(&format!("/status/{}", job_id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["job_id"], job_id);
        assert_eq!(body["language"], "python");
        assert_eq!(body["status"], "PENDING");
        assert!(body["execution_time_ms"].is_null());
        assert!(body["exit_code"].is_null());
    }

    #[tokio::test]
    async fn test_status_is_not_cacheable() {
        let (context, app) = app();
        let job = Job::new("python", "print(1)", 5);
        context.store.create(&job).await.unwrap();

        let response = app
            .oneshot(get_path(&format!("/status/{}", job.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");
    }

    #[tokio::test]
    async fn test_execute_validation_errors() {
        let (context, app) = app();

        let (status, body) = send(
            &app,
            post_execute(serde_json::json!({"language": "cobol", "code": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "unsupported_language");

        let (status, body) = send(
            &app,
            post_execute(serde_json::json!({"language": "python", "code": "print(1)", "timeout": 31})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_timeout");

        let (status, body) = send(
            &app,
            post_execute(serde_json::json!({"language": "python"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_request");

        assert_eq!(context.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overloaded_is_429() {
        let mut config = Config::default();
        config.queue.overload_threshold = 1;
        let context = AppContext::in_memory(config).unwrap();
        let app = router(&context);

        let request = || post_execute(serde_json::json!({"language": "ruby", "code": "puts 1"}));
        let (status, _) = send(&app, request()).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = send(&app, request()).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["kind"], "overloaded");
    }

    #[tokio::test]
    async fn test_status_not_found() {
        let (_context, app) = app();

        let (status, _) = send(&app, get_path(&format!("/status/{}", Uuid::new_v4()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&app, get_path("/status/not-a-uuid")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_terminal_status_fields() {
        let (context, app) = app();
        let job = Job::new("javascript", "console.log(Math.PI);", 5);
        context.store.create(&job).await.unwrap();
        context.store.mark_running(job.id, "w1").await.unwrap();
        let outcome = JobOutcome {
            status: JobStatus::Success,
            output: "3.141592653589793\n".into(),
            error: String::new(),
            execution_time_ms: 48,
            exit_code: Some(0),
        };
        context.store.complete(job.id, "w1", &outcome).await.unwrap();

        let (status, body) = send(&app, get_path(&format!("/status/{}", job.id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "SUCCESS");
        assert_eq!(body["output"], "3.141592653589793\n");
        assert_eq!(body["execution_time_ms"], 48);
        assert_eq!(body["exit_code"], 0);
        assert!(body["started_at"].is_string());
        assert!(body["completed_at"].is_string());
    }

    #[tokio::test]
    async fn test_health() {
        let (_context, app) = app();
        let (status, body) = send(&app, get_path("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue_depth"], 0);
        assert_eq!(body["version"], crate::VERSION);
    }
}
