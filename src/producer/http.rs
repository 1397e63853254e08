// Task submission HTTP routes

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use super::IngestionProducer;
use crate::metrics::export_metrics;
use crate::task::TaskRequest;

/// App state for the task routes
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<IngestionProducer>,
}

impl AppState {
    pub fn new(producer: Arc<IngestionProducer>) -> Self {
        Self { producer }
    }
}

/// Create the supplier routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(whoami))
        .route("/task", post(create_task))
        .route("/task/:id", get(get_task))
        .route("/metrics", get(metrics))
        .layer(middleware::from_fn(request_span))
        .with_state(state)
}

/// Serves `router(state)` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
}

async fn request_span(request: Request, next: Next) -> Response {
    let span = tracing::info_span!(
        "request",
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let response = next.run(request).await;
        info!(status = response.status().as_u16(), "Handled request");
        response
    }
    .instrument(span)
    .await
}

/// Client address, preferring proxy headers over the socket peer.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    header_value("true-client-ip")
        .or_else(|| header_value("x-real-ip"))
        .or_else(|| {
            header_value("x-forwarded-for")
                .and_then(|v| v.split(',').next().map(|first| first.trim().to_string()))
        })
        .or_else(|| peer.map(|addr| addr.to_string()))
        .unwrap_or_default()
}

/// GET / - Report the caller's address
async fn whoami(
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Json<serde_json::Value> {
    let your_ip = client_ip(&headers, peer.map(|ConnectInfo(addr)| addr));
    Json(json!({ "your_ip": your_ip }))
}

/// GET /task/{id} - Fetch a task record
async fn get_task(State(state): State<AppState>, Path(raw_id): Path<String>) -> Response {
    let id = match Uuid::parse_str(&raw_id) {
        Ok(id) => id,
        Err(e) => {
            warn!(id = %raw_id, error = %e, "client provided invalid id");
            return (StatusCode::BAD_REQUEST, "ID must be a UUID").into_response();
        }
    };

    match state.producer.get(id).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => {
            warn!(task_id = %id, "document was not found");
            (StatusCode::NOT_FOUND, "document was not found").into_response()
        }
        Err(e) => {
            error!(task_id = %id, error = %e, "could not get document from data store");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not get document from data store",
            )
                .into_response()
        }
    }
}

/// POST /task - Submit a new task. The body is optional.
async fn create_task(State(state): State<AppState>, body: Bytes) -> Response {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TaskRequest::default()
    } else {
        match serde_json::from_slice::<TaskRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "client provided malformed task request");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("invalid task request: {}", e) })),
                )
                    .into_response();
            }
        }
    };

    match state.producer.submit(request).await {
        Ok(record) => {
            info!(task_id = %record.id, "responding to client for task");
            Json(json!({ "task_id": record.id })).into_response()
        }
        Err(e) if e.is_dependency_failure() => (
            StatusCode::FAILED_DEPENDENCY,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "could not serialize task");
            (StatusCode::INTERNAL_SERVER_ERROR, "500").into_response()
        }
    }
}

/// GET /metrics - Prometheus text exposition
async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        export_metrics(),
    )
}
