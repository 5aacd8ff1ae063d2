use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::{
    extract::{Path, Request, State},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::agents::RequestStream;
use crate::error::{AppError, ErrorResponse, Result};
use crate::models::{GenerateRequest, HealthStatus};
use crate::AppState;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/generate/stream", post(generate_sse_handler))
        .route("/generate/{request_id}", delete(cancel_handler))
        .route("/health", get(health_check))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ============================================================================
// Middleware
// ============================================================================

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Tags each request with `x-request-id`, honouring one sent by the caller.
/// Error bodies produced downstream get the same id.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::now_v7().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Some(error) = response.extensions_mut().remove::<ErrorResponse>() {
        let status = response.status();
        response = (status, Json(error.with_request_id(request_id.clone()))).into_response();
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

// ============================================================================
// NDJSON STREAM HANDLER
// ============================================================================

/// POST /generate
/// Body: {"prompt": "..."}
///
/// Returns: one JSON event per line (`application/x-ndjson`)
pub async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<GenerateRequest>,
) -> Result<Response> {
    let stream = open_stream(&state, request_id, &request.prompt).await?;

    let lines = ReceiverStream::new(stream.events).filter_map(|event| async move {
        match event.to_ndjson() {
            Ok(line) => Some(Ok::<_, Infallible>(Bytes::from(line))),
            Err(e) => {
                log::error!("Failed to serialize stream event: {}", e);
                None
            }
        }
    });

    Ok((
        [(CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn open_stream(state: &AppState, request_id: String, prompt: &str) -> Result<RequestStream> {
    let retriever = state.retriever.get()?;
    log::info!("[{}] query: {:.120}", request_id, prompt);
    state
        .agent
        .handle_request_stream(retriever, request_id, prompt)
        .await
}

// ============================================================================
// SSE STREAM HANDLER
// ============================================================================

/// POST /generate/stream
/// Body: {"prompt": "..."}
///
/// Returns: Server-Sent Events, one `message` per stream event, then `done`
pub async fn generate_sse_handler(
    State(state): State<Arc<AppState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Json(request): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let RequestStream { mut events, .. } = open_stream(&state, request_id, &request.prompt).await?;

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(json_data) => {
                    yield Ok(Event::default().event("message").data(json_data));
                }
                Err(e) => {
                    log::error!("Failed to serialize stream event: {}", e);
                    break;
                }
            }
        }

        yield Ok(Event::default().event("done").data("Stream closed"));
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

// ============================================================================
// CANCEL HANDLER
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub request_id: String,
    pub message: String,
}

/// DELETE /generate/{request_id}
pub async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<CancelResponse>> {
    if !state.agent.cancel_request(&request_id).await {
        return Err(AppError::not_found(format!("Active request {}", request_id)));
    }
    log::info!("[{}] cancelled by caller", request_id);
    Ok(Json(CancelResponse {
        success: true,
        message: format!("Request {} cancelled successfully", request_id),
        request_id,
    }))
}

// ============================================================================
// HEALTH
// ============================================================================

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthStatus>) {
    let health = HealthStatus::from_readiness(state.retriever.is_ready());
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

// ============================================================================
// TESTS
// ============================================================================
