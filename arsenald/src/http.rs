use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use arsenal_common::{InvocationRequest, InvokeError};
use arsenal_core::{Core, ProgressEvent, SubmitReceipt};
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/invoke", post(invoke))
        .route("/status/:handle", get(status))
        .route("/stream/:handle", get(stream))
        .route("/cancel/:handle", post(cancel))
        .route("/health", get(health))
        .layer(Extension(AppState { core }))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// Caller-facing error envelope: the stable kind token plus a message,
/// mapped onto an HTTP status.
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    fn unknown_handle() -> Self {
        ApiError {
            status: StatusCode::NOT_FOUND,
            kind: "not-found",
            message: "unknown or expired handle".into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: message.into(),
        }
    }
}

impl From<InvokeError> for ApiError {
    fn from(err: InvokeError) -> Self {
        let status = match &err {
            InvokeError::NoSuchTool(_) => StatusCode::NOT_FOUND,
            InvokeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            InvokeError::Forbidden(_) => StatusCode::FORBIDDEN,
            InvokeError::Overloaded(_) => StatusCode::TOO_MANY_REQUESTS,
            InvokeError::Timeout(_) | InvokeError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            InvokeError::Cancelled => StatusCode::CONFLICT,
            InvokeError::SpawnError(_) | InvokeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "kind": self.kind, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

/// Submission can block on admission under block-policy, so it runs on
/// the blocking pool rather than a runtime worker.
async fn invoke(
    Extension(state): Extension<AppState>,
    Json(request): Json<InvocationRequest>,
) -> Result<Json<SubmitReceipt>, ApiError> {
    let core = state.core.clone();
    let receipt = tokio::task::spawn_blocking(move || core.submit(request))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))??;
    Ok(Json(receipt))
}

async fn status(
    Extension(state): Extension<AppState>,
    Path(handle): Path<Uuid>,
) -> Result<Response, ApiError> {
    let view = state.core.status(handle).ok_or_else(ApiError::unknown_handle)?;
    Ok(Json(view).into_response())
}

async fn cancel(
    Extension(state): Extension<AppState>,
    Path(handle): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.core.cancel(handle) {
        return Err(ApiError::unknown_handle());
    }
    Ok(Json(json!({ "handle": handle, "cancelled": true })))
}

async fn stream(
    Extension(state): Extension<AppState>,
    Path(handle): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (replay, receiver) = state
        .core
        .subscribe(handle)
        .ok_or_else(ApiError::unknown_handle)?;

    let ready = tokio_stream::once(Event::default().event("ready").data(handle.to_string()));
    let replay = tokio_stream::iter(replay.into_iter().map(sse_event));
    let live = BroadcastStream::new(receiver).filter_map(move |item| match item {
        Ok(event) => Some(sse_event(event)),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            // a slow consumer never stalls the worker; it gets a drop
            // marker instead of the missed events
            warn!(%handle, skipped, "subscriber lagged, dropping events");
            Some(lag_event(skipped))
        }
    });

    let stream = ready.chain(replay).chain(live).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn health(Extension(state): Extension<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "tools": state.core.tool_names(),
        "cache": state.core.cache_stats(),
        "pool": state.core.pool_stats(),
    }))
}

fn sse_event(event: ProgressEvent) -> Event {
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
    Event::default().event(event.phase.as_str()).data(data)
}

fn lag_event(skipped: u64) -> Event {
    Event::default()
        .event("dropped")
        .data(json!({ "phase": "dropped", "skipped": skipped }).to_string())
}
