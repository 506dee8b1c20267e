//! HTTP routes for the execution kernel.

use std::{convert::Infallible, sync::Arc};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use pathview_core::{ExecutionResult, StepFrame};
use pathview_session::{FrameSink, ManagerError, SessionManager, TransportClosed};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::protocol::{
    EvaluateRequest, ExecuteCodeRequest, ExecutionResponse, HealthResponse, SessionResponse,
    StreamRequest, TracebackResponse, budget,
};

/// Request header carrying the session token.
pub const SESSION_HEADER: &str = "x-session-token";

/// Content type of step stream bodies.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Origins allowed outside production.
const DEV_ORIGINS: [&str; 2] = ["http://localhost:5173", "http://localhost:3000"];

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

impl AppState {
    #[must_use]
    pub const fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

/// Handler error.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Session not found")]
    MissingToken,
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::MissingToken | Self::Manager(ManagerError::SessionNotFound) => {
                StatusCode::NOT_FOUND
            }
            Self::Manager(e) => {
                tracing::error!(error = %e, "Server error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "success": false, "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Routes without middleware.
pub fn router(state: AppState) -> Router {
    let router = Router::new()
        .route("/initialize", get(initialize))
        .route("/idCheck", get(id_check))
        .route("/execute-code", post(execute_code))
        .route("/evaluate-expression", post(evaluate_expression))
        .route("/streamData", get(stream_default).post(stream_data))
        .route("/traceback", get(traceback))
        .route("/health", get(health));

    #[cfg(feature = "websocket")]
    let router = router.route("/ws", get(crate::websocket::ws_handler));

    router.with_state(state)
}

/// Routes with request tracing and the CORS policy applied.
pub fn app(state: AppState, production: bool) -> Router {
    router(state)
        .layer(cors_layer(production))
        .layer(TraceLayer::new_for_http())
}

/// Permissive in production, local dev origins with credentials otherwise.
#[must_use]
pub fn cors_layer(production: bool) -> CorsLayer {
    if production {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(DEV_ORIGINS.map(HeaderValue::from_static))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static(SESSION_HEADER)])
        .allow_credentials(true)
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn require_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    session_token(headers).ok_or(ApiError::MissingToken)
}

fn execution_response(result: ExecutionResult) -> Response {
    let status = if result.success() {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(ExecutionResponse::from(result))).into_response()
}

async fn initialize(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.manager.initialize(session_token(&headers)).await?;
    Ok(Json(SessionResponse {
        success: true,
        id: Some(session.token()),
    }))
}

async fn id_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = match session_token(&headers) {
        None => None,
        Some(token) => match state.manager.check(token).await {
            Ok(session) => Some(session.token()),
            Err(ManagerError::SessionNotFound) => None,
            Err(e) => return Err(e.into()),
        },
    };
    Ok(Json(SessionResponse { success: true, id }))
}

async fn execute_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ExecuteCodeRequest>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers)?;
    let result = state
        .manager
        .run_statements(token, body.code, budget(body.timeout_ms))
        .await?;
    Ok(execution_response(result))
}

async fn evaluate_expression(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EvaluateRequest>,
) -> Result<Response, ApiError> {
    let token = require_token(&headers)?;
    let result = state
        .manager
        .evaluate_expression(token, body.expr, budget(body.timeout_ms))
        .await?;
    Ok(execution_response(result))
}

async fn traceback(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<TracebackResponse>, ApiError> {
    let token = require_token(&headers)?;
    let failure = state.manager.last_failure(token).await?;
    Ok(Json(TracebackResponse {
        success: true,
        traceback: failure.map(|f| f.message),
    }))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let sessions = state.manager.session_count().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        sessions,
    }))
}

async fn stream_default(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    open_stream(state, &headers, StreamRequest::default()).await
}

async fn stream_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StreamRequest>,
) -> Result<Response, ApiError> {
    open_stream(state, &headers, body).await
}

async fn open_stream(
    state: AppState,
    headers: &HeaderMap,
    request: StreamRequest,
) -> Result<Response, ApiError> {
    let token = require_token(headers)?;
    // unknown sessions get a status code, not an empty stream
    state.manager.check(token).await?;

    let (tx, rx) = mpsc::channel(1);
    let manager = Arc::clone(&state.manager);
    let token = token.to_owned();
    tokio::spawn(async move {
        let mut sink = NdjsonSink { tx };
        let result = manager
            .open_step_stream(
                &token,
                request.expr.as_deref(),
                budget(request.timeout_ms),
                &mut sink,
                CancellationToken::new(),
            )
            .await;
        if let Err(e) = result {
            if e.is_server_error() {
                tracing::error!(error = %e, "Step stream failed");
            } else {
                tracing::debug!(error = %e, "Step stream rejected");
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(ndjson_body(rx)),
    )
        .into_response())
}

/// A serialized frame and the signal that it was taken by the body.
type Chunk = (Bytes, oneshot::Sender<()>);

/// Feeds frames into a streaming response body.
///
/// A frame counts as delivered once the body is polled for the next chunk.
struct NdjsonSink {
    tx: mpsc::Sender<Chunk>,
}

#[async_trait]
impl FrameSink for NdjsonSink {
    async fn deliver(&mut self, frame: &StepFrame) -> Result<(), TransportClosed> {
        let line = frame.to_ndjson().map_err(|e| {
            tracing::error!(error = %e, "Failed to serialize frame");
            TransportClosed
        })?;
        let (ack, taken) = oneshot::channel();
        self.tx
            .send((Bytes::from(line), ack))
            .await
            .map_err(|_| TransportClosed)?;
        taken.await.map_err(|_| TransportClosed)
    }

    async fn closed(&self) {
        self.tx.closed().await;
    }
}

fn ndjson_body(
    rx: mpsc::Receiver<Chunk>,
) -> impl futures::Stream<Item = Result<Bytes, Infallible>> + Send {
    futures::stream::unfold((rx, None::<oneshot::Sender<()>>), |(mut rx, pending)| async move {
        if let Some(ack) = pending {
            let _ = ack.send(());
        }
        let (line, ack) = rx.recv().await?;
        Some((Ok(line), (rx, Some(ack))))
    })
}
