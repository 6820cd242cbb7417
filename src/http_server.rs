//! HTTP server implementation using Axum.

use crate::admission::Submission;
use crate::config::Isolation;
use crate::error::Error;
use crate::language::Language;
use crate::output::legacy_output;
use crate::sandbox::{ExecutionResult, ExitStatus};
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Response of `POST /run`. `output` keeps the legacy merged text; the other
/// fields let callers tell timeouts, crashes and runtime errors apart.
#[derive(Debug, Serialize)]
pub struct RunResponse {
    pub output: String,
    pub request_id: String,
    pub status: ExitStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

impl RunResponse {
    fn new(result: ExecutionResult) -> Self {
        Self {
            output: legacy_output(&result),
            stdout: String::from_utf8_lossy(&result.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
            request_id: result.request_id,
            status: result.status,
            exit_code: result.exit_code,
            signal: result.signal,
            truncated: result.truncated,
            duration_ms: result.duration_ms,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    output: String,
    status: &'static str,
}

impl From<&Error> for ErrorResponse {
    fn from(e: &Error) -> Self {
        Self {
            output: format!("Error: {}", e),
            status: e.kind(),
        }
    }
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::Setup(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorResponse::from(&self))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    isolation: Isolation,
    in_flight: usize,
    queued: usize,
    capacity: usize,
    uptime_secs: u64,
}

#[derive(Serialize)]
struct LanguageInfo {
    name: &'static str,
    interpreter: String,
    source_file: &'static str,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let config = state.executor.config();
    let body_limit = config.max_code_bytes + config.max_input_bytes + 64 * 1024;

    Router::new()
        .route("/run", post(run))
        .route("/languages", get(languages))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given address until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let admission = state.executor.admission();
    Json(HealthResponse {
        status: "ok",
        isolation: state.executor.config().isolation,
        in_flight: admission.in_flight(),
        queued: admission.queued(),
        capacity: admission.capacity(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn languages(State(state): State<AppState>) -> Json<Vec<LanguageInfo>> {
    let interpreters = &state.executor.config().interpreters;
    Json(
        Language::ALL
            .iter()
            .map(|lang| LanguageInfo {
                name: lang.name(),
                interpreter: lang.interpreter(interpreters).to_string(),
                source_file: lang.source_file(),
            })
            .collect(),
    )
}

async fn run(
    State(state): State<AppState>,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Response {
    match execute(&state, payload).await {
        Ok(response) => Json(response).into_response(),
        // Older clients expect every failure as a 200 with the text in `output`.
        Err(e) if state.executor.config().legacy_errors => {
            (StatusCode::OK, Json(ErrorResponse::from(&e))).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn execute(
    state: &AppState,
    payload: Result<Json<Submission>, JsonRejection>,
) -> Result<RunResponse, Error> {
    let Json(submission) = payload.map_err(|e| Error::InvalidInput(e.body_text()))?;
    let result = state.executor.submit(submission).await?;
    info!(request_id = %result.request_id, status = ?result.status,
          exit_code = ?result.exit_code, "POST /run");
    Ok(RunResponse::new(result))
}
