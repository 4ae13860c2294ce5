//! HTTP API
//!
//! ```text
//! POST /api/analyze          - Analyze a URL, returns the full report
//! POST /api/test-url         - DNS and certificate check, no page load
//! GET  /api/health           - Liveness plus shared browser health
//! GET  /api/browser-status   - Browser manager snapshot plus the last health sweep
//! POST /api/restart-browser  - Force a browser recycle
//! GET  /metrics              - Prometheus metrics (when the recorder is installed)
//! ```
//!
//! This is the only layer that turns [`AnalyzerError`]s into responses.

use crate::{
    Analyzer, AnalyzerError, BrowserManager, BrowserStatus, ErrorSeverity, HealthMonitor,
    HealthSnapshot, NavigationErrorKind,
};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub analyzer: Arc<Analyzer>,
    pub manager: Arc<BrowserManager>,
    pub health: Option<Arc<HealthMonitor>>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub request_deadline: Option<Duration>,
}

#[derive(Debug, Deserialize)]
pub struct UrlRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserStatusResponse {
    #[serde(flatten)]
    pub status: BrowserStatus,
    pub last_health_check: Option<HealthSnapshot>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn deadline_exceeded(after: Duration) -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            body: ErrorBody {
                error: "Analysis timed out".to_string(),
                details: format!("The analysis did not finish within {after:?}"),
                suggestions: vec!["Try again later; the site may be slow".to_string()],
            },
        }
    }

    fn bad_request(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: "Invalid request".to_string(),
                details: details.into(),
                suggestions: AnalyzerError::MissingUrl.suggestions(),
            },
        }
    }
}

impl From<AnalyzerError> for ApiError {
    fn from(err: AnalyzerError) -> Self {
        let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let suggestions = err.suggestions();

        match err.severity() {
            ErrorSeverity::High => error!("Request failed: {}", err),
            ErrorSeverity::Medium => warn!("Request failed: {}", err),
            ErrorSeverity::Low => debug!("Rejected request: {}", err),
        }

        let (title, details) = match &err {
            AnalyzerError::MissingUrl | AnalyzerError::InvalidUrl { .. } => {
                ("Invalid request".to_string(), err.to_string())
            }
            AnalyzerError::Navigation { kind, detail, .. } => (
                navigation_title(*kind).to_string(),
                format!("{} ({})", kind.explanation(), detail),
            ),
            AnalyzerError::BrowserUnavailable(_) | AnalyzerError::BrowserLaunchFailed { .. } => {
                ("Browser unavailable".to_string(), err.to_string())
            }
            AnalyzerError::Timeout { .. } => ("Analysis timed out".to_string(), err.to_string()),
            AnalyzerError::ShuttingDown => ("Service unavailable".to_string(), err.to_string()),
            AnalyzerError::IoError(_) | AnalyzerError::SerializationError(_) => (
                "Internal server error".to_string(),
                "An unexpected error occurred".to_string(),
            ),
            _ => ("Analysis failed".to_string(), err.to_string()),
        };

        Self {
            status,
            body: ErrorBody {
                error: title,
                details,
                suggestions,
            },
        }
    }
}

fn navigation_title(kind: NavigationErrorKind) -> &'static str {
    match kind {
        NavigationErrorKind::DnsResolution => "Domain not found",
        NavigationErrorKind::ConnectionRefused => "Connection refused",
        NavigationErrorKind::Certificate => "Certificate error",
        NavigationErrorKind::ConnectionClosed => "Connection closed",
        NavigationErrorKind::TargetClosed => "Page closed unexpectedly",
        NavigationErrorKind::Timeout => "Page load timed out",
        NavigationErrorKind::Other => "Failed to load page",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn requested_url(body: Result<Json<UrlRequest>, JsonRejection>) -> Result<String, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    match request.url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(AnalyzerError::MissingUrl.into()),
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/analyze", post(analyze))
        .route("/api/test-url", post(test_url))
        .route("/api/health", get(health))
        .route("/api/browser-status", get(browser_status))
        .route("/api/restart-browser", post(restart_browser))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let url = requested_url(body)?;
    let analysis = state.analyzer.analyze(&url);

    let report = match state.request_deadline {
        Some(deadline) => match tokio::time::timeout(deadline, analysis).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("Analysis of {} exceeded the request deadline of {:?}", url, deadline);
                return Err(ApiError::deadline_exceeded(deadline));
            }
        },
        None => analysis.await?,
    };

    Ok(Json(report).into_response())
}

async fn test_url(
    State(state): State<AppState>,
    body: Result<Json<UrlRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let url = requested_url(body)?;
    let check = state.analyzer.check_url(&url).await?;
    Ok(Json(check).into_response())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "browserHealthy": state.manager.is_healthy(),
    }))
}

async fn browser_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(BrowserStatusResponse {
        status: state.manager.status(),
        last_health_check: state.health.as_ref().and_then(|m| m.last_snapshot()),
    })
}

async fn restart_browser(State(state): State<AppState>) -> Result<Response, ApiError> {
    state.manager.restart().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Browser restarted",
        "status": state.manager.status(),
    }))
    .into_response())
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<(), AnalyzerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!("Page audit API listening on http://{}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("HTTP server stopped");
    Ok(())
}
