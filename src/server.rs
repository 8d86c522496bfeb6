//! HTTP surface: demo page, health check and `/predict`

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::AgreementError;
use crate::pipeline::{AgreementPipeline, AnalysisResponse};

pub const DEFAULT_PORT: u16 = 7860;
pub const DEFAULT_HOST: &str = "0.0.0.0";

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<AgreementPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub sentence: String,
}

/// Error body `{"error": "..."}` with a status picked from the error kind
pub struct ApiError(AgreementError);

impl From<AgreementError> for ApiError {
    fn from(e: AgreementError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::UNPROCESSABLE_ENTITY
        } else {
            warn!("Analysis failed: {}", self.0);
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let model = state.pipeline.model();
    Json(json!({
        "status": "ok",
        "model_id": model.model_id(),
        "n_layers": model.n_layers(),
    }))
}

async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<AnalysisResponse>, ApiError> {
    let response = state.pipeline.analyze(&request.sentence).await?;
    Ok(Json(response))
}

async fn log_request(request: Request<axum::body::Body>, next: Next) -> Result<Response, StatusCode> {
    info!("{} {}", request.method(), request.uri().path());
    Ok(next.run(request).await)
}

pub fn router(pipeline: Arc<AgreementPipeline>) -> Router {
    let state = AppState { pipeline };
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/predict", post(predict))
        .layer(middleware::from_fn(log_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(config: &ServerConfig, pipeline: Arc<AgreementPipeline>) -> anyhow::Result<()> {
    let addr = config.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}
