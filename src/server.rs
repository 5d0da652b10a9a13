//! Read-only HTTP view of a running scan.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use log::{info, warn};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::report::Report;
use crate::status::StatusHandle;

#[derive(Clone)]
pub struct AppState {
    status: StatusHandle,
    results_path: Arc<PathBuf>,
}

impl AppState {
    pub fn new(status: StatusHandle, results_path: PathBuf) -> Self {
        Self { status, results_path: Arc::new(results_path) }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/report", get(get_report))
        .with_state(state);

    Router::new().nest("/api", api).layer(SetResponseHeaderLayer::overriding(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store"),
    ))
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind status server on {bind}"))?;
    info!("status endpoint on http://{bind}/api/status");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(app.status.snapshot()))
}

async fn get_report(State(app): State<AppState>) -> impl IntoResponse {
    let path = app.results_path.clone();
    let loaded = tokio::task::spawn_blocking(move || Report::load(path.as_path())).await;
    match loaded {
        Ok(Ok(Some(report))) => (StatusCode::OK, Json(report)).into_response(),
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(e)) => {
            warn!("report endpoint: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
