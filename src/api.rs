//! HTTP surface over the record store and the controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::pipeline::{regenerate_processed, Pipeline, SummarizeUrlError};
use crate::records::SummaryRecord;
use crate::store::{RawReadError, RecordStore};
use crate::summarizer::SummarizeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<RawReadError> for ApiError {
    fn from(err: RawReadError) -> Self {
        match err {
            RawReadError::Missing(_) => ApiError::NotFound("Processed data not found".into()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<SummarizeUrlError> for ApiError {
    fn from(err: SummarizeUrlError) -> Self {
        match err {
            SummarizeUrlError::Store(e) => ApiError::Internal(e.to_string()),
            // No key configured on this side; the upstream is not at fault.
            SummarizeUrlError::Summarize(e @ SummarizeError::Config(_)) => {
                ApiError::Internal(e.to_string())
            }
            other => ApiError::BadGateway(other.to_string()),
        }
    }
}

/// One controller (and so one rate limiter) behind a lock; reads go straight to the store.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Mutex<Pipeline>>,
    pub store: RecordStore,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        let store = pipeline.store().clone();
        AppState { pipeline: Arc::new(Mutex::new(pipeline)), store }
    }
}

#[derive(Debug, Deserialize)]
pub struct SummarizeParams {
    url: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/data", get(data))
        .route("/summarize", get(summarize))
        .route("/process", post(process))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server failed")
}

async fn index() -> Json<Value> {
    Json(json!({ "message": "Publication summarizer API. Try /data or /summarize?url=..." }))
}

async fn data(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.store.read_processed_raw()?))
}

async fn summarize(
    State(state): State<AppState>,
    Query(params): Query<SummarizeParams>,
) -> Result<Json<SummaryRecord>, ApiError> {
    let url = params
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Please provide a URL via ?url=".into()))?;

    let mut pipeline = state.pipeline.lock().await;
    match pipeline.summarize_url(&url).await {
        Ok(record) => Ok(Json(record)),
        Err(e) => {
            error!("Summarize request for {} failed: {}", url, e);
            Err(e.into())
        }
    }
}

async fn process(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    // Holding the controller lock keeps a concurrent summarize from racing the rewrite.
    let _pipeline = state.pipeline.lock().await;
    let processed = regenerate_processed(&state.store).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "processed": processed })))
}
