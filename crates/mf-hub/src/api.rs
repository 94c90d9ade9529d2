//! # API Handlers

use crate::AppState;
use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use mf_core::{query_data, CancellationToken, QueryDataRequest, QueryDataResponse};
use serde::Serialize;
use std::sync::Arc;
use tracing::Instrument;

// =============================================================================
// Query
// =============================================================================

/// Run a query request. Per-query failures are reported inside the
/// response; only an unreadable envelope fails the request.
pub async fn query(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<QueryDataResponse>, (StatusCode, String)> {
    let request: QueryDataRequest = serde_json::from_slice(&body)
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid query request: {}", e)))?;

    let request_id = uuid::Uuid::new_v4().as_simple().to_string();
    let span = tracing::info_span!(
        "query_data",
        request_id = %request_id,
        queries = request.queries.len()
    );

    // Dropping the handler future (client gone) cancels in-flight queries.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let response = query_data(
        Arc::clone(&state.connector),
        request,
        &state.options,
        &cancel,
    )
    .instrument(span)
    .await;
    guard.disarm();

    Ok(Json(response))
}

// =============================================================================
// Health
// =============================================================================

#[derive(Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connector: &'static str,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.start_time.elapsed().as_secs(),
        connector: state.connector_name,
    })
}
