use crate::model::{DevicesResponse, ListResponse};
use crate::store::PgStore;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::error;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 500;
const DEFAULT_WINDOW_SECS: u64 = 3_600;
const MAX_WINDOW_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
struct AppState {
    store: PgStore,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    window_secs: Option<u64>,
}

pub fn create_router(store: PgStore) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id/readings", get(get_readings))
        .route("/api/v1/devices/:device_id/alerts", get(get_shock_alerts))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_readings(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Response, AppError> {
    let limit = effective_limit(params.limit);
    let data = state.store.latest_readings(&device_id, limit).await?;

    Ok(Json(ListResponse {
        total: data.len(),
        data,
        limit,
    })
    .into_response())
}

async fn get_shock_alerts(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Response, AppError> {
    let limit = effective_limit(params.limit);
    let data = state.store.latest_shock_alerts(&device_id, limit).await?;

    Ok(Json(ListResponse {
        total: data.len(),
        data,
        limit,
    })
    .into_response())
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<WindowQuery>,
) -> Result<Response, AppError> {
    let window_secs = effective_window(params.window_secs);
    let since = Utc::now() - Duration::seconds(window_secs as i64);
    let data = state.store.devices_seen_since(since).await?;

    Ok(Json(DevicesResponse {
        total: data.len(),
        data,
        window_secs,
    })
    .into_response())
}

/// Server-side cap: clients may ask for fewer rows, never more.
fn effective_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
}

fn effective_window(requested: Option<u64>) -> u64 {
    requested.unwrap_or(DEFAULT_WINDOW_SECS).min(MAX_WINDOW_SECS)
}

struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_defaults_and_cap() {
        assert_eq!(effective_limit(None), 100);
        assert_eq!(effective_limit(Some(25)), 25);
        assert_eq!(effective_limit(Some(10_000)), 500);
    }

    #[test]
    fn test_window_defaults_and_cap() {
        assert_eq!(effective_window(None), 3_600);
        assert_eq!(effective_window(Some(600)), 600);
        assert_eq!(effective_window(Some(1_000_000)), 86_400);
    }
}
