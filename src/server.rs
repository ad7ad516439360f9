//! Read-only HTTP API over the session store.
//!
//! Exposes recorded sessions to local dashboards:
//! - `GET /health`
//! - `GET /sessions?device=&days=`
//! - `GET /sessions/:id` (session, statistics, heart rate zones)
//! - `GET /sessions/:id/aggregates?interval=30`

use crate::core::{hr_zones, Aggregate, ZoneShare};
use crate::storage::{
    SampleRange, SessionFilter, SessionRecord, SessionStats, SessionSummary, SharedStore,
    StorageError,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Default aggregate bucket width for the aggregates endpoint.
const DEFAULT_INTERVAL: u32 = 30;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Query string of `GET /sessions`.
#[derive(Debug, Default, Deserialize)]
pub struct SessionsQuery {
    pub device: Option<String>,
    /// Look-back window in days
    pub days: Option<u32>,
    pub limit: Option<u32>,
}

/// Query string of the aggregates endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct AggregatesQuery {
    pub interval: Option<u32>,
}

/// Response of `GET /sessions/:id`.
#[derive(Serialize)]
pub struct SessionDetail {
    pub session: SessionRecord,
    pub stats: SessionStats,
    pub hr_zones: Vec<ZoneShare>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

fn storage_error(error: StorageError) -> ApiError {
    match error {
        StorageError::NotFound { .. } => api_error(StatusCode::NOT_FOUND, "NOT_FOUND", error),
        other => {
            tracing::error!(error = %other, "query failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORAGE_ERROR", other)
        }
    }
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /sessions
async fn list_sessions(
    State(store): State<SharedStore>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    let started_after = query.days.map(|days| {
        chrono::Utc::now().timestamp() as f64 - f64::from(days) * 86_400.0
    });
    let filter = SessionFilter {
        device_id: query.device,
        started_after,
        limit: query.limit,
    };
    let sessions = store.list_sessions(&filter).await.map_err(storage_error)?;
    Ok(Json(sessions))
}

/// GET /sessions/:id
async fn get_session(
    State(store): State<SharedStore>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let session = store
        .get_session(&session_id)
        .await
        .map_err(storage_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("session `{session_id}` not found"),
            )
        })?;
    let stats = store
        .session_stats(&session_id)
        .await
        .map_err(storage_error)?;
    let samples = store
        .session_samples(&session_id, SampleRange::default())
        .await
        .map_err(storage_error)?;

    Ok(Json(SessionDetail {
        session,
        stats,
        hr_zones: hr_zones(&samples),
    }))
}

/// GET /sessions/:id/aggregates
async fn get_aggregates(
    State(store): State<SharedStore>,
    Path(session_id): Path<String>,
    Query(query): Query<AggregatesQuery>,
) -> Result<Json<Vec<Aggregate>>, ApiError> {
    let interval = query.interval.unwrap_or(DEFAULT_INTERVAL);
    if interval == 0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_INTERVAL",
            "interval must be at least 1 second",
        ));
    }
    if store
        .get_session(&session_id)
        .await
        .map_err(storage_error)?
        .is_none()
    {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("session `{session_id}` not found"),
        ));
    }

    let aggregates = store
        .aggregates(&session_id, interval)
        .await
        .map_err(storage_error)?;
    Ok(Json(aggregates))
}

/// Build the API router over `store`.
pub fn router(store: SharedStore) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/aggregates", get(get_aggregates))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(store)
}

/// Run the HTTP server on localhost. Port 0 picks a free port.
pub async fn run(
    store: SharedStore,
    port: u16,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(store);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("HRM logger API listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
