//! HTTP transport for the query service.
//!
//! One framing of [`QueryService`]; the service API itself is
//! transport-free. Routes:
//!
//! - `GET /stores` — store names served by this instance
//! - `GET /store/{name}/key/{key}` — point query; 307 with a `Location`
//!   header when the key is owned by another instance
//! - `GET /store/{name}/range?from=&to=` — local range query
//!
//! Values are opaque bytes; responses carry both a base64 rendering and a
//! UTF-8 one when the bytes happen to be valid UTF-8.

use std::future::Future;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{PointOutcome, QueryError, QueryService};

/// Opaque bytes rendered for JSON transport.
#[derive(Debug, Serialize)]
pub struct EncodedBytes {
    /// UTF-8 rendering, when the bytes are valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utf8: Option<String>,
    /// Base64 rendering of the raw bytes.
    pub base64: String,
}

impl EncodedBytes {
    fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            utf8: std::str::from_utf8(bytes).ok().map(str::to_string),
            base64: BASE64.encode(bytes),
        }
    }
}

#[derive(Debug, Serialize)]
struct StoresResponse {
    instance: String,
    stores: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PointResponse {
    store: String,
    key: String,
    value: EncodedBytes,
}

#[derive(Debug, Serialize)]
struct RangeEntry {
    key: EncodedBytes,
    value: EncodedBytes,
}

#[derive(Debug, Serialize)]
struct RangeResponse {
    store: String,
    count: usize,
    entries: Vec<RangeEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct WrongInstanceResponse {
    error: &'static str,
    owner: String,
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    from: String,
    to: String,
}

/// Builds the query router over a service.
#[must_use]
pub fn router(service: QueryService) -> Router {
    Router::new()
        .route("/stores", get(handle_stores))
        .route("/store/{name}/key/{key}", get(handle_point))
        .route("/store/{name}/range", get(handle_range))
        .with_state(service)
}

/// Binds `addr` and serves the query API until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the bind or the serve loop fails.
pub async fn serve(
    addr: &str,
    service: QueryService,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "query service listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

// --- GET /stores ---

async fn handle_stores(State(service): State<QueryService>) -> impl IntoResponse {
    Json(StoresResponse {
        instance: service.local_addr().to_string(),
        stores: service.store_names(),
    })
}

// --- GET /store/{name}/key/{key} ---

async fn handle_point(
    State(service): State<QueryService>,
    Path((name, key)): Path<(String, String)>,
) -> axum::response::Response {
    match service.point_query(&name, key.as_bytes()) {
        Ok(PointOutcome::Value(value)) => Json(PointResponse {
            store: name,
            key,
            value: EncodedBytes::from_bytes(&value),
        })
        .into_response(),
        Ok(PointOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("key '{key}' not found in store '{name}'"),
            }),
        )
            .into_response(),
        Ok(PointOutcome::WrongInstance(owner)) => {
            let location = format!("http://{owner}/store/{name}/key/{key}");
            (
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, location)],
                Json(WrongInstanceResponse {
                    error: "wrong instance",
                    owner: owner.to_string(),
                }),
            )
                .into_response()
        }
        Err(error) => error_response(&error),
    }
}

// --- GET /store/{name}/range?from=&to= ---

async fn handle_range(
    State(service): State<QueryService>,
    Path(name): Path<String>,
    Query(params): Query<RangeParams>,
) -> axum::response::Response {
    match service.range_query(&name, params.from.as_bytes(), params.to.as_bytes()) {
        Ok(entries) => {
            let entries: Vec<RangeEntry> = entries
                .iter()
                .map(|(key, value)| RangeEntry {
                    key: EncodedBytes::from_bytes(key),
                    value: EncodedBytes::from_bytes(value),
                })
                .collect();
            Json(RangeResponse {
                store: name,
                count: entries.len(),
                entries,
            })
            .into_response()
        }
        Err(error) => error_response(&error),
    }
}

fn error_response(error: &QueryError) -> axum::response::Response {
    let status = match error {
        QueryError::UnknownStore(_) => StatusCode::NOT_FOUND,
        QueryError::StoreNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}
