use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

/// Shared server state. `hits` counts tile bodies actually served, so tests
/// can tell cache hits from network round-trips.
#[derive(Clone, Debug, Default)]
pub struct AppState {
    hits: Arc<AtomicUsize>,
}

impl AppState {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Stats {
    pub hits: usize,
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/tiles/{z}/{x}/{y}", get(tile))
        .route("/revalidate/{z}/{x}/{y}", get(revalidating_tile))
        .route("/slow/{millis}/tile/{id}", get(slow_tile))
        .route("/headers", get(echo_headers))
        .route("/status/{code}", get(status))
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

/// Deterministic tile payload for `z/x/y`.
pub fn tile_body(z: u32, x: u32, y: u32) -> Vec<u8> {
    format!("tile {z}/{x}/{y}").into_bytes()
}

fn tile_etag(z: u32, x: u32, y: u32) -> String {
    format!("\"{z}-{x}-{y}\"")
}

fn etag_matches(headers: &HeaderMap, etag: &str) -> bool {
    headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|candidate| candidate.trim() == etag))
}

fn tile_response(state: &AppState, headers: &HeaderMap, (z, x, y): (u32, u32, u32), cache_control: &'static str) -> Response {
    let etag = tile_etag(z, x, y);
    if etag_matches(headers, &etag) {
        return (
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::CACHE_CONTROL, cache_control.to_string())],
        )
            .into_response();
    }
    state.hits.fetch_add(1, Ordering::SeqCst);
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/x-protobuf".to_string()),
            (header::CACHE_CONTROL, cache_control.to_string()),
            (header::ETAG, etag),
        ],
        tile_body(z, x, y),
    )
        .into_response()
}

async fn tile(
    State(state): State<AppState>,
    Path(coords): Path<(u32, u32, u32)>,
    headers: HeaderMap,
) -> Response {
    tile_response(&state, &headers, coords, "max-age=60")
}

async fn revalidating_tile(
    State(state): State<AppState>,
    Path(coords): Path<(u32, u32, u32)>,
    headers: HeaderMap,
) -> Response {
    tile_response(&state, &headers, coords, "no-cache")
}

async fn slow_tile(Path((millis, id)): Path<(u64, u32)>) -> Response {
    tokio::time::sleep(Duration::from_millis(millis)).await;
    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        format!("slow tile {id}"),
    )
        .into_response()
}

async fn echo_headers(headers: HeaderMap) -> Response {
    let echoed: BTreeMap<String, String> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(echoed),
    )
        .into_response()
}

async fn status(Path(code): Path<u16>) -> Result<StatusCode, StatusCode> {
    StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)
}

async fn stats(State(state): State<AppState>) -> Response {
    (
        [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
        Json(Stats { hits: state.hits() }),
    )
        .into_response()
}
