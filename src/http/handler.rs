//! Axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET /`          - home page with the site-wide upload counter
//! - `GET /c/{key}`   - snippet view
//! - `GET /t/{key}`   - tunnel consumer (streams the live SSH session)
//! - `GET /tunnels`   - JSON tunnel count
//! - `GET /static/*`  - static assets
//!
//! Only GET is accepted; every other method gets a 405.

use std::io;
use std::sync::Arc;

use askama::Template;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::store::{StoreError, CODE_UPLOADED_COUNT_KEY};
use crate::tunnel::{TunnelData, TunnelError};
use crate::views::{render_code_page, IndexPage};
use crate::AppState;

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_home).fallback(handle_method_not_allowed))
        .route(
            "/c/{key}",
            get(handle_code).fallback(handle_method_not_allowed),
        )
        .route(
            "/t/{key}",
            get(handle_tunnel).fallback(handle_method_not_allowed),
        )
        .route(
            "/tunnels",
            get(handle_tunnel_count).fallback(handle_method_not_allowed),
        )
        .nest_service("/static", tower_http::services::ServeDir::new("static"))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /`
async fn handle_home(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let count = match state.store.get(CODE_UPLOADED_COUNT_KEY).await {
        Ok(raw) => String::from_utf8_lossy(&raw).into_owned(),
        Err(StoreError::KeyNotFound) => "0".to_string(),
        Err(err) => return Err(AppError::Internal(err.into())),
    };

    let page = IndexPage { count };
    let html = page.render().map_err(|e| AppError::Internal(e.into()))?;
    Ok(Html(html).into_response())
}

/// `GET /c/{key}`
///
/// Snippets are opaque byte strings; the page is spliced together at the
/// byte level so non-UTF-8 content is served back exactly as stored.
async fn handle_code(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let code = match state.store.get(&key).await {
        Ok(raw) => raw,
        Err(StoreError::KeyNotFound) => {
            info!(%key, "snippet not found");
            return Ok((StatusCode::NOT_FOUND, "404 - Not Found").into_response());
        }
        Err(err) => return Err(AppError::Internal(err.into())),
    };
    debug!(%key, "fetched snippet from store");

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        render_code_page(&code),
    )
        .into_response())
}

/// `GET /t/{key}`
///
/// Streams the live tunnel into the response body. Link-preview crawlers
/// are refused so an unfurl cannot drain the tunnel before a human opens
/// the link. The relay task holds the tunnel's done guard, so the blocked
/// SSH producer is released on every exit path, including a consumer that
/// disconnects mid-stream.
async fn handle_tunnel(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if state.crawler.is_chat_crawler(user_agent) {
        return (StatusCode::FORBIDDEN, "403 - Forbidden").into_response();
    }

    let Some(tunnel) = state.tunnels.get(&key) else {
        info!(%key, "tunnel not found");
        return (StatusCode::NOT_FOUND, "404 - Not Found").into_response();
    };
    debug!(%key, "fetched tunnel from registry");

    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(8);
    tokio::spawn(relay_tunnel(tunnel, key, tx));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

#[derive(Serialize)]
struct TunnelCount {
    #[serde(rename = "tunnelCount")]
    tunnel_count: usize,
}

/// `GET /tunnels`
///
/// Public observability surface; reports only the count, never the keys.
async fn handle_tunnel_count(State(state): State<Arc<AppState>>) -> Json<TunnelCount> {
    Json(TunnelCount {
        tunnel_count: state.tunnels.tunnel_count(),
    })
}

async fn handle_method_not_allowed() -> Response {
    (StatusCode::METHOD_NOT_ALLOWED, "405 - Method Not Allowed").into_response()
}

// ---------------------------------------------------------------------------
// Tunnel relay
// ---------------------------------------------------------------------------

/// Copy the tunnel into the response channel until EOF, the stream bound,
/// or consumer disconnect. Dropping the guard fires `done`.
async fn relay_tunnel(
    tunnel: Arc<TunnelData>,
    key: String,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let _done = tunnel.done_guard();
    let mut copied = 0u64;

    loop {
        match tunnel.recv().await {
            Ok(Some(chunk)) => {
                copied += chunk.len() as u64;
                if tx.send(Ok(chunk)).await.is_err() {
                    debug!(%key, "tunnel consumer went away");
                    break;
                }
            }
            Ok(None) => break,
            Err(TunnelError::StreamSizeExceeded) => {
                // The bytes already sent cannot be unsent; the response is
                // simply cut short at the bound.
                warn!(%key, "stream size exceeded");
                break;
            }
        }
    }

    debug!(%key, bytes = copied, "copied tunnel into http response");
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error that maps onto an HTTP response.
#[derive(Debug)]
pub enum AppError {
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "500 - Something bad happened!",
                )
                    .into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
