//! REST surface.
//!
//! `/health` is open; `/rooms` and `/hosts` need a valid token (or a
//! loopback caller); `/qr` mints a pairing token and returns the bundle,
//! `/qr/image` renders it as a PNG.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use stream_pairing::{PairingBundle, DEFAULT_TOKEN_TTL};

use crate::ws::presented_token;
use crate::AppState;

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Token gate for the inspection endpoints.
fn authorize(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    params: &std::collections::HashMap<String, String>,
) -> Result<(), StatusCode> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    let token = presented_token(headers, params).ok_or(StatusCode::UNAUTHORIZED)?;
    if state.tokens.validate(&token).is_valid() {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

pub async fn rooms(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if let Err(status) = authorize(&state, addr, &headers, &params) {
        return status.into_response();
    }
    Json(state.rooms.room_summaries().await).into_response()
}

pub async fn hosts(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> Response {
    if let Err(status) = authorize(&state, addr, &headers, &params) {
        return status.into_response();
    }
    Json(state.rooms.host_summaries().await).into_response()
}

/// Build a pairing bundle with a freshly minted short-lived token.
pub async fn make_bundle(state: &AppState) -> PairingBundle {
    let token = state.tokens.mint(DEFAULT_TOKEN_TTL, true, None);
    PairingBundle {
        host: state.public_host.clone(),
        port: state.config.port,
        tls: state.config.tls_enabled(),
        token,
        fingerprint: state.cert_fingerprint.clone(),
    }
}

pub async fn qr(State(state): State<Arc<AppState>>) -> Json<PairingBundle> {
    Json(make_bundle(&state).await)
}

pub async fn qr_image(State(state): State<Arc<AppState>>) -> Response {
    let bundle = make_bundle(&state).await;
    match stream_pairing::qr::bundle_to_png(&bundle, 512) {
        Ok(png) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Err(e) => {
            tracing::warn!("QR rendering failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
