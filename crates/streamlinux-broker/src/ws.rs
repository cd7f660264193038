//! WebSocket signaling endpoint.
//!
//! One persistent socket per peer. The upgrade path enforces the
//! connection-attempt rate limit and origin policy; authentication is
//! settled on the first `register` message, where the peer's role
//! determines what its token must prove. Loopback peers (the USB-forward
//! path) skip token validation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use stream_transport::signal::{PeerRole, SignalMessage};

use crate::config::origin_allowed;
use crate::rooms::PeerHandle;
use crate::AppState;

/// Per-message size cap.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Socket read deadline: a peer silent for this long is gone.
const READ_DEADLINE: Duration = Duration::from_secs(60);

/// Socket write deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Heartbeat interval.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Extract a presented token: `Authorization: Bearer …` wins, then the
/// `?token=` query parameter.
pub fn presented_token(
    headers: &HeaderMap,
    params: &std::collections::HashMap<String, String>,
) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_owned());
            }
        }
    }
    params.get("token").cloned()
}

/// `GET /ws` (and `/ws/signaling`) upgrade handler.
pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.limiter.allow(addr.ip()) {
        tracing::warn!(%addr, "Connection attempt rate limit exceeded");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if !origin_allowed(origin.as_deref(), &state.config.allowed_origins) {
        tracing::warn!(%addr, ?origin, "Origin rejected");
        return StatusCode::FORBIDDEN.into_response();
    }

    let token = presented_token(&headers, &params);
    let loopback = addr.ip().is_loopback();

    ws.on_upgrade(move |socket| async move {
        if let Err(reason) = handle_socket(state, socket, addr, token, loopback).await {
            tracing::info!(%addr, %reason, "Signaling connection closed");
        }
    })
}

/// Outcome of the per-message auth check at registration time.
fn authorize_register(
    state: &AppState,
    role: PeerRole,
    token: Option<&str>,
    loopback: bool,
) -> Result<(), &'static str> {
    if loopback {
        return Ok(());
    }
    let Some(token) = token else {
        return Err("token required");
    };
    if token.is_empty() {
        return Err("empty token");
    }

    match role {
        PeerRole::Host => {
            // First host connection registers its token; reconnects in
            // the same room reuse it.
            if !state.tokens.register(token, state.config.token_ttl) {
                return Err("malformed token");
            }
            Ok(())
        }
        PeerRole::Viewer => {
            if state.tokens.validate(token).is_valid() {
                Ok(())
            } else {
                Err("invalid or expired token")
            }
        }
    }
}

async fn send_json(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &SignalMessage,
) -> Result<(), &'static str> {
    let text = serde_json::to_string(message).map_err(|_| "serialize failed")?;
    tokio::time::timeout(WRITE_DEADLINE, sink.send(Message::Text(text)))
        .await
        .map_err(|_| "write deadline exceeded")?
        .map_err(|_| "write failed")
}

/// Drive one signaling connection to completion.
async fn handle_socket(
    state: Arc<AppState>,
    socket: WebSocket,
    addr: SocketAddr,
    token: Option<String>,
    loopback: bool,
) -> Result<(), String> {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut outbound) = mpsc::unbounded_channel::<SignalMessage>();

    // The registered identity of this socket, once `register` succeeds.
    let mut session: Option<(String, PeerHandle)> = None;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await;

    let result: Result<(), String> = loop {
        tokio::select! {
            // Queued messages from the room (and our own replies).
            queued = outbound.recv() => {
                let Some(message) = queued else {
                    break Err("outbound queue closed".into());
                };
                if let Err(e) = send_json(&mut sink, &message).await {
                    break Err(e.into());
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = send_json(&mut sink, &SignalMessage::Ping).await {
                    break Err(e.into());
                }
            }

            inbound = tokio::time::timeout(READ_DEADLINE, stream.next()) => {
                let frame = match inbound {
                    Err(_) => break Err("read deadline exceeded".into()),
                    Ok(None) => break Ok(()),
                    Ok(Some(Err(e))) => break Err(e.to_string()),
                    Ok(Some(Ok(frame))) => frame,
                };

                let text = match frame {
                    Message::Text(text) => text,
                    Message::Close(_) => break Ok(()),
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => continue,
                };

                if text.len() > MAX_MESSAGE_BYTES {
                    break Err("message exceeds 64 KiB cap".into());
                }

                let message: SignalMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!(%addr, "Malformed signaling message: {e}");
                        let _ = tx.send(SignalMessage::Error {
                            message: "malformed message".into(),
                        });
                        continue;
                    }
                };

                match handle_message(
                    &state, &tx, &mut session, message, token.as_deref(), loopback, addr,
                ).await {
                    Ok(()) => {}
                    Err(close_reason) => break Err(close_reason),
                }
            }
        }
    };

    // Tear down room membership.
    if let Some((room, peer)) = session {
        state.rooms.remove(&room, &peer.id).await;
    }

    result
}

/// Process one inbound signaling message.
///
/// Returns `Err` with a close reason for violations that end the
/// connection (failed auth, protocol misuse before registration).
async fn handle_message(
    state: &Arc<AppState>,
    tx: &mpsc::UnboundedSender<SignalMessage>,
    session: &mut Option<(String, PeerHandle)>,
    message: SignalMessage,
    token: Option<&str>,
    loopback: bool,
    addr: SocketAddr,
) -> Result<(), String> {
    match message {
        SignalMessage::Register { room, role, name } => {
            if session.is_some() {
                let _ = tx.send(SignalMessage::Error {
                    message: "already registered".into(),
                });
                return Ok(());
            }

            if let Err(reason) = authorize_register(state, role, token, loopback) {
                tracing::warn!(%addr, ?role, %reason, "Registration rejected");
                let _ = tx.send(SignalMessage::Error {
                    message: format!("authentication failed: {reason}"),
                });
                return Err(format!("auth failure: {reason}"));
            }

            match state.rooms.register(&room, role, name, tx.clone()).await {
                Ok((peer, info)) => {
                    tracing::info!(%addr, peer_id = %peer.id, %room, ?role, "Peer registered");
                    let _ = tx.send(SignalMessage::Registered {
                        peer_id: peer.id.clone(),
                        room: room.clone(),
                    });
                    let _ = tx.send(info);
                    *session = Some((room, peer));
                    Ok(())
                }
                Err(e) => {
                    let _ = tx.send(SignalMessage::Error {
                        message: e.to_string(),
                    });
                    Err(e.to_string())
                }
            }
        }

        SignalMessage::Join { room } => {
            let Some((current_room, peer)) = session.take() else {
                let _ = tx.send(SignalMessage::Error {
                    message: "register before join".into(),
                });
                return Err("join before register".into());
            };
            state.rooms.remove(&current_room, &peer.id).await;
            match state.rooms.adopt(&room, peer.clone()).await {
                Ok(info) => {
                    let _ = tx.send(info);
                    *session = Some((room, peer));
                    Ok(())
                }
                Err(e) => {
                    let _ = tx.send(SignalMessage::Error {
                        message: e.to_string(),
                    });
                    Err(e.to_string())
                }
            }
        }

        message @ (SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::IceCandidate { .. }) => {
            let Some((room, peer)) = session.as_ref() else {
                return Err("signaling before register".into());
            };
            state.rooms.route(room, peer, message).await;
            Ok(())
        }

        SignalMessage::Ping => {
            if let Some((room, _)) = session.as_ref() {
                state.rooms.touch(room).await;
            }
            let _ = tx.send(SignalMessage::Pong);
            Ok(())
        }

        SignalMessage::Pong => {
            if let Some((room, _)) = session.as_ref() {
                state.rooms.touch(room).await;
            }
            Ok(())
        }

        // Server-to-client message types arriving inbound are protocol
        // misuse; answer with an error but keep the connection.
        _ => {
            let _ = tx.send(SignalMessage::Error {
                message: "unexpected message type".into(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        let mut params = std::collections::HashMap::new();
        params.insert("token".to_owned(), "from-query".to_owned());
        assert_eq!(presented_token(&headers, &params).as_deref(), Some("abc"));

        headers.clear();
        assert_eq!(
            presented_token(&headers, &params).as_deref(),
            Some("from-query")
        );

        params.clear();
        assert_eq!(presented_token(&headers, &params), None);
    }
}
