//! Host-side signaling client.
//!
//! One WebSocket to the broker: register as host, receive viewer joins
//! and answers, trickle local candidates out. Media never touches this
//! connection, so the session survives a broker restart; when the socket
//! drops the client reports it and stops.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::error::TransportError;
use crate::signal::{PeerRole, SignalMessage};

/// Events surfaced to the session supervisor.
#[derive(Debug)]
pub enum SignalingEvent {
    /// Broker assigned us a peer id.
    Registered { peer_id: String },
    ViewerJoined {
        peer_id: String,
        name: Option<String>,
    },
    ViewerLeft { peer_id: String },
    /// The viewer's SDP answer.
    Answer { from: Option<String>, sdp: String },
    /// A remote ICE candidate.
    RemoteCandidate {
        from: Option<String>,
        candidate: RTCIceCandidateInit,
    },
    /// Broker sent an error message.
    BrokerError { message: String },
    /// The socket closed; negotiation for new viewers is unavailable.
    Disconnected,
}

/// Handle for sending messages to the broker.
#[derive(Clone)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalingClient {
    /// Connect, register as host, and start the read/write pumps.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        room: &str,
        name: Option<String>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Signaling(e.to_string()))?;
        if let Some(token) = token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| TransportError::InvalidArgument("token is not header-safe".into()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = connect_async(request).await?;
        tracing::info!(%url, %room, "Connected to signaling broker");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let register = SignalMessage::Register {
            room: room.to_owned(),
            role: PeerRole::Host,
            name,
        };
        ws_tx
            .send(Message::Text(serde_json::to_string(&register)?))
            .await?;

        // Write pump.
        let writer_outbound = outbound.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to serialize signaling message: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    tracing::warn!("Signaling write failed: {e}");
                    break;
                }
            }
        });

        // Read pump.
        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => continue,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(Message::Frame(_)) => continue,
                };

                let message: SignalMessage = match serde_json::from_str(&text) {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::debug!("Ignoring malformed signaling message: {e}");
                        continue;
                    }
                };

                let event = match message {
                    SignalMessage::Registered { peer_id, .. } => {
                        Some(SignalingEvent::Registered { peer_id })
                    }
                    SignalMessage::PeerJoined { peer_id, role, name } => {
                        (role == PeerRole::Viewer)
                            .then_some(SignalingEvent::ViewerJoined { peer_id, name })
                    }
                    SignalMessage::PeerLeft { peer_id } => {
                        Some(SignalingEvent::ViewerLeft { peer_id })
                    }
                    SignalMessage::Answer { from, sdp, .. } => {
                        Some(SignalingEvent::Answer { from, sdp })
                    }
                    SignalMessage::IceCandidate {
                        from,
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        ..
                    } => Some(SignalingEvent::RemoteCandidate {
                        from,
                        candidate: RTCIceCandidateInit {
                            candidate,
                            sdp_mid,
                            sdp_mline_index,
                            username_fragment: None,
                        },
                    }),
                    SignalMessage::Ping => {
                        let _ = writer_outbound.send(SignalMessage::Pong);
                        None
                    }
                    SignalMessage::Error { message } => {
                        Some(SignalingEvent::BrokerError { message })
                    }
                    _ => None,
                };

                if let Some(event) = event {
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        Ok((Self { outbound }, event_rx))
    }

    /// Queue a message for the broker.
    pub fn send(&self, message: SignalMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Signaling("signaling connection closed".into()))
    }

    /// Send the SDP offer to a specific viewer.
    pub fn send_offer(&self, to: &str, sdp: String) -> Result<(), TransportError> {
        self.send(SignalMessage::Offer {
            from: None,
            to: Some(to.to_owned()),
            sdp,
        })
    }

    /// Trickle one local candidate to a specific viewer.
    pub fn send_candidate(
        &self,
        to: &str,
        candidate: &RTCIceCandidateInit,
    ) -> Result<(), TransportError> {
        self.send(SignalMessage::IceCandidate {
            from: None,
            to: Some(to.to_owned()),
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        })
    }
}
