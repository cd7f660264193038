/// Errors from the peer transport and signaling paths.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("negotiation failed: {0}")]
    NegotiationFailure(String),

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("rate limited")]
    RateLimited,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("transport closed")]
    Closed,

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<webrtc::Error> for TransportError {
    fn from(e: webrtc::Error) -> Self {
        Self::NegotiationFailure(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Signaling(e.to_string())
    }
}
