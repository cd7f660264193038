// Peer transport for streamlinux.
//
// - signal.rs: the JSON wire protocol spoken with the signaling broker
//   (shared by the host client and the broker itself)
// - peer.rs: WebRTC peer connection carrying the media tracks and the
//   control data channel
// - control.rs: authenticated, rate-limited control channel
// - signaling.rs: the host's WebSocket client to the broker

pub mod control;
pub mod error;
pub mod peer;
pub mod signal;
pub mod signaling;

pub use control::{ControlChannel, ControlInbox, ControlMessage, ControlPayload, QualityPreset};
pub use error::TransportError;
pub use peer::{PeerTransport, PeerTransportConfig, TransportState, TransportStats};
pub use signal::{PeerRole, SignalMessage};
pub use signaling::{SignalingClient, SignalingEvent};
