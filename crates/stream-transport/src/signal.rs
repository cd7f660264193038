//! Signaling wire protocol.
//!
//! Every message on the broker's WebSocket is one JSON object tagged by
//! `type`. The same definitions serve the host client and the broker so
//! the two ends cannot disagree about the wire format.

use serde::{Deserialize, Serialize};

/// Which side of the session a peer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Host,
    Viewer,
}

impl PeerRole {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Host => Self::Viewer,
            Self::Viewer => Self::Host,
        }
    }
}

/// Summary of a peer inside a `room_info` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSummary {
    #[serde(rename = "peerId")]
    pub peer_id: String,
    pub role: PeerRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A signaling message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Peer announces itself and its desired room.
    Register {
        room: String,
        role: PeerRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Broker acknowledges registration with the assigned peer id.
    Registered {
        #[serde(rename = "peerId")]
        peer_id: String,
        room: String,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
        role: PeerRole,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    /// Join an existing room without re-registering.
    Join { room: String },
    #[serde(rename = "room_info")]
    RoomInfo {
        room: String,
        has_host: bool,
        peers: Vec<PeerSummary>,
    },
    Offer {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        sdp: String,
    },
    Answer {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        sdp: String,
    },
    IceCandidate {
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        candidate: String,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },
    Ping,
    Pong,
    Error { message: String },
}

impl SignalMessage {
    /// The `to` routing field for forwardable messages.
    #[must_use]
    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::IceCandidate { to, .. } => {
                to.as_deref()
            }
            _ => None,
        }
    }

    /// Whether the broker forwards this message between peers.
    #[must_use]
    pub fn is_forwardable(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. } | Self::Answer { .. } | Self::IceCandidate { .. }
        )
    }

    /// Stamp the sender id a message is forwarded with.
    #[must_use]
    pub fn with_from(mut self, peer_id: &str) -> Self {
        match &mut self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. } => *from = Some(peer_id.to_owned()),
            _ => {}
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_match_protocol() {
        let msg = SignalMessage::Register {
            room: "r".into(),
            role: PeerRole::Host,
            name: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"register\""));
        assert!(json.contains("\"role\":\"host\""));

        let msg = SignalMessage::IceCandidate {
            from: None,
            to: Some("abc".into()),
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ice-candidate\""));
        assert!(json.contains("\"sdpMid\":\"0\""));
        assert!(json.contains("\"sdpMLineIndex\":0"));

        let msg = SignalMessage::RoomInfo {
            room: "r".into(),
            has_host: true,
            peers: vec![],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"room_info\""));
    }

    #[test]
    fn round_trips() {
        let msg = SignalMessage::Offer {
            from: Some("h".into()),
            to: Some("v".into()),
            sdp: "v=0".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: SignalMessage = serde_json::from_str(&json).unwrap();
        match back {
            SignalMessage::Offer { from, to, sdp } => {
                assert_eq!(from.as_deref(), Some("h"));
                assert_eq!(to.as_deref(), Some("v"));
                assert_eq!(sdp, "v=0");
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = serde_json::from_str::<SignalMessage>("{\"type\":\"shutdown\"}");
        assert!(err.is_err());
    }

    #[test]
    fn with_from_stamps_forwardables_only() {
        let msg = SignalMessage::Offer {
            from: None,
            to: None,
            sdp: String::new(),
        }
        .with_from("peer-1");
        assert!(matches!(msg, SignalMessage::Offer { from: Some(f), .. } if f == "peer-1"));

        let msg = SignalMessage::Ping.with_from("peer-1");
        assert!(matches!(msg, SignalMessage::Ping));
    }
}
