//! Pairing bundle.
//!
//! Everything a viewer needs to find and authenticate to the host, as one
//! JSON object. The serialized form is what gets rendered as a QR code.

use serde::{Deserialize, Serialize};

/// Bundle wire format: `{"host", "port", "tls", "token", "fingerprint"?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingBundle {
    /// Host address (IP or DNS name).
    pub host: String,
    pub port: u16,
    /// Whether the broker endpoint speaks TLS.
    pub tls: bool,
    pub token: String,
    /// SHA-256 fingerprint of the host certificate, hex with colons.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

impl PairingBundle {
    /// Serialize for QR rendering.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a scanned bundle.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The WebSocket URL a viewer should connect to.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> PairingBundle {
        PairingBundle {
            host: "192.168.1.20".into(),
            port: 8080,
            tls: true,
            token: "abc123".into(),
            fingerprint: Some("AA:BB:CC".into()),
        }
    }

    #[test]
    fn json_round_trip() {
        let original = bundle();
        let json = original.to_json().unwrap();
        let parsed = PairingBundle::from_json(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn wire_field_names() {
        let json = bundle().to_json().unwrap();
        for field in ["\"host\"", "\"port\"", "\"tls\"", "\"token\"", "\"fingerprint\""] {
            assert!(json.contains(field), "missing {field} in {json}");
        }
    }

    #[test]
    fn fingerprint_is_optional() {
        let mut b = bundle();
        b.fingerprint = None;
        let json = b.to_json().unwrap();
        assert!(!json.contains("fingerprint"));
        assert_eq!(PairingBundle::from_json(&json).unwrap(), b);
    }

    #[test]
    fn ws_url_scheme_follows_tls() {
        let mut b = bundle();
        assert_eq!(b.ws_url(), "wss://192.168.1.20:8080/ws");
        b.tls = false;
        assert_eq!(b.ws_url(), "ws://192.168.1.20:8080/ws");
    }
}
