//! Broker configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

/// Broker runtime configuration, assembled from CLI flags.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind the listener to.
    pub host: IpAddr,
    pub port: u16,
    /// TLS certificate path (PEM). TLS is on when both paths are set.
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Lifetime for host-registered tokens.
    pub token_ttl: Duration,
    /// Serve plaintext WebSocket. Only legal on loopback binds.
    pub allow_insecure: bool,
    /// Print a pairing QR code on startup.
    pub qr: bool,
    /// Advertise the broker over mDNS.
    pub mdns: bool,
    /// Idle room lifetime.
    pub room_timeout: Duration,
    /// Web origins allowed to upgrade, beyond the built-in loopback and
    /// private-network allowances.
    pub allowed_origins: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::from([127, 0, 0, 1]),
            port: 8080,
            tls_cert: None,
            tls_key: None,
            token_ttl: Duration::from_secs(24 * 60 * 60),
            allow_insecure: false,
            qr: false,
            mdns: false,
            room_timeout: Duration::from_secs(300),
            allowed_origins: Vec::new(),
        }
    }
}

impl BrokerConfig {
    /// Whether the listener speaks TLS.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Reject configurations that would serve plaintext off-loopback.
    ///
    /// `allow_insecure` exists for the USB-forwarded loopback path only;
    /// an unencrypted listener on a routable address is a startup error,
    /// not a warning.
    pub fn validate(&self) -> Result<()> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(_), None) => bail!("--tls-cert requires --tls-key"),
            (None, Some(_)) => bail!("--tls-key requires --tls-cert"),
            _ => {}
        }

        if !self.tls_enabled() {
            if !self.allow_insecure {
                bail!(
                    "no TLS certificate configured; pass --tls-cert/--tls-key, \
                     or --allow-insecure for a loopback-only broker"
                );
            }
            if !self.host.is_loopback() {
                bail!(
                    "--allow-insecure requires a loopback bind address, got {}",
                    self.host
                );
            }
        }

        Ok(())
    }
}

/// Whether an Origin header value may upgrade.
///
/// Empty origins are native clients. Loopback and private-network origins
/// are LAN viewers. Anything else must be explicitly allow-listed.
#[must_use]
pub fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if origin.is_empty() {
        return true;
    }
    if allowed.iter().any(|a| a == origin) {
        return true;
    }

    let host = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .unwrap_or(origin);
    let host = host.split([':', '/']).next().unwrap_or(host);

    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || is_private(ip);
    }
    false
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insecure_off_loopback_rejected() {
        let config = BrokerConfig {
            host: "0.0.0.0".parse().unwrap(),
            allow_insecure: true,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn insecure_on_loopback_accepted() {
        let config = BrokerConfig {
            allow_insecure: true,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn plaintext_without_flag_rejected() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn half_configured_tls_rejected() {
        let config = BrokerConfig {
            tls_cert: Some("/tmp/cert.pem".into()),
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn origins() {
        assert!(origin_allowed(None, &[]));
        assert!(origin_allowed(Some(""), &[]));
        assert!(origin_allowed(Some("http://localhost:3000"), &[]));
        assert!(origin_allowed(Some("http://127.0.0.1"), &[]));
        assert!(origin_allowed(Some("http://192.168.1.50:8080"), &[]));
        assert!(!origin_allowed(Some("https://evil.example.com"), &[]));
        assert!(origin_allowed(
            Some("https://viewer.example.com"),
            &["https://viewer.example.com".to_owned()]
        ));
    }
}
