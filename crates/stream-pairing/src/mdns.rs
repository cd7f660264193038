//! mDNS service advertisement.
//!
//! Publishes `_streamlinux._tcp` on the local link so viewers find the
//! host without typing addresses. Best-effort: registration failure is
//! logged and the stream runs without discovery.

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceInfo};

/// DNS-SD service type for streamlinux hosts.
const SERVICE_TYPE: &str = "_streamlinux._tcp.local.";

/// Registered advertisement; unregisters on drop.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    fullname: String,
}

impl MdnsAdvertiser {
    /// Register the service on the given address and port.
    pub fn new(advertise_ip: IpAddr, port: u16, tls: bool) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "streamlinux".to_owned());

        // DNS-safe instance hostname.
        let dns_host: String = host
            .to_lowercase()
            .replace(' ', "-")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();

        let mut txt = HashMap::new();
        txt.insert("streamlinux".to_owned(), format!("{host}:{port}"));
        txt.insert("tls".to_owned(), tls.to_string());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &host,
            &format!("{dns_host}.local."),
            advertise_ip,
            port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_owned();
        daemon.register(service)?;

        tracing::info!(%advertise_ip, port, tls, "mDNS service registered");

        Ok(Self { daemon, fullname })
    }

    /// Unregister explicitly (drop does the same).
    pub fn shutdown(&self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            tracing::debug!("mDNS unregister failed: {e}");
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.shutdown();
        let _ = self.daemon.shutdown();
    }
}
