//! Persisted host certificate.
//!
//! The host keeps one self-signed certificate under
//! `~/.config/streamlinux/certs/` (directory 0o700, key 0o600) so viewers
//! can pin its fingerprint across sessions. The fingerprint travels in
//! the pairing bundle.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair};

use crate::config::APP_DIR;

/// Paths and identity of the host certificate.
pub struct HostCertificate {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// SHA-256 over the certificate DER, colon-separated hex.
    pub fingerprint: String,
}

/// Directory holding the certificate pair.
pub fn certs_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("no user config directory")?;
    Ok(base.join(APP_DIR).join("certs"))
}

/// Load the persisted certificate, generating one on first run.
pub fn ensure_host_certificate() -> Result<HostCertificate> {
    let dir = certs_dir()?;
    let cert_path = dir.join("host.pem");
    let key_path = dir.join("host.key");

    if cert_path.exists() && key_path.exists() {
        let fingerprint = fingerprint_of(&cert_path)?;
        tracing::debug!(?cert_path, %fingerprint, "Loaded persisted host certificate");
        return Ok(HostCertificate {
            cert_path,
            key_path,
            fingerprint,
        });
    }

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create certs dir: {}", dir.display()))?;
    std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))
        .context("failed to restrict certs dir permissions")?;

    tracing::info!("Generating host certificate");
    let key_pair = KeyPair::generate().context("failed to generate key pair")?;
    let mut params = CertificateParams::new(vec!["localhost".to_owned()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String("streamlinux-host".to_owned()),
    );
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    std::fs::write(&cert_path, cert.pem())
        .with_context(|| format!("failed to write cert: {}", cert_path.display()))?;
    std::fs::write(&key_path, key_pair.serialize_pem())
        .with_context(|| format!("failed to write key: {}", key_path.display()))?;
    std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
        .context("failed to restrict key permissions")?;

    let fingerprint = fingerprint_hex(cert.der());
    Ok(HostCertificate {
        cert_path,
        key_path,
        fingerprint,
    })
}

/// Fingerprint of the first certificate in a PEM file.
pub fn fingerprint_of(path: &Path) -> Result<String> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read cert: {}", path.display()))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .context("no certificate in PEM file")?
        .context("failed to parse certificate")?;
    Ok(fingerprint_hex(cert.as_ref()))
}

fn fingerprint_hex(der: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, der);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_shape() {
        let fp = fingerprint_hex(b"example der bytes");
        // 32 bytes, colon separated.
        assert_eq!(fp.split(':').count(), 32);
        assert!(fp
            .split(':')
            .all(|part| part.len() == 2 && part.chars().all(|c| c.is_ascii_hexdigit())));
    }
}
