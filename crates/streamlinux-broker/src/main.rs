use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;

use stream_pairing::token::AttemptLimiter;
use stream_pairing::TokenStore;

mod config;
mod rest;
mod rooms;
mod ws;

use config::BrokerConfig;
use rooms::Rooms;

/// Connection attempts allowed per address per minute.
const ATTEMPT_LIMIT: usize = 10;

/// Token and limiter sweep cadence.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Signaling broker for streamlinux.
///
/// Routes pairing and session-negotiation messages between a host and
/// its viewers. Media never passes through the broker.
#[derive(Parser, Debug)]
#[command(name = "streamlinux-broker", version, about)]
struct Cli {
    /// Address to bind to.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// TLS certificate file (PEM).
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key file (PEM).
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Lifetime of host-registered tokens, in seconds.
    #[arg(long, default_value_t = 86_400)]
    token_ttl: u64,

    /// Serve plaintext WebSocket. Only valid on a loopback bind.
    #[arg(long)]
    allow_insecure: bool,

    /// Print a pairing QR code on startup.
    #[arg(long)]
    qr: bool,

    /// Advertise the broker via mDNS.
    #[arg(long)]
    mdns: bool,

    /// Seconds an empty room survives before it is destroyed.
    #[arg(long, default_value_t = 300)]
    room_timeout: u64,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,

    /// Comma-separated list of additional allowed web origins.
    #[arg(long, value_delimiter = ',')]
    allowed_origins: Vec<String>,
}

/// Shared state behind every handler.
pub struct AppState {
    pub rooms: Rooms,
    pub tokens: Arc<TokenStore>,
    pub limiter: Arc<AttemptLimiter>,
    pub config: Arc<BrokerConfig>,
    /// Externally reachable address used in pairing bundles.
    pub public_host: String,
    /// SHA-256 fingerprint of the TLS certificate, when serving TLS.
    pub cert_fingerprint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = BrokerConfig {
        host: cli.host,
        port: cli.port,
        tls_cert: cli.tls_cert,
        tls_key: cli.tls_key,
        token_ttl: Duration::from_secs(cli.token_ttl),
        allow_insecure: cli.allow_insecure,
        qr: cli.qr,
        mdns: cli.mdns,
        room_timeout: Duration::from_secs(cli.room_timeout),
        allowed_origins: cli.allowed_origins,
    };
    config.validate()?;

    let cert_fingerprint = match &config.tls_cert {
        Some(path) => Some(cert_fingerprint(path)?),
        None => None,
    };

    let public_host = public_address(config.host);
    let state = Arc::new(AppState {
        rooms: Rooms::new(),
        tokens: Arc::new(TokenStore::new()),
        limiter: Arc::new(AttemptLimiter::new(ATTEMPT_LIMIT, Duration::from_secs(60))),
        config: Arc::new(config.clone()),
        public_host,
        cert_fingerprint,
    });

    tracing::info!(
        bind = %config.bind_addr(),
        tls = config.tls_enabled(),
        room_timeout = config.room_timeout.as_secs(),
        "Starting streamlinux-broker"
    );

    // mDNS advertisement is best-effort.
    let _mdns = if config.mdns {
        match stream_pairing::MdnsAdvertiser::new(config.host, config.port, config.tls_enabled()) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                tracing::warn!("mDNS advertisement failed: {e}");
                None
            }
        }
    } else {
        None
    };

    if config.qr {
        let bundle = rest::make_bundle(&state).await;
        match stream_pairing::qr::bundle_to_terminal(&bundle) {
            Ok(block) => println!("{block}"),
            Err(e) => tracing::warn!("QR rendering failed: {e}"),
        }
    }

    // Periodic sweeps: expired tokens, idle rooms, stale rate windows.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let expired = state.tokens.sweep();
                if expired > 0 {
                    tracing::debug!(expired, "Swept expired tokens");
                }
                state.limiter.sweep();
                state.rooms.sweep_idle(state.config.room_timeout).await;
            }
        });
    }

    let app = Router::new()
        .route("/health", get(rest::health))
        .route("/rooms", get(rest::rooms))
        .route("/hosts", get(rest::hosts))
        .route("/qr", get(rest::qr))
        .route("/qr/image", get(rest::qr_image))
        .route("/ws", get(ws::ws_handler))
        .route("/ws/signaling", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::clone(&state));

    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    let addr = config.bind_addr();

    let serve = async {
        if config.tls_enabled() {
            let rustls = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                config.tls_cert.as_ref().expect("validated"),
                config.tls_key.as_ref().expect("validated"),
            )
            .await
            .context("failed to load TLS certificate")?;
            axum_server::bind_rustls(addr, rustls)
                .serve(make_service)
                .await
                .context("broker server error")
        } else {
            axum_server::bind(addr)
                .serve(make_service)
                .await
                .context("broker server error")
        }
    };

    let shutdown = async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
        }
    };

    tokio::select! {
        result = serve => result?,
        () = shutdown => tracing::info!("Broker stopped"),
    }

    Ok(())
}

/// SHA-256 fingerprint of the first certificate in a PEM file, rendered
/// as colon-separated hex.
fn cert_fingerprint(path: &std::path::Path) -> Result<String> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read certificate: {}", path.display()))?;
    let mut reader = std::io::BufReader::new(pem.as_slice());
    let cert = rustls_pemfile::certs(&mut reader)
        .next()
        .context("no certificate in PEM file")?
        .context("failed to parse certificate")?;

    let digest = ring::digest::digest(&ring::digest::SHA256, cert.as_ref());
    Ok(digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":"))
}

/// Address to advertise in pairing bundles.
///
/// A concrete bind address is used as-is; for wildcard binds, route
/// discovery picks the interface a LAN viewer would reach us on.
fn public_address(bind: IpAddr) -> String {
    if !bind.is_unspecified() {
        return bind.to_string();
    }

    // Connect a throwaway UDP socket to learn the default route's
    // source address. No packet is sent.
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("192.0.2.1", 9))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) => ip.to_string(),
        Err(_) => "127.0.0.1".to_owned(),
    }
}
