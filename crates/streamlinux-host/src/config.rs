//! Host configuration.
//!
//! TOML file with `[display] [video] [audio] [network] [logging]`
//! sections. Every numeric field is range-checked after parsing, and the
//! config path must live under the user config directory or
//! `/etc/streamlinux/` with no `..` segments.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Application directory name under the user config dir and `/etc`.
pub const APP_DIR: &str = "streamlinux";

/// Host configuration file contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub display: DisplaySection,
    pub video: VideoSection,
    pub audio: AudioSection,
    pub network: NetworkSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySection {
    /// Capture backend: "auto", "server" (X11) or "compositor" (portal).
    pub backend: String,
    /// Monitor id to capture.
    pub monitor: u32,
    /// Target frames per second.
    pub fps: u32,
    /// Composite the cursor into the stream.
    pub cursor: bool,
}

impl Default for DisplaySection {
    fn default() -> Self {
        Self {
            backend: "auto".to_owned(),
            monitor: 0,
            fps: 30,
            cursor: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSection {
    /// Output width; 0 follows the capture size.
    pub width: u32,
    /// Output height; 0 follows the capture size.
    pub height: u32,
    /// Codec: h264, h265, vp8, vp9, av1.
    pub codec: String,
    /// Target bitrate in bits per second.
    pub bitrate: u64,
    /// Hardware acceleration: auto, vaapi, nvenc, software.
    pub hw_accel: String,
    /// Seconds between keyframes.
    pub keyframe_interval_secs: u32,
}

impl Default for VideoSection {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            codec: "h264".to_owned(),
            bitrate: 5_000_000,
            hw_accel: "auto".to_owned(),
            keyframe_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Source: system, mic, mixed, none.
    pub source: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Opus bitrate in bits per second.
    pub bitrate: u32,
    /// Frame duration in milliseconds.
    pub frame_ms: u32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            source: "system".to_owned(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            frame_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Broker WebSocket URL; empty means ws://127.0.0.1:<port>/ws.
    pub broker_url: String,
    /// Broker port used when `broker_url` is empty.
    pub port: u16,
    /// Room to host.
    pub room: String,
    /// STUN servers for ICE; empty for LAN-only host candidates.
    pub stun_servers: Vec<String>,
    /// Permit STUN/TURN servers with private addresses (LAN mode).
    pub allow_private_servers: bool,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            broker_url: String::new(),
            port: 8080,
            room: "default".to_owned(),
            stun_servers: Vec::new(),
            allow_private_servers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log filter: error, warn, info, debug, trace.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl HostConfig {
    /// Range-check every field that reaches an allocator or a protocol.
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.display.backend.as_str(), "auto" | "server" | "compositor") {
            bail!("display.backend must be auto, server or compositor");
        }
        if !(1..=240).contains(&self.display.fps) {
            bail!("display.fps {} out of range 1..=240", self.display.fps);
        }
        if self.video.width > 16_384 || self.video.height > 16_384 {
            bail!(
                "video resolution {}x{} exceeds 16384 per axis",
                self.video.width,
                self.video.height
            );
        }
        if !(100_000..=100_000_000).contains(&self.video.bitrate) {
            bail!(
                "video.bitrate {} out of range 100000..=100000000",
                self.video.bitrate
            );
        }
        if !matches!(self.video.codec.as_str(), "h264" | "h265" | "vp8" | "vp9" | "av1") {
            bail!("video.codec '{}' is not supported", self.video.codec);
        }
        if !matches!(
            self.video.hw_accel.as_str(),
            "auto" | "vaapi" | "nvenc" | "software"
        ) {
            bail!("video.hw_accel '{}' is not supported", self.video.hw_accel);
        }
        if !(1..=30).contains(&self.video.keyframe_interval_secs) {
            bail!(
                "video.keyframe_interval_secs {} out of range 1..=30",
                self.video.keyframe_interval_secs
            );
        }
        if !matches!(self.audio.source.as_str(), "system" | "mic" | "mixed" | "none") {
            bail!("audio.source must be system, mic, mixed or none");
        }
        if !matches!(self.audio.sample_rate, 8000 | 12_000 | 16_000 | 24_000 | 48_000) {
            bail!("audio.sample_rate {} is not an Opus rate", self.audio.sample_rate);
        }
        if !(1..=8).contains(&self.audio.channels) {
            bail!("audio.channels {} out of range 1..=8", self.audio.channels);
        }
        if !(6_000..=512_000).contains(&self.audio.bitrate) {
            bail!("audio.bitrate {} out of range 6000..=512000", self.audio.bitrate);
        }
        if !matches!(self.audio.frame_ms, 10 | 20 | 40 | 60) {
            bail!("audio.frame_ms {} is not a legal Opus frame", self.audio.frame_ms);
        }
        if self.network.port == 0 {
            bail!("network.port must be non-zero");
        }
        if self.network.room.is_empty() {
            bail!("network.room must not be empty");
        }
        for server in &self.network.stun_servers {
            check_ice_server(server, self.network.allow_private_servers)?;
        }
        if !matches!(
            self.logging.level.as_str(),
            "error" | "warn" | "info" | "debug" | "trace"
        ) {
            bail!("logging.level '{}' is not a log level", self.logging.level);
        }
        Ok(())
    }

    /// The broker URL this host registers with.
    #[must_use]
    pub fn broker_url(&self) -> String {
        if self.network.broker_url.is_empty() {
            format!("ws://127.0.0.1:{}/ws", self.network.port)
        } else {
            self.network.broker_url.clone()
        }
    }
}

/// Validate one configured STUN/TURN server URL.
///
/// Only `stun:`/`turn:` schemes with a plain host:port are accepted; any
/// character that could smuggle a second argument or shell construct into
/// downstream tooling is rejected outright. Private and loopback hosts
/// need the explicit LAN opt-in.
fn check_ice_server(server: &str, allow_private: bool) -> Result<()> {
    let rest = server
        .strip_prefix("stun:")
        .or_else(|| server.strip_prefix("turn:"))
        .with_context(|| format!("ICE server '{server}' must use stun: or turn:"))?;

    if rest.is_empty() {
        bail!("ICE server '{server}' has no host");
    }
    if !rest
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '[' | ']'))
    {
        bail!("ICE server '{server}' contains forbidden characters");
    }

    let host = rest
        .trim_start_matches('[')
        .split([']', ':'])
        .next()
        .unwrap_or(rest);
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        let private = match ip {
            std::net::IpAddr::V4(v4) => {
                v4.is_private() || v4.is_loopback() || v4.is_link_local()
            }
            std::net::IpAddr::V6(v6) => {
                v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00
            }
        };
        if private && !allow_private {
            bail!(
                "ICE server '{server}' resolves to private address space; \
                 set network.allow_private_servers for LAN mode"
            );
        }
    }
    Ok(())
}

/// Directories a config file may come from.
fn allowed_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        roots.push(dir.join(APP_DIR));
    }
    roots.push(PathBuf::from("/etc").join(APP_DIR));
    roots
}

/// Reject `..` segments and paths outside the allowed roots.
fn check_config_path(path: &Path) -> Result<()> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        bail!("config path must not contain '..': {}", path.display());
    }
    let roots = allowed_roots();
    if !roots.iter().any(|root| path.starts_with(root)) {
        bail!(
            "config path {} must live under {} or /etc/{APP_DIR}/",
            path.display(),
            roots
                .first()
                .map(|r| r.display().to_string())
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Default config file location.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

/// Load the configuration.
///
/// A missing file yields the defaults; a present file must parse and
/// validate.
pub fn load(path: Option<&Path>) -> Result<HostConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Some(p) => p,
            None => return Ok(HostConfig::default()),
        },
    };

    check_config_path(&path)?;

    if !path.exists() {
        tracing::debug!(?path, "Config not found, using defaults");
        return Ok(HostConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: HostConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {}", path.display()))?;

    tracing::info!(?path, "Configuration loaded");
    Ok(config)
}

/// Save the configuration, applying the same validation as load.
pub fn save(config: &HostConfig, path: &Path) -> Result<()> {
    config.validate()?;
    check_config_path(path)?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
    }
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, &contents)
        .with_context(|| format!("failed to write temp config: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename config: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(HostConfig::default().validate().is_ok());
    }

    #[test]
    fn bitrate_bounds() {
        let mut config = HostConfig::default();
        config.video.bitrate = 99_999;
        assert!(config.validate().is_err());
        config.video.bitrate = 100_000_001;
        assert!(config.validate().is_err());
        config.video.bitrate = 100_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_numeric_garbage_fails_parse() {
        let toml = "[video]\nbitrate = \"plenty\"\n";
        assert!(toml::from_str::<HostConfig>(toml).is_err());

        let toml = "[display]\nfps = -5\n";
        assert!(toml::from_str::<HostConfig>(toml).is_err());
    }

    #[test]
    fn oversized_resolution_rejected() {
        let mut config = HostConfig::default();
        config.video.width = 16_385;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parent_segments_rejected() {
        let err = check_config_path(Path::new("/etc/streamlinux/../shadow/config.toml"));
        assert!(err.is_err());
    }

    #[test]
    fn foreign_path_rejected() {
        assert!(check_config_path(Path::new("/tmp/config.toml")).is_err());
        assert!(check_config_path(Path::new("/etc/streamlinux/config.toml")).is_ok());
    }

    #[test]
    fn broker_url_falls_back_to_loopback() {
        let mut config = HostConfig::default();
        assert_eq!(config.broker_url(), "ws://127.0.0.1:8080/ws");
        config.network.broker_url = "wss://broker.lan:9000/ws".to_owned();
        assert_eq!(config.broker_url(), "wss://broker.lan:9000/ws");
    }

    #[test]
    fn ice_server_validation() {
        assert!(check_ice_server("stun:stun.example.com:3478", false).is_ok());
        assert!(check_ice_server("turn:turn.example.com:3478", false).is_ok());
        // Injection-capable separators are rejected outright.
        assert!(check_ice_server("stun:host;rm -rf /", false).is_err());
        assert!(check_ice_server("stun:host|cat", false).is_err());
        assert!(check_ice_server("http://host", false).is_err());
        // Private addresses need the LAN opt-in.
        assert!(check_ice_server("stun:192.168.1.1:3478", false).is_err());
        assert!(check_ice_server("stun:192.168.1.1:3478", true).is_ok());
    }

    #[test]
    fn audio_limits() {
        let mut config = HostConfig::default();
        config.audio.channels = 9;
        assert!(config.validate().is_err());
        config.audio.channels = 2;
        config.audio.frame_ms = 15;
        assert!(config.validate().is_err());
    }
}
