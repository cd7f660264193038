//! WebRTC peer transport.
//!
//! Carries one send-only video track, one send-only audio track and the
//! bidirectional control data channel to a single viewer. The host is
//! always the offerer; candidates trickle out through the signaling
//! client as they are gathered. DTLS/SRTP is handled by the webrtc stack,
//! and no media is written before the connection reports itself
//! connected.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{
    MediaEngine, MIME_TYPE_AV1, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use stream_encode::VideoCodec;
use stream_sync::SyncedPair;

use crate::control::{ControlChannel, ControlInbox, ControlPayload};
use crate::error::TransportError;

/// ICE gathering budget.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(10);

/// DTLS handshake budget.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct PeerTransportConfig {
    pub video_codec: VideoCodec,
    /// STUN server URLs; empty for pure host-candidate LAN sessions.
    pub stun_servers: Vec<String>,
    /// How long a Disconnected peer may try to restore before Failed.
    pub reconnect_timeout: Duration,
}

impl Default for PeerTransportConfig {
    fn default() -> Self {
        Self {
            video_codec: VideoCodec::H264,
            stun_servers: Vec::new(),
            reconnect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Closed,
    Failed,
}

/// Observable transport statistics. Counters are written from the send
/// path and may be read mid-update; a mixed snapshot is acceptable.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub video_frames_sent: u64,
    pub audio_frames_sent: u64,
    pub current_bitrate_bps: u64,
    pub rtt_us: f64,
}

struct SendCounters {
    bytes_sent: AtomicU64,
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    window_bytes: AtomicU64,
    window_start_us: AtomicI64,
    bitrate_bps: AtomicU64,
}

impl SendCounters {
    fn new() -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            video_frames: AtomicU64::new(0),
            audio_frames: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            window_start_us: AtomicI64::new(stream_capture::clock::monotonic_us()),
            bitrate_bps: AtomicU64::new(0),
        }
    }

    fn record(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.window_bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        let now = stream_capture::clock::monotonic_us();
        let start = self.window_start_us.load(Ordering::Relaxed);
        let elapsed = now - start;
        if elapsed >= 1_000_000 {
            let bytes = self.window_bytes.swap(0, Ordering::Relaxed);
            self.window_start_us.store(now, Ordering::Relaxed);
            #[allow(clippy::cast_sign_loss)]
            let bps = bytes * 8 * 1_000_000 / (elapsed as u64);
            self.bitrate_bps.store(bps, Ordering::Relaxed);
        }
    }
}

fn codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    let (mime_type, sdp_fmtp_line) = match codec {
        VideoCodec::H264 => (
            MIME_TYPE_H264.to_owned(),
            "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f".to_owned(),
        ),
        VideoCodec::H265 => ("video/H265".to_owned(), String::new()),
        VideoCodec::Vp8 => (MIME_TYPE_VP8.to_owned(), String::new()),
        VideoCodec::Vp9 => (MIME_TYPE_VP9.to_owned(), "profile-id=0".to_owned()),
        VideoCodec::Av1 => (MIME_TYPE_AV1.to_owned(), String::new()),
    };
    RTCRtpCodecCapability {
        mime_type,
        clock_rate: 90_000,
        channels: 0,
        sdp_fmtp_line,
        rtcp_feedback: vec![],
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_owned(),
        clock_rate: 48_000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
        rtcp_feedback: vec![],
    }
}

/// The encrypted peer connection to one viewer.
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
    video_track: Arc<TrackLocalStaticSample>,
    audio_track: Arc<TrackLocalStaticSample>,
    data_channel: Arc<RTCDataChannel>,
    control: Arc<ControlChannel>,
    state_tx: Arc<watch::Sender<TransportState>>,
    state_rx: watch::Receiver<TransportState>,
    counters: Arc<SendCounters>,
    /// For deriving video sample durations from consecutive PTS.
    last_video_pts_us: AtomicI64,
    video_fps_hint: u32,
}

impl PeerTransport {
    /// Create the peer connection, tracks and control channel.
    ///
    /// Returns the transport, a receiver for locally gathered ICE
    /// candidates (to trickle through signaling), and the bounded inbox
    /// of validated inbound control messages (for the session
    /// supervisor).
    pub async fn new(
        config: &PeerTransportConfig,
        control: Arc<ControlChannel>,
        video_fps_hint: u32,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<RTCIceCandidateInit>,
            Arc<ControlInbox>,
        ),
        TransportError,
    > {
        let mut media_engine = MediaEngine::default();

        // Register only what we actually send so the negotiated codec
        // always matches the encoder's output.
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(config.video_codec),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.stun_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }]
        };

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let video_track = Arc::new(TrackLocalStaticSample::new(
            codec_capability(config.video_codec),
            "video".to_owned(),
            "streamlinux".to_owned(),
        ));
        let audio_track = Arc::new(TrackLocalStaticSample::new(
            opus_capability(),
            "audio".to_owned(),
            "streamlinux".to_owned(),
        ));

        pc.add_track(Arc::clone(&video_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        pc.add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Reliable ordered channel for control traffic.
        let data_channel = pc
            .create_data_channel(
                "control",
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let (state_tx, state_rx) = watch::channel(TransportState::New);
        let state_tx = Arc::new(state_tx);

        let (candidate_tx, candidate_rx) = mpsc::unbounded_channel();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = candidate_tx.send(init);
                        }
                        Err(e) => tracing::warn!("Failed to serialize ICE candidate: {e}"),
                    }
                }
            })
        }));

        let inbox = Arc::new(ControlInbox::new());
        install_control_pump(&data_channel, Arc::clone(&control), Arc::clone(&inbox));
        install_state_handler(&pc, Arc::clone(&state_tx), config.reconnect_timeout);

        Ok((
            Self {
                pc,
                video_track,
                audio_track,
                data_channel,
                control,
                state_tx,
                state_rx,
                counters: Arc::new(SendCounters::new()),
                last_video_pts_us: AtomicI64::new(-1),
                video_fps_hint: video_fps_hint.max(1),
            },
            candidate_rx,
            inbox,
        ))
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TransportState {
        *self.state_rx.borrow()
    }

    /// Watch for lifecycle changes.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<TransportState> {
        self.state_rx.clone()
    }

    /// Create the offer and install it as the local description.
    ///
    /// Cancel-safe: dropping the future before completion leaves no
    /// partial local state the next attempt cannot overwrite.
    pub async fn create_offer(&self) -> Result<String, TransportError> {
        self.state_tx.send_replace(TransportState::Connecting);
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        Ok(sdp)
    }

    /// Apply the viewer's answer.
    pub async fn set_remote_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())
            .map_err(|e| TransportError::NegotiationFailure(e.to_string()))?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    /// Add one remote ICE candidate.
    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), TransportError> {
        self.pc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    /// Wait until the connection is established or `timeout` elapses.
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut watch = self.state_rx.clone();
        let result = tokio::time::timeout(timeout, async {
            loop {
                match *watch.borrow_and_update() {
                    TransportState::Connected => return Ok(()),
                    TransportState::Failed => {
                        return Err(TransportError::NegotiationFailure(
                            "peer connection failed".into(),
                        ))
                    }
                    TransportState::Closed => return Err(TransportError::Closed),
                    _ => {}
                }
                if watch.changed().await.is_err() {
                    return Err(TransportError::Closed);
                }
            }
        })
        .await;
        result.map_err(|_| TransportError::Timeout)?
    }

    /// Send one synchronized pair: video first, then its audio.
    ///
    /// Media is refused until the connection (and with it the DTLS
    /// handshake) is up.
    pub async fn send_synced(&self, pair: SyncedPair) -> Result<(), TransportError> {
        if self.state() != TransportState::Connected {
            return Err(TransportError::PeerDisconnected);
        }

        if let Some(video) = pair.video {
            let prev = self
                .last_video_pts_us
                .swap(video.pts_us, Ordering::Relaxed);
            let duration_us = if prev >= 0 && video.pts_us > prev {
                (video.pts_us - prev).min(1_000_000)
            } else {
                i64::from(1_000_000 / self.video_fps_hint)
            };

            let len = video.data.len();
            self.video_track
                .write_sample(&Sample {
                    data: video.data,
                    #[allow(clippy::cast_sign_loss)]
                    duration: Duration::from_micros(duration_us.max(0) as u64),
                    ..Default::default()
                })
                .await?;
            self.counters.record(len);
            self.counters.video_frames.fetch_add(1, Ordering::Relaxed);
        }

        if let Some(audio) = pair.audio {
            let len = audio.data.len();
            self.audio_track
                .write_sample(&Sample {
                    data: audio.data,
                    #[allow(clippy::cast_sign_loss)]
                    duration: Duration::from_micros(audio.duration_us.max(0) as u64),
                    ..Default::default()
                })
                .await?;
            self.counters.record(len);
            self.counters.audio_frames.fetch_add(1, Ordering::Relaxed);
        }

        Ok(())
    }

    /// Send a control message to the viewer.
    pub async fn send_control(&self, payload: ControlPayload) -> Result<(), TransportError> {
        if self.data_channel.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::PeerDisconnected);
        }
        let message = self.control.compose(payload);
        let line = ControlChannel::encode(&message)?;
        self.data_channel
            .send_text(line)
            .await
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            video_frames_sent: self.counters.video_frames.load(Ordering::Relaxed),
            audio_frames_sent: self.counters.audio_frames.load(Ordering::Relaxed),
            current_bitrate_bps: self.counters.bitrate_bps.load(Ordering::Relaxed),
            rtt_us: self.control.rtt_us(),
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.state_tx.send_replace(TransportState::Closed);
        self.pc.close().await?;
        Ok(())
    }
}

/// Pump inbound data-channel messages through the control channel into
/// the bounded supervisor inbox.
fn install_control_pump(
    data_channel: &Arc<RTCDataChannel>,
    control: Arc<ControlChannel>,
    inbox: Arc<ControlInbox>,
) {
    let dc_for_reply = Arc::clone(data_channel);
    data_channel.on_message(Box::new(move |msg| {
        let control = Arc::clone(&control);
        let inbox = Arc::clone(&inbox);
        let dc = Arc::clone(&dc_for_reply);
        Box::pin(async move {
            let text = if msg.is_string {
                String::from_utf8_lossy(&msg.data).into_owned()
            } else {
                return;
            };

            for line in text.lines() {
                match control.accept(line) {
                    Ok(Some(message)) => {
                        if matches!(message.payload, ControlPayload::Ping) {
                            let pong = control.pong_for(&message);
                            if let Ok(encoded) = ControlChannel::encode(&pong) {
                                let _ = dc.send_text(encoded).await;
                            }
                            continue;
                        }
                        inbox.push(message);
                    }
                    Ok(None) => {}
                    Err(TransportError::RateLimited) => {
                        let err = control.compose(ControlPayload::Error {
                            message: "rate limit exceeded".into(),
                        });
                        if let Ok(encoded) = ControlChannel::encode(&err) {
                            let _ = dc.send_text(encoded).await;
                        }
                    }
                    Err(e) => {
                        tracing::debug!("Dropping bad control message: {e}");
                    }
                }
            }
        })
    }));
}

/// Map peer-connection state changes onto the transport state machine and
/// arm the Disconnected → Failed timer.
fn install_state_handler(
    pc: &Arc<RTCPeerConnection>,
    state_tx: Arc<watch::Sender<TransportState>>,
    reconnect_timeout: Duration,
) {
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let state_tx = Arc::clone(&state_tx);
        Box::pin(async move {
            tracing::info!("Peer connection state: {s}");
            let mapped = match s {
                RTCPeerConnectionState::New => Some(TransportState::New),
                RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
                RTCPeerConnectionState::Connected => Some(TransportState::Connected),
                RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
                RTCPeerConnectionState::Failed => Some(TransportState::Failed),
                RTCPeerConnectionState::Closed => Some(TransportState::Closed),
                RTCPeerConnectionState::Unspecified => None,
            };
            let Some(mapped) = mapped else { return };

            // Closed is terminal; never leave it on late callbacks.
            if *state_tx.borrow() == TransportState::Closed {
                return;
            }
            state_tx.send_replace(mapped);

            if mapped == TransportState::Disconnected {
                // Give ICE a chance to restore, then declare failure.
                let deadline = Instant::now() + reconnect_timeout;
                let tx = Arc::clone(&state_tx);
                tokio::spawn(async move {
                    tokio::time::sleep_until(deadline.into()).await;
                    let mut failed = false;
                    tx.send_if_modified(|state| {
                        if *state == TransportState::Disconnected
                            || *state == TransportState::Reconnecting
                        {
                            *state = TransportState::Failed;
                            failed = true;
                            true
                        } else {
                            false
                        }
                    });
                    if failed {
                        tracing::warn!("Peer did not reconnect in time, marking Failed");
                    }
                });
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h264_capability_has_low_latency_fmtp() {
        let cap = codec_capability(VideoCodec::H264);
        assert_eq!(cap.mime_type, MIME_TYPE_H264);
        assert!(cap.sdp_fmtp_line.contains("packetization-mode=1"));
        assert_eq!(cap.clock_rate, 90_000);
    }

    #[test]
    fn opus_capability_is_stereo_48k() {
        let cap = opus_capability();
        assert_eq!(cap.clock_rate, 48_000);
        assert_eq!(cap.channels, 2);
    }

    #[tokio::test]
    async fn offer_contains_media_and_data_sections() {
        let control = Arc::new(ControlChannel::new());
        let (transport, _candidates, _inbox) =
            PeerTransport::new(&PeerTransportConfig::default(), control, 30)
                .await
                .expect("transport");

        let sdp = transport.create_offer().await.expect("offer");
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=application"));
        // Media sections carry the encrypted profile.
        assert!(sdp.contains("UDP/TLS/RTP/SAVPF"));
        assert_eq!(transport.state(), TransportState::Connecting);

        transport.close().await.expect("close");
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn media_refused_before_connected() {
        let control = Arc::new(ControlChannel::new());
        let (transport, _candidates, _inbox) =
            PeerTransport::new(&PeerTransportConfig::default(), control, 30)
                .await
                .expect("transport");

        let pair = SyncedPair {
            video: Some(stream_encode::EncodedVideoFrame {
                data: vec![0u8; 4].into(),
                pts_us: 0,
                dts_us: 0,
                keyframe: true,
            }),
            audio: None,
            presentation_us: 0,
        };
        let err = transport.send_synced(pair).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerDisconnected));
        transport.close().await.expect("close");
    }
}
