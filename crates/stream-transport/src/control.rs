//! Control channel.
//!
//! Runtime tuning requests ride the peer's data channel as
//! newline-delimited JSON. The channel is bound to exactly one
//! authenticated peer when the session is established; messages from
//! anyone else are dropped. Inbound traffic is rate limited and every
//! payload is validated before it reaches the session supervisor.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use stream_capture::clock;

use crate::error::TransportError;

/// Messages allowed per second per peer.
const RATE_LIMIT_PER_SEC: usize = 10;

/// Depth of the validated-message handoff to the session supervisor.
const INBOX_DEPTH: usize = 10;

/// EWMA weight for RTT updates (1/8, the TCP SRTT weight).
const RTT_ALPHA: f64 = 0.125;

/// Quality presets and their (scale, bitrate, fps) triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Auto,
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    /// Resolution scale, target bitrate and fps for the preset.
    #[must_use]
    pub fn parameters(self) -> (f64, u64, u32) {
        match self {
            Self::Low => (0.5, 1_000_000, 30),
            Self::Medium => (0.75, 2_500_000, 30),
            Self::High | Self::Auto => (1.0, 5_000_000, 60),
            Self::Ultra => (1.0, 12_000_000, 60),
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "ultra" => Ok(Self::Ultra),
            other => Err(TransportError::InvalidArgument(format!(
                "unknown quality preset '{other}'"
            ))),
        }
    }
}

/// Control request/response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlPayload {
    Pause,
    Resume,
    SetResolution { width: u32, height: u32 },
    SetBitrate { bps: u64 },
    SetQuality { preset: QualityPreset },
    SelectMonitor { id: u32 },
    RequestKeyframe,
    Ping,
    Pong { echo_seq: u64 },
    State {
        paused: bool,
        width: u32,
        height: u32,
        bitrate_bps: u64,
        fps: u32,
    },
    Error { message: String },
}

impl ControlPayload {
    /// Validate argument ranges before the payload is acted on.
    pub fn validate(&self) -> Result<(), TransportError> {
        match self {
            Self::SetResolution { width, height } => {
                let ok = (1..=16_384).contains(width) && (1..=16_384).contains(height);
                if ok {
                    Ok(())
                } else {
                    Err(TransportError::InvalidArgument(format!(
                        "resolution {width}x{height} out of range"
                    )))
                }
            }
            Self::SetBitrate { bps } => {
                if (100_000..=100_000_000).contains(bps) {
                    Ok(())
                } else {
                    Err(TransportError::InvalidArgument(format!(
                        "bitrate {bps} out of range 100000..=100000000"
                    )))
                }
            }
            _ => Ok(()),
        }
    }
}

/// One control message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    #[serde(flatten)]
    pub payload: ControlPayload,
    /// Monotonically increasing per sender.
    pub sequence: u64,
    /// Sender's local clock, microseconds.
    pub timestamp_us: i64,
    /// Sender peer id; checked against the channel binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

/// Bounded handoff of validated control messages to the session
/// supervisor.
///
/// The data-channel callback pushes without blocking; a full inbox drops
/// its oldest entry so a stalled consumer sees the newest requests
/// rather than an unbounded backlog.
pub struct ControlInbox {
    queue: Mutex<VecDeque<ControlMessage>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl ControlInbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(INBOX_DEPTH)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message, displacing the oldest when at capacity.
    pub fn push(&self, message: ControlMessage) {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.len() >= INBOX_DEPTH {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    /// Take the oldest queued message without waiting.
    pub fn try_recv(&self) -> Option<ControlMessage> {
        self.queue
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }

    /// Wait for the next message. Cancel-safe: a message is either
    /// returned or left queued.
    pub async fn recv(&self) -> ControlMessage {
        loop {
            if let Some(message) = self.try_recv() {
                return message;
            }
            self.notify.notified().await;
        }
    }

    /// Messages displaced by the drop-oldest policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for ControlInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-peer sliding-window rate limiter.
struct RateWindow {
    arrivals: VecDeque<i64>,
}

impl RateWindow {
    fn new() -> Self {
        Self {
            arrivals: VecDeque::with_capacity(RATE_LIMIT_PER_SEC + 1),
        }
    }

    fn allow(&mut self, now_us: i64) -> bool {
        while let Some(&front) = self.arrivals.front() {
            if now_us - front > 1_000_000 {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
        if self.arrivals.len() >= RATE_LIMIT_PER_SEC {
            return false;
        }
        self.arrivals.push_back(now_us);
        true
    }
}

/// Host-side control channel state: binding, sequencing, rate limiting
/// and RTT tracking. Transport-agnostic; the peer connection feeds it
/// decoded lines and sends what it returns.
pub struct ControlChannel {
    bound_peer: Mutex<Option<String>>,
    sequence: AtomicU64,
    window: Mutex<RateWindow>,
    /// Smoothed RTT in microseconds (f64 bits).
    rtt_us: AtomicU64,
    pending_pings: Mutex<HashMap<u64, i64>>,
}

impl ControlChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bound_peer: Mutex::new(None),
            sequence: AtomicU64::new(0),
            window: Mutex::new(RateWindow::new()),
            rtt_us: AtomicU64::new(0),
            pending_pings: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the channel to the one peer that completed the handshake with
    /// a valid session token. Until this is called, all inbound control
    /// traffic is dropped.
    pub fn bind_peer(&self, peer_id: &str) {
        let mut bound = self
            .bound_peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = bound.as_deref() {
            tracing::warn!(existing, new = peer_id, "Control channel rebinding peer");
        }
        *bound = Some(peer_id.to_owned());
    }

    #[must_use]
    pub fn bound_peer(&self) -> Option<String> {
        self.bound_peer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Build an outbound message with the next sequence number.
    pub fn compose(&self, payload: ControlPayload) -> ControlMessage {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        if matches!(payload, ControlPayload::Ping) {
            self.pending_pings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(sequence, clock::monotonic_us());
        }
        ControlMessage {
            payload,
            sequence,
            timestamp_us: clock::monotonic_us(),
            from: None,
        }
    }

    /// Serialize for the wire (newline-delimited JSON).
    pub fn encode(message: &ControlMessage) -> Result<String, TransportError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        Ok(line)
    }

    /// Process one inbound line.
    ///
    /// Returns the validated message for the supervisor to act on,
    /// `Ok(None)` when the message was consumed internally (Pong) or
    /// silently dropped (unbound channel, peer mismatch), and an error
    /// for malformed, invalid, or rate-limited input.
    pub fn accept(&self, line: &str) -> Result<Option<ControlMessage>, TransportError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        if line.len() > 64 * 1024 {
            return Err(TransportError::ProtocolError("control message too large".into()));
        }

        let message: ControlMessage = serde_json::from_str(line)
            .map_err(|e| TransportError::ProtocolError(format!("bad control JSON: {e}")))?;

        // Authorization: the sender must be the bound peer.
        let bound = self.bound_peer();
        let Some(bound) = bound else {
            tracing::warn!("Dropping control message on unbound channel");
            return Ok(None);
        };
        if let Some(from) = &message.from {
            if from != &bound {
                tracing::warn!(%from, %bound, "Dropping control message from unbound peer");
                return Ok(None);
            }
        }

        if !self
            .window
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .allow(clock::monotonic_us())
        {
            return Err(TransportError::RateLimited);
        }

        message.payload.validate()?;

        // Pong closes the RTT loop here; everything else goes up.
        if let ControlPayload::Pong { echo_seq } = message.payload {
            let sent = self
                .pending_pings
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&echo_seq);
            if let Some(sent_us) = sent {
                self.record_rtt(clock::monotonic_us() - sent_us);
            }
            return Ok(None);
        }

        Ok(Some(message))
    }

    /// The reply to send for an inbound Ping.
    #[must_use]
    pub fn pong_for(&self, ping: &ControlMessage) -> ControlMessage {
        self.compose(ControlPayload::Pong {
            echo_seq: ping.sequence,
        })
    }

    fn record_rtt(&self, sample_us: i64) {
        let sample = sample_us.max(0) as f64;
        let current = f64::from_bits(self.rtt_us.load(Ordering::Relaxed));
        let next = if current == 0.0 {
            sample
        } else {
            current * (1.0 - RTT_ALPHA) + sample * RTT_ALPHA
        };
        self.rtt_us.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Smoothed round-trip time in microseconds (0 until measured).
    #[must_use]
    pub fn rtt_us(&self) -> f64 {
        f64::from_bits(self.rtt_us.load(Ordering::Relaxed))
    }
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound_channel() -> ControlChannel {
        let channel = ControlChannel::new();
        channel.bind_peer("viewer-1");
        channel
    }

    fn line_from(payload: ControlPayload, from: Option<&str>) -> String {
        let msg = ControlMessage {
            payload,
            sequence: 1,
            timestamp_us: 0,
            from: from.map(str::to_owned),
        };
        ControlChannel::encode(&msg).unwrap()
    }

    #[test]
    fn wire_format_has_type_and_sequence() {
        let channel = bound_channel();
        let msg = channel.compose(ControlPayload::SetBitrate { bps: 2_000_000 });
        let line = ControlChannel::encode(&msg).unwrap();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"type\":\"set_bitrate\""));
        assert!(line.contains("\"sequence\":"));
        assert!(line.contains("\"bps\":2000000"));
    }

    #[test]
    fn accepts_bound_peer_only() {
        let channel = bound_channel();
        let ok = channel
            .accept(&line_from(ControlPayload::Pause, Some("viewer-1")))
            .unwrap();
        assert!(ok.is_some());

        let dropped = channel
            .accept(&line_from(ControlPayload::Pause, Some("intruder")))
            .unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn unbound_channel_drops_everything() {
        let channel = ControlChannel::new();
        let dropped = channel
            .accept(&line_from(ControlPayload::Pause, Some("viewer-1")))
            .unwrap();
        assert!(dropped.is_none());
    }

    #[test]
    fn resolution_bounds_enforced() {
        let channel = bound_channel();
        let err = channel
            .accept(&line_from(
                ControlPayload::SetResolution {
                    width: 16_385,
                    height: 1080,
                },
                Some("viewer-1"),
            ))
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidArgument(_)));
    }

    #[test]
    fn bitrate_bounds_enforced() {
        let channel = bound_channel();
        for bps in [99_999u64, 100_000_001] {
            let err = channel
                .accept(&line_from(
                    ControlPayload::SetBitrate { bps },
                    Some("viewer-1"),
                ))
                .unwrap_err();
            assert!(matches!(err, TransportError::InvalidArgument(_)));
        }
        assert!(channel
            .accept(&line_from(
                ControlPayload::SetBitrate { bps: 100_000 },
                Some("viewer-1"),
            ))
            .unwrap()
            .is_some());
    }

    #[test]
    fn rate_limit_kicks_in() {
        let channel = bound_channel();
        let mut limited = false;
        for _ in 0..20 {
            match channel.accept(&line_from(ControlPayload::Pause, Some("viewer-1"))) {
                Ok(_) => {}
                Err(TransportError::RateLimited) => {
                    limited = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(limited, "rate limiter never fired");
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let channel = bound_channel();
        let err = channel.accept("{nope").unwrap_err();
        assert!(matches!(err, TransportError::ProtocolError(_)));
    }

    #[test]
    fn ping_pong_updates_rtt() {
        let channel = bound_channel();
        let ping = channel.compose(ControlPayload::Ping);
        assert_eq!(channel.rtt_us(), 0.0);

        let pong = ControlMessage {
            payload: ControlPayload::Pong {
                echo_seq: ping.sequence,
            },
            sequence: 7,
            timestamp_us: 0,
            from: Some("viewer-1".into()),
        };
        let consumed = channel
            .accept(&ControlChannel::encode(&pong).unwrap())
            .unwrap();
        assert!(consumed.is_none());
        assert!(channel.rtt_us() >= 0.0);
        // The pending entry is gone; a replayed pong does nothing.
        let before = channel.rtt_us();
        channel
            .accept(&ControlChannel::encode(&pong).unwrap())
            .unwrap();
        assert_eq!(channel.rtt_us(), before);
    }

    #[test]
    fn inbox_drops_oldest_when_full() {
        let inbox = ControlInbox::new();
        for seq in 0..INBOX_DEPTH as u64 + 3 {
            inbox.push(ControlMessage {
                payload: ControlPayload::Pause,
                sequence: seq,
                timestamp_us: 0,
                from: None,
            });
        }
        assert_eq!(inbox.dropped(), 3);
        // The oldest survivor is sequence 3.
        assert_eq!(inbox.try_recv().unwrap().sequence, 3);
        let mut last = 3;
        while let Some(message) = inbox.try_recv() {
            assert!(message.sequence > last);
            last = message.sequence;
        }
        assert_eq!(last, INBOX_DEPTH as u64 + 2);
    }

    #[tokio::test]
    async fn inbox_recv_waits_for_push() {
        let inbox = std::sync::Arc::new(ControlInbox::new());
        let reader = std::sync::Arc::clone(&inbox);
        let task = tokio::spawn(async move { reader.recv().await });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        inbox.push(ControlMessage {
            payload: ControlPayload::RequestKeyframe,
            sequence: 9,
            timestamp_us: 0,
            from: None,
        });

        let received = task.await.unwrap();
        assert_eq!(received.sequence, 9);
    }

    #[test]
    fn quality_presets_map_to_parameters() {
        assert_eq!(QualityPreset::Low.parameters(), (0.5, 1_000_000, 30));
        assert_eq!(QualityPreset::Ultra.parameters(), (1.0, 12_000_000, 60));
        assert_eq!(
            "HIGH".parse::<QualityPreset>().unwrap(),
            QualityPreset::High
        );
        assert!("extreme".parse::<QualityPreset>().is_err());
    }
}
