// Encoding abstraction for streamlinux.
//
// - video.rs: GStreamer-backed video encoder with hardware-first selection
// - audio.rs: Opus audio encoder
// - convert.rs: pixel layout conversion for the software path
// - stats.rs: shared encoder statistics counters

pub mod audio;
pub mod convert;
pub mod error;
pub mod stats;
pub mod video;

pub use audio::{AudioConfig, OpusAudioEncoder};
pub use error::EncodeError;
pub use stats::{EncoderStats, EncoderStatsSnapshot};
pub use video::{GstVideoEncoder, HwAccel, VideoCodec, VideoConfig, VideoEncoder};

use bytes::Bytes;

/// A compressed video frame.
///
/// Immutable after creation. `dts_us <= pts_us` always holds because the
/// encoders are configured without B-frames.
#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    pub data: Bytes,
    /// Presentation timestamp, monotonic microseconds.
    pub pts_us: i64,
    /// Decode timestamp, monotonic microseconds.
    pub dts_us: i64,
    /// Whether this frame is an IDR/keyframe.
    pub keyframe: bool,
}

/// A compressed audio frame.
#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    pub data: Bytes,
    /// Presentation timestamp, monotonic microseconds.
    pub pts_us: i64,
    /// Frame duration in microseconds.
    pub duration_us: i64,
}
