//! Opus audio encoder.

use std::sync::Arc;
use std::time::Instant;

use audiopus::coder::Encoder as OpusEncoder;
use audiopus::{Application, Bitrate, Channels, SampleRate};
use bytes::Bytes;

use stream_capture::RawAudioFrame;

use crate::error::EncodeError;
use crate::stats::{EncoderStats, EncoderStatsSnapshot};
use crate::EncodedAudioFrame;

/// Legal Opus frame durations in microseconds.
const OPUS_FRAME_US: [i64; 6] = [2_500, 5_000, 10_000, 20_000, 40_000, 60_000];

/// Audio encoder configuration.
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz; 48 kHz canonical.
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_bps: u32,
    /// Frame duration in milliseconds; must map to a legal Opus size.
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate_bps: 128_000,
            frame_ms: 20,
        }
    }
}

/// Opus encoder for the system audio stream.
///
/// 48 kHz stereo VBR at complexity 5, `Application::Audio` (the desktop
/// mix is music-like, not voice). Bitrate is adjustable mid-stream.
pub struct OpusAudioEncoder {
    inner: OpusEncoder,
    config: AudioConfig,
    stats: Arc<EncoderStats>,
    scratch: Vec<u8>,
}

impl OpusAudioEncoder {
    pub fn new(config: &AudioConfig) -> Result<Self, EncodeError> {
        let sample_rate = match config.sample_rate {
            8000 => SampleRate::Hz8000,
            12_000 => SampleRate::Hz12000,
            16_000 => SampleRate::Hz16000,
            24_000 => SampleRate::Hz24000,
            48_000 => SampleRate::Hz48000,
            other => {
                return Err(EncodeError::InvalidArgument(format!(
                    "Opus does not support {other} Hz"
                )))
            }
        };
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => {
                return Err(EncodeError::InvalidArgument(format!(
                    "Opus encoder supports 1 or 2 channels, got {other}"
                )))
            }
        };
        if !OPUS_FRAME_US.contains(&(i64::from(config.frame_ms) * 1000)) {
            return Err(EncodeError::InvalidArgument(format!(
                "{} ms is not a legal Opus frame duration",
                config.frame_ms
            )));
        }

        let mut inner = OpusEncoder::new(sample_rate, channels, Application::Audio)?;
        inner.set_bitrate(Bitrate::BitsPerSecond(to_opus_bitrate(config.bitrate_bps)?))?;
        inner.set_vbr(true)?;
        inner.set_complexity(5)?;

        tracing::info!(
            sample_rate = config.sample_rate,
            channels = config.channels,
            bitrate = config.bitrate_bps,
            frame_ms = config.frame_ms,
            "Opus encoder initialized"
        );

        Ok(Self {
            inner,
            config: config.clone(),
            stats: EncoderStats::new(u64::from(config.bitrate_bps)),
            // Opus recommends up to ~4000 bytes per packet; 512 covers our
            // bitrates but leave headroom for VBR peaks.
            scratch: vec![0u8; 4000],
        })
    }

    /// Encode one PCM frame into one Opus packet.
    pub fn encode(&mut self, frame: &RawAudioFrame) -> Result<EncodedAudioFrame, EncodeError> {
        frame
            .validate()
            .map_err(|e| EncodeError::InvalidArgument(e.to_string()))?;

        if frame.sample_rate != self.config.sample_rate
            || frame.channels != self.config.channels
        {
            return Err(EncodeError::InvalidArgument(format!(
                "frame is {} Hz x{}, encoder expects {} Hz x{}",
                frame.sample_rate, frame.channels, self.config.sample_rate, self.config.channels
            )));
        }

        let duration_us = frame.duration_us();
        if !OPUS_FRAME_US.contains(&duration_us) {
            return Err(EncodeError::InvalidArgument(format!(
                "{duration_us} us is not a legal Opus frame duration"
            )));
        }

        let started = Instant::now();
        let len = self.inner.encode_float(&frame.samples, &mut self.scratch)?;
        #[allow(clippy::cast_possible_truncation)]
        let encode_us = started.elapsed().as_micros() as u64;
        self.stats.record_frame(len, encode_us);

        Ok(EncodedAudioFrame {
            data: Bytes::copy_from_slice(&self.scratch[..len]),
            pts_us: frame.pts_us,
            duration_us,
        })
    }

    /// Change the target bitrate; takes effect on the next packet.
    pub fn set_bitrate(&mut self, bitrate_bps: u32) -> Result<(), EncodeError> {
        self.inner
            .set_bitrate(Bitrate::BitsPerSecond(to_opus_bitrate(bitrate_bps)?))?;
        self.stats.set_target_bitrate(u64::from(bitrate_bps));
        Ok(())
    }

    #[must_use]
    pub fn stats(&self) -> EncoderStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }
}

fn to_opus_bitrate(bps: u32) -> Result<i32, EncodeError> {
    // libopus accepts 500 .. 512000 bits/s.
    let clamped = bps.clamp(500, 512_000);
    i32::try_from(clamped).map_err(|_| EncodeError::InvalidArgument("bitrate overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_frame(samples_per_channel: usize, channels: u16) -> RawAudioFrame {
        RawAudioFrame {
            samples: vec![0.0; samples_per_channel * usize::from(channels)],
            sample_rate: 48_000,
            channels,
            samples_per_channel,
            pts_us: 40_000,
        }
    }

    #[test]
    fn encodes_a_20ms_frame() {
        let mut enc = OpusAudioEncoder::new(&AudioConfig::default()).unwrap();
        let out = enc.encode(&pcm_frame(960, 2)).unwrap();
        assert!(!out.data.is_empty());
        assert_eq!(out.pts_us, 40_000);
        assert_eq!(out.duration_us, 20_000);
        assert_eq!(enc.stats().frames_encoded, 1);
    }

    #[test]
    fn rejects_illegal_frame_size() {
        let mut enc = OpusAudioEncoder::new(&AudioConfig::default()).unwrap();
        // 15 ms is not an Opus frame size.
        let err = enc.encode(&pcm_frame(720, 2)).unwrap_err();
        assert!(matches!(err, EncodeError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_illegal_config_frame_ms() {
        let config = AudioConfig {
            frame_ms: 15,
            ..AudioConfig::default()
        };
        assert!(OpusAudioEncoder::new(&config).is_err());
    }

    #[test]
    fn bitrate_change_applies() {
        let mut enc = OpusAudioEncoder::new(&AudioConfig::default()).unwrap();
        enc.set_bitrate(64_000).unwrap();
        assert_eq!(enc.stats().target_bitrate_bps, 64_000);
    }
}
