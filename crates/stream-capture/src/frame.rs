//! Raw frame types produced by the capture backends.
//!
//! All timestamps are microseconds on the host's monotonic clock
//! (`Instant`-anchored, arbitrary epoch). Frames are produced once by a
//! capture backend, handed to an encoder, and freed there.

/// Largest width or height any backend will accept, in pixels.
pub const MAX_DIMENSION: u32 = 16_384;

/// Largest raw frame buffer any backend will allocate or accept.
pub const MAX_BUFFER: u64 = 512 * 1024 * 1024;

/// Largest per-channel sample count accepted in one audio frame (1 s @ 48 kHz).
pub const MAX_FRAME_SAMPLES: usize = 48_000;

/// Largest channel count accepted in one audio frame.
pub const MAX_CHANNELS: u16 = 8;

/// Pixel layout of captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// BGRA with 8 bits per channel (X11 ZPixmap, `PipeWire` `BGRx` with
    /// alpha forced to 0xFF).
    Bgra,
    /// RGBA with 8 bits per channel.
    Rgba,
    /// Planar YUV 4:2:0 (8-bit), the common software-encoder input.
    I420,
    /// Semi-planar YUV 4:2:0 (8-bit), the common hardware-encoder input.
    Nv12,
}

impl PixelLayout {
    /// Bytes per pixel for packed layouts; `None` for planar layouts where
    /// a single per-pixel figure does not apply.
    #[must_use]
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            Self::Bgra | Self::Rgba => Some(4),
            Self::I420 | Self::Nv12 => None,
        }
    }

    /// Total buffer size for a frame of the given dimensions, in u64 so the
    /// multiplication cannot wrap on 32-bit targets.
    #[must_use]
    pub fn buffer_size(self, width: u32, height: u32) -> u64 {
        let pixels = u64::from(width) * u64::from(height);
        match self {
            Self::Bgra | Self::Rgba => pixels * 4,
            // 12 bits per pixel.
            Self::I420 | Self::Nv12 => pixels * 3 / 2,
        }
    }
}

/// A single captured video frame.
#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    /// Raw pixel data, top-to-bottom row order.
    pub data: Vec<u8>,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row stride in bytes (first plane for planar layouts).
    pub stride: u32,
    /// Pixel layout.
    pub layout: PixelLayout,
    /// Presentation timestamp, monotonic microseconds.
    pub pts_us: i64,
    /// Advisory: the encoder should emit a keyframe for this frame
    /// (set after a monitor switch or capture restart).
    pub keyframe_hint: bool,
}

impl RawVideoFrame {
    /// Validate the frame against its declared geometry and the hard
    /// capture limits. Backends call this before delivering a frame;
    /// consumers may rely on it having passed.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::ZeroDimension);
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(FrameError::DimensionExceeded {
                width: self.width,
                height: self.height,
            });
        }
        let min_len = u64::from(self.stride) * u64::from(self.height);
        if min_len > MAX_BUFFER {
            return Err(FrameError::BufferExceeded { len: min_len });
        }
        if (self.data.len() as u64) < min_len {
            return Err(FrameError::ShortBuffer {
                len: self.data.len(),
                need: min_len,
            });
        }
        Ok(())
    }

    /// Convert `BGRx`/`RGBx` padding bytes to opaque alpha.
    ///
    /// `PipeWire` and X11 both deliver 32-bit formats where the fourth byte
    /// is undefined padding.
    pub fn ensure_alpha_opaque(&mut self) {
        if matches!(self.layout, PixelLayout::Bgra | PixelLayout::Rgba) {
            for chunk in self.data.chunks_exact_mut(4) {
                chunk[3] = 0xFF;
            }
        }
    }
}

/// A frame of interleaved float PCM from the audio backend.
#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    /// Interleaved f32 samples, `samples_per_channel * channels` long.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Samples per channel in this frame.
    pub samples_per_channel: usize,
    /// Presentation timestamp, monotonic microseconds.
    pub pts_us: i64,
}

impl RawAudioFrame {
    /// Duration of this frame in microseconds.
    #[must_use]
    pub fn duration_us(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples_per_channel as i64) * 1_000_000 / i64::from(self.sample_rate)
    }

    /// Validate sample-count and channel limits and the interleaved length.
    ///
    /// Backends must reject non-conforming buffers before any copy; this is
    /// the check that closes the oversized-buffer class of bugs.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(FrameError::BadChannelCount(self.channels));
        }
        if self.samples_per_channel == 0 || self.samples_per_channel > MAX_FRAME_SAMPLES {
            return Err(FrameError::BadSampleCount(self.samples_per_channel));
        }
        let expect = self.samples_per_channel * usize::from(self.channels);
        if self.samples.len() != expect {
            return Err(FrameError::ShortBuffer {
                len: self.samples.len() * 4,
                need: (expect * 4) as u64,
            });
        }
        Ok(())
    }
}

/// A physical monitor reported by a capture backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Monitor {
    /// Backend-specific identifier (RandR CRTC index, portal stream index).
    pub id: u32,
    /// Human-readable name ("eDP-1", "Display 2").
    pub name: String,
    /// X origin in the virtual desktop.
    pub x: i32,
    /// Y origin in the virtual desktop.
    pub y: i32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Refresh rate in millihertz (0 when unknown).
    pub refresh_mhz: u32,
    /// Whether this is the primary monitor.
    pub primary: bool,
}

/// Frame validation failures.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame has a zero dimension")]
    ZeroDimension,

    #[error("frame dimensions {width}x{height} exceed limit {MAX_DIMENSION}")]
    DimensionExceeded { width: u32, height: u32 },

    #[error("frame buffer of {len} bytes exceeds limit {MAX_BUFFER}")]
    BufferExceeded { len: u64 },

    #[error("buffer is {len} bytes but geometry needs {need}")]
    ShortBuffer { len: usize, need: u64 },

    #[error("audio channel count {0} out of range 1..={MAX_CHANNELS}")]
    BadChannelCount(u16),

    #[error("audio sample count {0} out of range 1..={MAX_FRAME_SAMPLES}")]
    BadSampleCount(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bgra_frame(width: u32, height: u32) -> RawVideoFrame {
        RawVideoFrame {
            data: vec![0u8; (width * height * 4) as usize],
            width,
            height,
            stride: width * 4,
            layout: PixelLayout::Bgra,
            pts_us: 0,
            keyframe_hint: false,
        }
    }

    #[test]
    fn valid_frame_passes() {
        assert_eq!(bgra_frame(64, 64).validate(), Ok(()));
    }

    #[test]
    fn oversized_dimension_rejected() {
        let mut frame = bgra_frame(64, 64);
        frame.width = MAX_DIMENSION + 1;
        assert!(matches!(
            frame.validate(),
            Err(FrameError::DimensionExceeded { .. })
        ));
    }

    #[test]
    fn short_buffer_rejected() {
        let mut frame = bgra_frame(64, 64);
        frame.data.truncate(16);
        assert!(matches!(frame.validate(), Err(FrameError::ShortBuffer { .. })));
    }

    #[test]
    fn buffer_size_uses_wide_arithmetic() {
        // Would overflow u32: 16384 * 16384 * 4 = 2^30 * 4.
        let size = PixelLayout::Bgra.buffer_size(MAX_DIMENSION, MAX_DIMENSION);
        assert_eq!(size, u64::from(MAX_DIMENSION) * u64::from(MAX_DIMENSION) * 4);
    }

    #[test]
    fn alpha_forced_opaque() {
        let mut frame = bgra_frame(2, 1);
        frame.data.copy_from_slice(&[1, 2, 3, 0, 4, 5, 6, 7]);
        frame.ensure_alpha_opaque();
        assert_eq!(frame.data[3], 0xFF);
        assert_eq!(frame.data[7], 0xFF);
    }

    #[test]
    fn audio_frame_limits() {
        let good = RawAudioFrame {
            samples: vec![0.0; 960 * 2],
            sample_rate: 48_000,
            channels: 2,
            samples_per_channel: 960,
            pts_us: 0,
        };
        assert_eq!(good.validate(), Ok(()));
        assert_eq!(good.duration_us(), 20_000);

        let too_many_samples = RawAudioFrame {
            samples_per_channel: MAX_FRAME_SAMPLES + 1,
            ..good.clone()
        };
        assert!(matches!(
            too_many_samples.validate(),
            Err(FrameError::BadSampleCount(_))
        ));

        let too_many_channels = RawAudioFrame {
            channels: MAX_CHANNELS + 1,
            ..good
        };
        assert!(matches!(
            too_many_channels.validate(),
            Err(FrameError::BadChannelCount(_))
        ));
    }
}
