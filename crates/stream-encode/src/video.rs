//! GStreamer-backed video encoder.
//!
//! Raw frames go in through an appsrc, encoded access units come back out
//! of an appsink. Encoder elements are chosen hardware-first per codec and
//! tuned for low latency: no B-frames, zerolatency tune, ultrafast preset
//! where the element exposes those knobs.

use std::sync::Arc;
use std::time::Instant;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use bytes::Bytes;
use stream_capture::{PixelLayout, RawVideoFrame};

use crate::error::EncodeError;
use crate::stats::{EncoderStats, EncoderStatsSnapshot};
use crate::EncodedVideoFrame;

/// Video codec selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
}

impl VideoCodec {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = EncodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(Self::H264),
            "h265" | "hevc" => Ok(Self::H265),
            "vp8" => Ok(Self::Vp8),
            "vp9" => Ok(Self::Vp9),
            "av1" => Ok(Self::Av1),
            other => Err(EncodeError::InvalidArgument(format!(
                "unknown codec '{other}'"
            ))),
        }
    }
}

/// Hardware acceleration preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAccel {
    /// Hardware if present, else software.
    #[default]
    Auto,
    Vaapi,
    Nvenc,
    Software,
}

/// Video encoder configuration.
#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_bps: u64,
    pub codec: VideoCodec,
    pub hw_accel: HwAccel,
    /// Frames between keyframes (GOP length).
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_bps: 5_000_000,
            codec: VideoCodec::H264,
            hw_accel: HwAccel::Auto,
            keyframe_interval: 30,
        }
    }
}

/// A video encoder.
pub trait VideoEncoder: Send {
    /// Encode one raw frame. May return zero frames while the coder is
    /// priming and more than one after a flush.
    fn encode(&mut self, frame: RawVideoFrame) -> Result<Vec<EncodedVideoFrame>, EncodeError>;

    /// Drain any buffered output.
    fn flush(&mut self) -> Result<Vec<EncodedVideoFrame>, EncodeError>;

    /// Force the next encoded frame to be a keyframe.
    fn request_keyframe(&self);

    /// Live-update the target bitrate.
    fn set_bitrate(&self, bitrate_bps: u64);

    fn stats(&self) -> EncoderStatsSnapshot;
}

fn element_available(name: &str) -> bool {
    gst::ElementFactory::find(name).is_some()
}

fn hardware_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["vaapih264enc", "nvh264enc", "v4l2h264enc"],
        VideoCodec::H265 => &["vaapih265enc", "nvh265enc", "v4l2h265enc"],
        VideoCodec::Vp8 => &["vaapivp8enc"],
        VideoCodec::Vp9 => &["vaapivp9enc"],
        VideoCodec::Av1 => &["vaapiav1enc", "nvav1enc"],
    }
}

fn software_candidates(codec: VideoCodec) -> &'static [&'static str] {
    match codec {
        VideoCodec::H264 => &["x264enc", "openh264enc"],
        VideoCodec::H265 => &["x265enc"],
        VideoCodec::Vp8 => &["vp8enc"],
        VideoCodec::Vp9 => &["vp9enc"],
        VideoCodec::Av1 => &["svtav1enc", "av1enc", "rav1enc"],
    }
}

/// Parser element that produces aligned access units, if the codec has one.
fn parser_for(codec: VideoCodec) -> Option<&'static str> {
    match codec {
        VideoCodec::H264 => Some("h264parse"),
        VideoCodec::H265 => Some("h265parse"),
        VideoCodec::Av1 => Some("av1parse"),
        VideoCodec::Vp8 | VideoCodec::Vp9 => None,
    }
}

fn output_caps(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "video/x-h264,stream-format=(string)byte-stream,alignment=(string)au",
        VideoCodec::H265 => "video/x-h265,stream-format=(string)byte-stream,alignment=(string)au",
        VideoCodec::Vp8 => "video/x-vp8",
        VideoCodec::Vp9 => "video/x-vp9",
        VideoCodec::Av1 => "video/x-av1,stream-format=(string)obu-stream,alignment=(string)tu",
    }
}

/// Pick the encoder element honoring the acceleration preference.
fn select_encoder(codec: VideoCodec, hw: HwAccel) -> Result<&'static str, EncodeError> {
    let pick = |names: &'static [&'static str]| {
        names.iter().copied().find(|n| element_available(n))
    };

    let found = match hw {
        HwAccel::Auto => {
            pick(hardware_candidates(codec)).or_else(|| pick(software_candidates(codec)))
        }
        HwAccel::Vaapi => pick(hardware_candidates(codec))
            .filter(|n| n.starts_with("vaapi")),
        HwAccel::Nvenc => pick(hardware_candidates(codec)).filter(|n| n.starts_with("nv")),
        HwAccel::Software => pick(software_candidates(codec)),
    };

    found.ok_or_else(|| EncodeError::NotSupported(format!("{codec:?} with {hw:?}")))
}

/// Set a property only when the element exposes it; encoder elements
/// disagree wildly on knob names.
fn set_if_exists<V: ToValue>(element: &gst::Element, name: &str, value: V) {
    if element.has_property(name) {
        element.set_property(name, &value);
    }
}

/// Apply low-latency tuning appropriate to the chosen element.
fn tune_low_latency(encoder: &gst::Element, name: &str, config: &VideoConfig) {
    #[allow(clippy::cast_possible_truncation)]
    let bitrate_kbps = (config.bitrate_bps / 1000) as u32;
    let gop = config.keyframe_interval.max(1);

    set_if_exists(encoder, "bitrate", bitrate_kbps);
    set_if_exists(encoder, "target-bitrate", bitrate_kbps);
    set_if_exists(encoder, "keyframe-period", gop);
    #[allow(clippy::cast_possible_wrap)]
    set_if_exists(encoder, "key-int-max", gop as i32);

    if name.contains("x264") || name.contains("x265") {
        set_if_exists(encoder, "tune", "zerolatency");
        set_if_exists(encoder, "speed-preset", "ultrafast");
        set_if_exists(encoder, "bframes", 0i32);
    } else if name.contains("vaapi") {
        set_if_exists(encoder, "rate-control", "cbr");
        set_if_exists(encoder, "max-bframes", 0i32);
    } else if name.contains("nv") {
        set_if_exists(encoder, "preset", "low-latency-hq");
        set_if_exists(encoder, "bframes", 0i32);
        set_if_exists(encoder, "zerolatency", true);
    } else if name.contains("vp8") || name.contains("vp9") {
        // vpxenc bitrate is in bps, deadline 1 = realtime.
        #[allow(clippy::cast_possible_wrap)]
        set_if_exists(encoder, "target-bitrate", config.bitrate_bps as i32);
        set_if_exists(encoder, "deadline", 1i64);
        set_if_exists(encoder, "lag-in-frames", 0i32);
    } else if name.contains("svtav1") {
        set_if_exists(encoder, "preset", 8i32);
    }
}

fn gst_format(layout: PixelLayout) -> &'static str {
    match layout {
        PixelLayout::Bgra => "BGRA",
        PixelLayout::Rgba => "RGBA",
        PixelLayout::I420 => "I420",
        PixelLayout::Nv12 => "NV12",
    }
}

/// GStreamer encoder pipeline: appsrc → convert/scale → encoder → appsink.
pub struct GstVideoEncoder {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
    encoder: gst::Element,
    encoder_name: &'static str,
    config: VideoConfig,
    input_layout: PixelLayout,
    stats: Arc<EncoderStats>,
    /// Last PTS accepted, to keep output monotonic even if capture hiccups.
    last_pts_us: i64,
}

impl GstVideoEncoder {
    /// Build the pipeline for the given config and input layout.
    pub fn new(config: &VideoConfig, input_layout: PixelLayout) -> Result<Self, EncodeError> {
        if config.width == 0 || config.height == 0 || config.fps == 0 {
            return Err(EncodeError::InvalidArgument(
                "width, height and fps must be non-zero".into(),
            ));
        }

        gst::init()?;

        let encoder_name = select_encoder(config.codec, config.hw_accel)?;
        let parser = parser_for(config.codec);

        let parser_str = match parser {
            Some(p) if element_available(p) => format!(" ! {p} config-interval=-1"),
            Some(p) => {
                return Err(EncodeError::NotSupported(format!(
                    "missing parser element {p}"
                )))
            }
            None => String::new(),
        };

        let pipeline_str = format!(
            "appsrc name=src is-live=true format=time ! \
             videoconvert ! videoscale ! \
             video/x-raw,width={},height={},framerate={}/1 ! \
             queue max-size-buffers=2 leaky=downstream ! \
             {} name=encoder{} ! {} ! \
             appsink name=sink max-buffers=4 drop=false sync=false",
            config.width,
            config.height,
            config.fps,
            encoder_name,
            parser_str,
            output_caps(config.codec),
        );

        tracing::debug!(pipeline = %pipeline_str, "Creating encoder pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| EncodeError::Gstreamer("failed to downcast pipeline".into()))?;

        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| EncodeError::Gstreamer("appsrc not found".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| EncodeError::Gstreamer("appsrc type mismatch".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| EncodeError::Gstreamer("appsink not found".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| EncodeError::Gstreamer("appsink type mismatch".into()))?;

        let encoder = pipeline
            .by_name("encoder")
            .ok_or_else(|| EncodeError::Gstreamer("encoder element not found".into()))?;

        tune_low_latency(&encoder, encoder_name, config);

        let caps = gst::Caps::builder("video/x-raw")
            .field("format", gst_format(input_layout))
            .field("width", i32::try_from(config.width).unwrap_or(i32::MAX))
            .field("height", i32::try_from(config.height).unwrap_or(i32::MAX))
            .field("framerate", gst::Fraction::new(
                i32::try_from(config.fps).unwrap_or(30),
                1,
            ))
            .build();
        appsrc.set_caps(Some(&caps));

        pipeline.set_state(gst::State::Playing)?;

        tracing::info!(
            encoder = encoder_name,
            codec = config.codec.as_str(),
            width = config.width,
            height = config.height,
            fps = config.fps,
            bitrate = config.bitrate_bps,
            "Video encoder initialized"
        );

        Ok(Self {
            pipeline,
            appsrc,
            appsink,
            encoder,
            encoder_name,
            config: config.clone(),
            input_layout,
            stats: EncoderStats::new(config.bitrate_bps),
            last_pts_us: -1,
        })
    }

    /// Name of the selected encoder element.
    #[must_use]
    pub fn encoder_type(&self) -> &'static str {
        self.encoder_name
    }

    fn pull_available(&self, out: &mut Vec<EncodedVideoFrame>) {
        while let Some(sample) = self.appsink.try_pull_sample(gst::ClockTime::ZERO) {
            if let Some(frame) = sample_to_frame(&sample) {
                out.push(frame);
            }
        }
    }
}

/// Map one appsink sample to an [`EncodedVideoFrame`].
fn sample_to_frame(sample: &gst::Sample) -> Option<EncodedVideoFrame> {
    let buffer = sample.buffer()?;
    let map = buffer.map_readable().ok()?;

    #[allow(clippy::cast_possible_wrap)]
    let pts_us = buffer.pts().map_or(0, |t| t.useconds() as i64);
    #[allow(clippy::cast_possible_wrap)]
    let dts_us = buffer.dts().map_or(pts_us, |t| t.useconds() as i64);
    let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);

    Some(EncodedVideoFrame {
        data: Bytes::copy_from_slice(map.as_slice()),
        pts_us,
        // No B-frames: decode order equals presentation order.
        dts_us: dts_us.min(pts_us),
        keyframe,
    })
}

impl VideoEncoder for GstVideoEncoder {
    fn encode(&mut self, frame: RawVideoFrame) -> Result<Vec<EncodedVideoFrame>, EncodeError> {
        frame
            .validate()
            .map_err(|e| EncodeError::InvalidArgument(e.to_string()))?;

        if frame.layout != self.input_layout {
            return Err(EncodeError::InvalidArgument(format!(
                "frame layout {:?} does not match encoder input {:?}",
                frame.layout, self.input_layout
            )));
        }

        if frame.keyframe_hint {
            self.request_keyframe();
        }

        // PTS must be monotonic into the coder.
        let pts_us = frame.pts_us.max(self.last_pts_us + 1);
        self.last_pts_us = pts_us;

        let started = Instant::now();

        let mut buffer = gst::Buffer::from_mut_slice(frame.data);
        {
            let buffer = buffer.get_mut().expect("freshly created buffer is unique");
            #[allow(clippy::cast_sign_loss)]
            buffer.set_pts(gst::ClockTime::from_useconds(pts_us.max(0) as u64));
        }

        self.appsrc
            .push_buffer(buffer)
            .map_err(|e| EncodeError::EncoderFailure(format!("appsrc push failed: {e:?}")))?;

        let mut out = Vec::new();
        self.pull_available(&mut out);

        #[allow(clippy::cast_possible_truncation)]
        let encode_us = started.elapsed().as_micros() as u64;
        for f in &out {
            self.stats.record_frame(f.data.len(), encode_us);
        }

        Ok(out)
    }

    fn flush(&mut self) -> Result<Vec<EncodedVideoFrame>, EncodeError> {
        let _ = self.appsrc.end_of_stream();

        // Wait for EOS to propagate so the coder drains.
        if let Some(bus) = self.pipeline.bus() {
            let _ = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(2),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
        }

        let mut out = Vec::new();
        self.pull_available(&mut out);
        Ok(out)
    }

    fn request_keyframe(&self) {
        let event = gst_video::UpstreamForceKeyUnitEvent::builder()
            .all_headers(true)
            .build();
        if !self.encoder.send_event(event) {
            tracing::debug!("Force-keyframe event was not handled");
        }
    }

    fn set_bitrate(&self, bitrate_bps: u64) {
        #[allow(clippy::cast_possible_truncation)]
        let kbps = (bitrate_bps / 1000) as u32;
        set_if_exists(&self.encoder, "bitrate", kbps);
        #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
        if self.encoder_name.contains("vp8") || self.encoder_name.contains("vp9") {
            set_if_exists(&self.encoder, "target-bitrate", bitrate_bps as i32);
        }
        self.stats.set_target_bitrate(bitrate_bps);
        tracing::debug!(bitrate_bps, "Encoder bitrate updated");
    }

    fn stats(&self) -> EncoderStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Drop for GstVideoEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

// Keep the config around for reinitialization decisions by the owner.
impl GstVideoEncoder {
    #[must_use]
    pub fn config(&self) -> &VideoConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_parses_from_cli_names() {
        assert_eq!("h264".parse::<VideoCodec>().unwrap(), VideoCodec::H264);
        assert_eq!("hevc".parse::<VideoCodec>().unwrap(), VideoCodec::H265);
        assert_eq!("AV1".parse::<VideoCodec>().unwrap(), VideoCodec::Av1);
        assert!("mpeg2".parse::<VideoCodec>().is_err());
    }

    #[test]
    fn parser_only_for_parsed_codecs() {
        assert_eq!(parser_for(VideoCodec::H264), Some("h264parse"));
        assert_eq!(parser_for(VideoCodec::Vp8), None);
    }

    #[test]
    fn zero_config_rejected() {
        let config = VideoConfig {
            width: 0,
            ..VideoConfig::default()
        };
        assert!(matches!(
            GstVideoEncoder::new(&config, PixelLayout::Bgra),
            Err(EncodeError::InvalidArgument(_))
        ));
    }
}
