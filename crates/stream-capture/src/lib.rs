// Capture abstraction for streamlinux.
//
// Provides the CaptureBackend / AudioBackend traits and implementations:
// - x11.rs: X11 capture via MIT-SHM image requests + RandR monitors
// - portal.rs: ScreenCast portal via ashpd, frames from a PipeWire node
// - audio.rs: system-sink monitor capture (PipeWire, cpal fallback)
// - frame.rs: raw frame types, pixel layouts and hard limits

pub mod audio;
pub mod backend;
pub mod clock;
pub mod error;
pub mod frame;
pub mod portal;
pub mod x11;

pub use audio::{AudioBackend, AudioDevice, select_audio_backend};
pub use backend::{BackendChoice, CaptureBackend, CaptureConfig, CaptureRegion, FrameSink, select_backend};
pub use error::CaptureError;
pub use frame::{Monitor, PixelLayout, RawAudioFrame, RawVideoFrame};
