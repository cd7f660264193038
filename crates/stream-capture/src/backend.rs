//! Capture backend trait and display-server selection.

use std::env;
use std::sync::Arc;

use crate::error::CaptureError;
use crate::frame::{Monitor, PixelLayout, RawVideoFrame};
use crate::portal::PortalBackend;
use crate::x11::X11Backend;

/// Region to capture: a whole monitor or an absolute rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRegion {
    /// A monitor by backend id.
    Monitor(u32),
    /// An absolute rectangle in virtual-desktop coordinates.
    Rect { x: i32, y: i32, width: u32, height: u32 },
}

/// Capture configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub region: CaptureRegion,
    /// Target frames per second.
    pub fps: u32,
    /// Composite the cursor into captured frames.
    pub show_cursor: bool,
    /// Layout the consumer prefers; backends deliver it when they can.
    pub preferred_layout: PixelLayout,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            region: CaptureRegion::Monitor(0),
            fps: 30,
            show_cursor: true,
            preferred_layout: PixelLayout::Bgra,
        }
    }
}

/// Destination for captured frames. Delivery must not block: a sink that
/// cannot keep up drops the frame.
pub type FrameSink = Arc<dyn Fn(RawVideoFrame) + Send + Sync>;

/// A screen capture backend.
///
/// `initialize` must be called before `start`. Frames are pushed to the
/// sink installed with `set_frame_sink`; `capture_frame` is the pull
/// variant for one-shot use (`--list-monitors` screenshots, tests).
pub trait CaptureBackend: Send {
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self);

    /// Capture a single frame synchronously.
    fn capture_frame(&mut self) -> Result<RawVideoFrame, CaptureError>;

    /// Install the sink that the capture worker delivers frames to.
    fn set_frame_sink(&mut self, sink: FrameSink);

    fn list_monitors(&mut self) -> Result<Vec<Monitor>, CaptureError>;

    /// Resolution of the currently selected region.
    fn current_resolution(&self) -> (u32, u32);

    /// Frames actually delivered per second, measured over the last second.
    fn measured_fps(&self) -> f64;

    /// Apply a new configuration to a running backend (monitor switch,
    /// fps change). The first frame after a region change carries a
    /// keyframe hint.
    fn update_config(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Name for logs ("x11", "portal").
    fn name(&self) -> &'static str;
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Probe the environment.
    #[default]
    Auto,
    /// X11 server capture.
    Server,
    /// Portal + PipeWire capture.
    Compositor,
}

fn has_x11_display() -> bool {
    env::var_os("DISPLAY").is_some()
}

fn has_wayland_display() -> bool {
    env::var_os("WAYLAND_DISPLAY").is_some()
}

fn session_type() -> Option<String> {
    env::var("XDG_SESSION_TYPE").ok().map(|v| v.to_ascii_lowercase())
}

/// Resolve which backend to construct, without touching the display.
///
/// Priority: explicit choice, then `XDG_SESSION_TYPE`, then socket env
/// vars (`WAYLAND_DISPLAY` before `DISPLAY` when both are present and the
/// session type is unknown).
pub fn resolve_backend(choice: BackendChoice) -> Result<BackendChoice, CaptureError> {
    match choice {
        BackendChoice::Server | BackendChoice::Compositor => return Ok(choice),
        BackendChoice::Auto => {}
    }

    let wayland = has_wayland_display();
    let x11 = has_x11_display();

    match session_type().as_deref() {
        Some("wayland") if wayland => return Ok(BackendChoice::Compositor),
        Some("x11") if x11 => return Ok(BackendChoice::Server),
        _ => {}
    }

    if wayland {
        Ok(BackendChoice::Compositor)
    } else if x11 {
        Ok(BackendChoice::Server)
    } else {
        Err(CaptureError::BackendUnavailable)
    }
}

/// Construct the capture backend for the current environment.
pub fn select_backend(choice: BackendChoice) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    let resolved = resolve_backend(choice)?;
    tracing::info!(backend = ?resolved, "Selected capture backend");
    match resolved {
        BackendChoice::Server => Ok(Box::new(X11Backend::new())),
        BackendChoice::Compositor => Ok(Box::new(PortalBackend::new())),
        BackendChoice::Auto => unreachable!("resolve_backend never returns Auto"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_choice_wins() {
        assert_eq!(
            resolve_backend(BackendChoice::Server).unwrap(),
            BackendChoice::Server
        );
        assert_eq!(
            resolve_backend(BackendChoice::Compositor).unwrap(),
            BackendChoice::Compositor
        );
    }
}
