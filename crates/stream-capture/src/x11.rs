//! X11 capture backend.
//!
//! Talks to the X server directly: MIT-SHM for zero-copy image transfer,
//! RandR for monitor enumeration, XFixes for the cursor sprite. The
//! capture loop runs on a dedicated worker thread with its own display
//! connection; frames are delivered to the installed sink.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use x11rb::connection::Connection;
use x11rb::protocol::randr::ConnectionExt as _;
use x11rb::protocol::shm::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::ConnectionExt as _;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};
use x11rb::rust_connection::RustConnection;

use crate::backend::{CaptureBackend, CaptureConfig, CaptureRegion, FrameSink};
use crate::clock;
use crate::error::CaptureError;
use crate::frame::{Monitor, PixelLayout, RawVideoFrame, MAX_BUFFER, MAX_DIMENSION};

/// Shared state between the backend handle and its capture worker.
struct WorkerShared {
    running: AtomicBool,
    config: Mutex<CaptureConfig>,
    /// Bumped on every `update_config` so the worker notices changes.
    config_epoch: AtomicU64,
    sink: Mutex<Option<FrameSink>>,
    /// f64 bits of the measured delivery rate.
    measured_fps: AtomicU64,
    resolution: Mutex<(u32, u32)>,
}

/// X11 capture backend (the "server" variant).
pub struct X11Backend {
    shared: Arc<WorkerShared>,
    worker: Option<std::thread::JoinHandle<()>>,
    initialized: bool,
}

impl X11Backend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                running: AtomicBool::new(false),
                config: Mutex::new(CaptureConfig::default()),
                config_epoch: AtomicU64::new(0),
                sink: Mutex::new(None),
                measured_fps: AtomicU64::new(0),
                resolution: Mutex::new((0, 0)),
            }),
            worker: None,
            initialized: false,
        }
    }

    fn lock_config(&self) -> CaptureConfig {
        self.shared
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Default for X11Backend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for X11Backend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureBackend for X11Backend {
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if config.fps == 0 {
            return Err(CaptureError::InvalidArgument("fps must be non-zero".into()));
        }

        // Probe the display and required extensions up front so start()
        // cannot fail late, and so the selected region's geometry is known.
        let session = X11Session::connect()?;
        let monitors = session.enumerate_monitors()?;
        let region = resolve_region(config.region, &monitors)?;
        check_region_size(region.2, region.3)?;

        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.clone();
        *self
            .shared
            .resolution
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = (region.2, region.3);
        self.initialized = true;

        tracing::info!(
            width = region.2,
            height = region.3,
            fps = config.fps,
            monitors = monitors.len(),
            "X11 capture initialized"
        );
        Ok(())
    }

    fn start(&mut self) -> Result<(), CaptureError> {
        if !self.initialized {
            return Err(CaptureError::NotInitialized);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name("x11-capture".into())
            .spawn(move || {
                if let Err(e) = capture_loop(&shared) {
                    tracing::error!("X11 capture worker exited with error: {e}");
                }
                shared.running.store(false, Ordering::SeqCst);
            })
            .map_err(CaptureError::SpawnThread)?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn capture_frame(&mut self) -> Result<RawVideoFrame, CaptureError> {
        if !self.initialized {
            return Err(CaptureError::NotInitialized);
        }
        let config = self.lock_config();
        let session = X11Session::connect()?;
        let monitors = session.enumerate_monitors()?;
        let region = resolve_region(config.region, &monitors)?;
        session.get_image_plain(region, config.show_cursor)
    }

    fn set_frame_sink(&mut self, sink: FrameSink) {
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    fn list_monitors(&mut self) -> Result<Vec<Monitor>, CaptureError> {
        X11Session::connect()?.enumerate_monitors()
    }

    fn current_resolution(&self) -> (u32, u32) {
        *self
            .shared
            .resolution
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn measured_fps(&self) -> f64 {
        f64::from_bits(self.shared.measured_fps.load(Ordering::Relaxed))
    }

    fn update_config(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if config.fps == 0 {
            return Err(CaptureError::InvalidArgument("fps must be non-zero".into()));
        }
        if let CaptureRegion::Rect { width, height, .. } = config.region {
            check_region_size(width, height)?;
        }
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.clone();
        self.shared.config_epoch.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "x11"
    }
}

/// Validate region dimensions before any allocation. The size math is
/// done in u64; a request that overflows or exceeds the buffer cap is an
/// argument error, not an allocation attempt.
fn check_region_size(width: u32, height: u32) -> Result<(), CaptureError> {
    if width == 0 || height == 0 {
        return Err(CaptureError::InvalidArgument("region has a zero dimension".into()));
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(CaptureError::InvalidArgument(format!(
            "region {width}x{height} exceeds {MAX_DIMENSION} per axis"
        )));
    }
    let size = u64::from(width) * u64::from(height) * 4;
    if size > MAX_BUFFER {
        return Err(CaptureError::InvalidArgument(format!(
            "region needs {size} bytes, limit is {MAX_BUFFER}"
        )));
    }
    Ok(())
}

/// Map a configured region onto current monitor geometry.
///
/// Returns `(x, y, width, height)`. A monitor id that no longer exists
/// falls back to the primary (hot-unplug semantics).
fn resolve_region(
    region: CaptureRegion,
    monitors: &[Monitor],
) -> Result<(i32, i32, u32, u32), CaptureError> {
    match region {
        CaptureRegion::Rect { x, y, width, height } => Ok((x, y, width, height)),
        CaptureRegion::Monitor(id) => {
            if let Some(m) = monitors.iter().find(|m| m.id == id) {
                return Ok((m.x, m.y, m.width, m.height));
            }
            let primary = monitors
                .iter()
                .find(|m| m.primary)
                .or_else(|| monitors.first())
                .ok_or(CaptureError::MonitorNotFound(id))?;
            tracing::warn!(
                requested = id,
                fallback = primary.id,
                "Selected monitor is gone, falling back to primary"
            );
            Ok((primary.x, primary.y, primary.width, primary.height))
        }
    }
}

/// One display connection plus the extension facts the worker needs.
struct X11Session {
    conn: RustConnection,
    screen: usize,
    root: u32,
}

impl X11Session {
    fn connect() -> Result<Self, CaptureError> {
        let (conn, screen) =
            x11rb::connect(None).map_err(|e| CaptureError::Connection(e.to_string()))?;
        let root = conn.setup().roots[screen].root;
        // XFixes must be version-negotiated before any of its requests;
        // failure just disables cursor capture.
        if let Ok(cookie) = conn.xfixes_query_version(5, 0) {
            let _ = cookie.reply();
        }
        Ok(Self { conn, screen, root })
    }

    /// Confirm MIT-SHM is usable on this server.
    fn require_shm(&self) -> Result<(), CaptureError> {
        let version = self
            .conn
            .shm_query_version()
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .reply()
            .map_err(|_| {
                CaptureError::CaptureFailure("X server does not support MIT-SHM".into())
            })?;
        tracing::debug!(
            major = version.major_version,
            minor = version.minor_version,
            "MIT-SHM available"
        );
        Ok(())
    }

    /// Enumerate monitors via RandR CRTCs.
    fn enumerate_monitors(&self) -> Result<Vec<Monitor>, CaptureError> {
        let resources = self
            .conn
            .randr_get_screen_resources_current(self.root)
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .reply()
            .map_err(|e| CaptureError::CaptureFailure(format!("RandR query failed: {e}")))?;

        let primary_output = self
            .conn
            .randr_get_output_primary(self.root)
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .reply()
            .map(|r| r.output)
            .unwrap_or(0);

        let mut monitors = Vec::new();
        for output in resources.outputs {
            let Ok(info) = self
                .conn
                .randr_get_output_info(output, 0)
                .map_err(|e| CaptureError::Connection(e.to_string()))?
                .reply()
            else {
                continue;
            };
            if info.connection != x11rb::protocol::randr::Connection::CONNECTED || info.crtc == 0 {
                continue;
            }
            let Ok(crtc) = self
                .conn
                .randr_get_crtc_info(info.crtc, 0)
                .map_err(|e| CaptureError::Connection(e.to_string()))?
                .reply()
            else {
                continue;
            };

            let refresh_mhz = resources
                .modes
                .iter()
                .find(|m| m.id == crtc.mode)
                .map(mode_refresh_mhz)
                .unwrap_or(0);

            #[allow(clippy::cast_possible_truncation)]
            monitors.push(Monitor {
                id: monitors.len() as u32,
                name: String::from_utf8_lossy(&info.name).into_owned(),
                x: i32::from(crtc.x),
                y: i32::from(crtc.y),
                width: u32::from(crtc.width),
                height: u32::from(crtc.height),
                refresh_mhz,
                primary: output == primary_output,
            });
        }

        if monitors.is_empty() {
            // Headless RandR setups still expose the root geometry.
            let screen = &self.conn.setup().roots[self.screen];
            monitors.push(Monitor {
                id: 0,
                name: "screen-0".into(),
                x: 0,
                y: 0,
                width: u32::from(screen.width_in_pixels),
                height: u32::from(screen.height_in_pixels),
                refresh_mhz: 0,
                primary: true,
            });
        }

        Ok(monitors)
    }

    /// One-shot capture without SHM, for pull-mode use.
    fn get_image_plain(
        &self,
        region: (i32, i32, u32, u32),
        show_cursor: bool,
    ) -> Result<RawVideoFrame, CaptureError> {
        let (x, y, width, height) = region;
        check_region_size(width, height)?;

        #[allow(clippy::cast_possible_truncation)]
        let reply = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                x as i16,
                y as i16,
                width as u16,
                height as u16,
                !0,
            )
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .reply()
            .map_err(|e| CaptureError::CaptureFailure(format!("GetImage failed: {e}")))?;

        let mut frame = RawVideoFrame {
            data: reply.data,
            width,
            height,
            stride: width * 4,
            layout: PixelLayout::Bgra,
            pts_us: clock::monotonic_us(),
            keyframe_hint: false,
        };
        frame.validate()?;
        if show_cursor {
            self.composite_cursor(&mut frame, x, y);
        }
        frame.ensure_alpha_opaque();
        Ok(frame)
    }

    /// Fetch the XFixes cursor image and blend it into the frame.
    fn composite_cursor(&self, frame: &mut RawVideoFrame, region_x: i32, region_y: i32) {
        let Ok(cookie) = self.conn.xfixes_get_cursor_image() else {
            return;
        };
        let Ok(cursor) = cookie.reply() else {
            return;
        };
        let cursor_x = i32::from(cursor.x) - i32::from(cursor.xhot) - region_x;
        let cursor_y = i32::from(cursor.y) - i32::from(cursor.yhot) - region_y;
        blend_cursor(
            frame,
            &cursor.cursor_image,
            u32::from(cursor.width),
            u32::from(cursor.height),
            cursor_x,
            cursor_y,
        );
    }
}

/// Refresh rate of a RandR mode in millihertz.
fn mode_refresh_mhz(mode: &x11rb::protocol::randr::ModeInfo) -> u32 {
    let denom = u64::from(mode.htotal) * u64::from(mode.vtotal);
    if denom == 0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation)]
    {
        (u64::from(mode.dot_clock) * 1000 / denom) as u32
    }
}

/// Alpha-blend an ARGB cursor sprite into a BGRA frame.
fn blend_cursor(
    frame: &mut RawVideoFrame,
    argb: &[u32],
    cursor_w: u32,
    cursor_h: u32,
    at_x: i32,
    at_y: i32,
) {
    let stride = frame.stride as usize;
    for row in 0..cursor_h {
        let dst_y = at_y + row as i32;
        if dst_y < 0 || dst_y as u32 >= frame.height {
            continue;
        }
        for col in 0..cursor_w {
            let dst_x = at_x + col as i32;
            if dst_x < 0 || dst_x as u32 >= frame.width {
                continue;
            }
            let Some(&pixel) = argb.get((row * cursor_w + col) as usize) else {
                return;
            };
            let a = (pixel >> 24) & 0xFF;
            if a == 0 {
                continue;
            }
            let (cr, cg, cb) = ((pixel >> 16) & 0xFF, (pixel >> 8) & 0xFF, pixel & 0xFF);
            let off = dst_y as usize * stride + dst_x as usize * 4;
            let Some(dst) = frame.data.get_mut(off..off + 4) else {
                return;
            };
            // Premultiplied source over destination.
            let inv = 255 - a;
            dst[0] = (cb + (u32::from(dst[0]) * inv) / 255).min(255) as u8;
            dst[1] = (cg + (u32::from(dst[1]) * inv) / 255).min(255) as u8;
            dst[2] = (cr + (u32::from(dst[2]) * inv) / 255).min(255) as u8;
            dst[3] = 0xFF;
        }
    }
}

/// SHM segment shared with the X server, created server-side and mapped
/// into this process.
struct ShmSegment {
    seg: u32,
    map: MappedSegment,
    size: usize,
}

/// Mapping of the fd handed back by `ShmCreateSegment`.
struct MappedSegment {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

// The mapping is created and read only on the capture worker thread.
unsafe impl Send for MappedSegment {}

impl MappedSegment {
    fn new(fd: std::os::fd::OwnedFd, len: usize) -> std::io::Result<Self> {
        use std::os::fd::AsRawFd;
        // SAFETY: mapping a freshly received fd of `len` bytes; the
        // result is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping stays valid for `len` bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.cast::<u8>(), self.len) }
    }
}

impl Drop for MappedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap.
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

impl ShmSegment {
    fn create(session: &X11Session, width: u32, height: u32) -> Result<Self, CaptureError> {
        check_region_size(width, height)?;
        #[allow(clippy::cast_possible_truncation)]
        let size = (u64::from(width) * u64::from(height) * 4) as usize;

        let seg = session
            .conn
            .generate_id()
            .map_err(|e| CaptureError::Connection(e.to_string()))?;
        let reply = shm::create_segment(&session.conn, seg, size as u32, false)
            .map_err(|e| CaptureError::Connection(e.to_string()))?
            .reply()
            .map_err(|e| CaptureError::CaptureFailure(format!("ShmCreateSegment failed: {e}")))?;

        let map = MappedSegment::new(reply.segment_fd, size)
            .map_err(|e| CaptureError::CaptureFailure(format!("mmap of SHM segment failed: {e}")))?;

        Ok(Self { seg, map, size })
    }

    fn detach(&self, session: &X11Session) {
        let _ = shm::detach(&session.conn, self.seg);
    }
}

/// The worker: paced SHM captures delivered to the sink.
fn capture_loop(shared: &Arc<WorkerShared>) -> Result<(), CaptureError> {
    let session = X11Session::connect()?;
    session.require_shm()?;

    let mut config = shared
        .config
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    let mut config_epoch = shared.config_epoch.load(Ordering::SeqCst);

    let mut monitors = session.enumerate_monitors()?;
    let mut region = resolve_region(config.region, &monitors)?;
    let mut segment = ShmSegment::create(&session, region.2, region.3)?;
    let mut pending_keyframe = true;

    let mut period = Duration::from_secs(1) / config.fps.max(1);
    let mut next_tick = Instant::now();
    let mut last_monitor_refresh = Instant::now();

    // Delivery-rate window.
    let mut window_start = Instant::now();
    let mut window_frames: u32 = 0;

    while shared.running.load(Ordering::SeqCst) {
        // Pick up config changes (fps, monitor switch, cursor toggle).
        let epoch = shared.config_epoch.load(Ordering::SeqCst);
        if epoch != config_epoch {
            config_epoch = epoch;
            config = shared
                .config
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone();
            period = Duration::from_secs(1) / config.fps.max(1);
            monitors = session.enumerate_monitors()?;
            let new_region = resolve_region(config.region, &monitors)?;
            if new_region.2 != region.2 || new_region.3 != region.3 {
                segment.detach(&session);
                segment = ShmSegment::create(&session, new_region.2, new_region.3)?;
            }
            region = new_region;
            pending_keyframe = true;
            *shared
                .resolution
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = (region.2, region.3);
        }

        // Periodic monitor refresh catches hot-unplug without an error.
        if last_monitor_refresh.elapsed() > Duration::from_secs(1) {
            last_monitor_refresh = Instant::now();
            if let Ok(fresh) = session.enumerate_monitors() {
                monitors = fresh;
                let resolved = resolve_region(config.region, &monitors)?;
                if resolved != region {
                    if resolved.2 != region.2 || resolved.3 != region.3 {
                        segment.detach(&session);
                        segment = ShmSegment::create(&session, resolved.2, resolved.3)?;
                    }
                    region = resolved;
                    pending_keyframe = true;
                    *shared
                        .resolution
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = (region.2, region.3);
                }
            }
        }

        let started = Instant::now();
        match shm_capture(&session, &segment, region, &config) {
            Ok(mut frame) => {
                frame.keyframe_hint = pending_keyframe;
                pending_keyframe = false;

                window_frames += 1;
                let elapsed = window_start.elapsed();
                if elapsed >= Duration::from_secs(1) {
                    let fps = f64::from(window_frames) / elapsed.as_secs_f64();
                    shared.measured_fps.store(fps.to_bits(), Ordering::Relaxed);
                    window_start = Instant::now();
                    window_frames = 0;
                }

                let sink = shared
                    .sink
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                if let Some(sink) = sink {
                    sink(frame);
                }
            }
            Err(e) => {
                // Transient: retry next tick. A stale region (hot-unplug)
                // is repaired by the periodic monitor refresh above.
                tracing::debug!("X11 capture tick failed, retrying: {e}");
            }
        }

        // Pacing: one tick per frame period; a capture that overran its
        // period forfeits the next tick instead of queueing a backlog.
        next_tick += period;
        if started.elapsed() > period {
            next_tick += period;
        }
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    segment.detach(&session);
    tracing::info!("X11 capture worker exiting");
    Ok(())
}

/// Issue one SHM image-get and wrap the pixels as a frame.
fn shm_capture(
    session: &X11Session,
    segment: &ShmSegment,
    region: (i32, i32, u32, u32),
    config: &CaptureConfig,
) -> Result<RawVideoFrame, CaptureError> {
    let (x, y, width, height) = region;

    #[allow(clippy::cast_possible_truncation)]
    session
        .conn
        .shm_get_image(
            session.root,
            x as i16,
            y as i16,
            width as u16,
            height as u16,
            !0,
            ImageFormat::Z_PIXMAP.into(),
            segment.seg,
            0,
        )
        .map_err(|e| CaptureError::Connection(e.to_string()))?
        .reply()
        .map_err(|e| CaptureError::CaptureFailure(format!("ShmGetImage failed: {e}")))?;

    let len = (u64::from(width) * u64::from(height) * 4) as usize;
    debug_assert!(len <= segment.size);
    let mut frame = RawVideoFrame {
        data: segment.map.as_slice()[..len].to_vec(),
        width,
        height,
        stride: width * 4,
        layout: PixelLayout::Bgra,
        pts_us: clock::monotonic_us(),
        keyframe_hint: false,
    };
    frame.validate()?;
    if config.show_cursor {
        session.composite_cursor(&mut frame, x, y);
    }
    frame.ensure_alpha_opaque();
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(id: u32, primary: bool) -> Monitor {
        Monitor {
            id,
            name: format!("out-{id}"),
            x: (id as i32) * 1920,
            y: 0,
            width: 1920,
            height: 1080,
            refresh_mhz: 60_000,
            primary,
        }
    }

    #[test]
    fn oversized_region_is_invalid_argument() {
        let err = check_region_size(MAX_DIMENSION + 1, 100).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument(_)));
        let err = check_region_size(100, MAX_DIMENSION + 1).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidArgument(_)));
    }

    #[test]
    fn max_dimension_region_fits_buffer_cap() {
        // 16384 x 8192 x 4 = 512 MiB exactly.
        assert!(check_region_size(MAX_DIMENSION, 8192).is_ok());
        assert!(check_region_size(MAX_DIMENSION, 8193).is_err());
    }

    #[test]
    fn missing_monitor_falls_back_to_primary() {
        let monitors = vec![monitor(0, true), monitor(1, false)];
        let region = resolve_region(CaptureRegion::Monitor(7), &monitors).unwrap();
        assert_eq!(region, (0, 0, 1920, 1080));
    }

    #[test]
    fn cursor_blend_is_clipped() {
        let mut frame = RawVideoFrame {
            data: vec![0u8; 4 * 4 * 4],
            width: 4,
            height: 4,
            stride: 16,
            layout: PixelLayout::Bgra,
            pts_us: 0,
            keyframe_hint: false,
        };
        // Fully opaque white 2x2 cursor hanging off the top-left corner.
        let argb = vec![0xFFFF_FFFFu32; 4];
        blend_cursor(&mut frame, &argb, 2, 2, -1, -1);
        // Only pixel (0,0) of the frame is covered.
        assert_eq!(&frame.data[0..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&frame.data[4..8], &[0, 0, 0, 0]);
    }
}
