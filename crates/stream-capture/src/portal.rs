//! Portal capture backend.
//!
//! Obtains screen access through the XDG Desktop ScreenCast portal
//! (ashpd), then consumes the video node the portal exposes over
//! `PipeWire`. The portal dialog may block until the user answers, so the
//! whole negotiation runs on the capture worker and is cancellable
//! through the shared running flag.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::PersistMode;
use pipewire as pw;
use pw::properties::properties;
use pw::stream::{Stream, StreamFlags};

use crate::backend::{CaptureBackend, CaptureConfig, CaptureRegion, FrameSink};
use crate::clock;
use crate::error::CaptureError;
use crate::frame::{Monitor, PixelLayout, RawVideoFrame, MAX_BUFFER, MAX_DIMENSION};

/// Callback used to persist the portal restore token between runs.
pub type RestoreTokenSink = Arc<dyn Fn(&str) + Send + Sync>;

struct PortalShared {
    running: AtomicBool,
    config: Mutex<CaptureConfig>,
    sink: Mutex<Option<FrameSink>>,
    measured_fps: AtomicU64,
    resolution: Mutex<(u32, u32)>,
    /// Set when the worker has failed fatally (permission denied).
    fatal: Mutex<Option<String>>,
}

/// ScreenCast portal + `PipeWire` capture backend (the "compositor"
/// variant).
pub struct PortalBackend {
    shared: Arc<PortalShared>,
    worker: Option<std::thread::JoinHandle<()>>,
    restore_token: Option<String>,
    token_sink: Option<RestoreTokenSink>,
    initialized: bool,
}

impl PortalBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PortalShared {
                running: AtomicBool::new(false),
                config: Mutex::new(CaptureConfig::default()),
                sink: Mutex::new(None),
                measured_fps: AtomicU64::new(0),
                resolution: Mutex::new((0, 0)),
                fatal: Mutex::new(None),
            }),
            worker: None,
            restore_token: None,
            token_sink: None,
            initialized: false,
        }
    }

    /// Provide a previously saved restore token so the permission dialog
    /// is skipped, and a sink that receives the fresh token after start.
    pub fn with_restore_token(
        mut self,
        token: Option<String>,
        sink: Option<RestoreTokenSink>,
    ) -> Self {
        self.restore_token = token;
        self.token_sink = sink;
        self
    }

    /// A fatal error reported by the worker (portal permission denied).
    pub fn take_fatal(&self) -> Option<String> {
        self.shared
            .fatal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

impl Default for PortalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PortalBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl CaptureBackend for PortalBackend {
    fn initialize(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        if config.fps == 0 {
            return Err(CaptureError::InvalidArgument("fps must be non-zero".into()));
        }
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.clone();
        self.initialized = true;
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
        let restore_token = self.restore_token.clone();
        let token_sink = self.token_sink.clone();

        let worker = std::thread::Builder::new()
            .name("portal-capture".into())
            .spawn(move || {
                if let Err(e) = portal_worker(&shared, restore_token, token_sink) {
                    tracing::error!("Portal capture worker exited with error: {e}");
                    if matches!(e, CaptureError::PermissionDenied) {
                        *shared
                            .fatal
                            .lock()
                            .unwrap_or_else(std::sync::PoisonError::into_inner) =
                            Some(e.to_string());
                    }
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
        // The portal only delivers frames through its stream callbacks;
        // pull-mode capture is not part of this backend.
        Err(CaptureError::CaptureFailure(
            "portal backend is push-only; install a frame sink".into(),
        ))
    }

    fn set_frame_sink(&mut self, sink: FrameSink) {
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    fn list_monitors(&mut self) -> Result<Vec<Monitor>, CaptureError> {
        let token = self.restore_token.clone();
        enumerate_portal_monitors(token)
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
        // Monitor selection is fixed by the portal dialog; only pacing and
        // cursor settings can change at runtime.
        if let CaptureRegion::Rect { .. } = config.region {
            return Err(CaptureError::InvalidArgument(
                "portal backend cannot capture arbitrary rectangles".into(),
            ));
        }
        *self
            .shared
            .config
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = config.clone();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "portal"
    }
}

/// Result of the portal negotiation: the PipeWire remote fd and the video
/// node to consume.
struct PortalGrant {
    fd: OwnedFd,
    node_id: u32,
    width: u32,
    height: u32,
    restore_token: Option<String>,
}

/// Run the ScreenCast portal dance to completion or cancellation.
async fn negotiate_portal(
    show_cursor: bool,
    restore_token: Option<String>,
) -> Result<PortalGrant, CaptureError> {
    let portal_err = |e: ashpd::Error| CaptureError::Connection(format!("portal: {e}"));

    let proxy = Screencast::new().await.map_err(portal_err)?;
    let session = proxy.create_session().await.map_err(portal_err)?;

    let cursor_mode = if show_cursor {
        CursorMode::Embedded
    } else {
        CursorMode::Hidden
    };

    proxy
        .select_sources(
            &session,
            cursor_mode,
            SourceType::Monitor.into(),
            false,
            restore_token.as_deref(),
            PersistMode::ExplicitlyRevoked,
        )
        .await
        .map_err(portal_err)?;

    // Blocks until the user answers the dialog.
    let response = proxy
        .start(&session, None)
        .await
        .map_err(portal_err)?
        .response()
        .map_err(|_| CaptureError::PermissionDenied)?;

    let stream = response
        .streams()
        .first()
        .ok_or(CaptureError::PermissionDenied)?;
    let node_id = stream.pipe_wire_node_id();
    let (width, height) = stream.size().unwrap_or((0, 0));

    let fd = proxy
        .open_pipe_wire_remote(&session)
        .await
        .map_err(portal_err)?;

    #[allow(clippy::cast_sign_loss)]
    let (width, height) = (width.max(0) as u32, height.max(0) as u32);

    Ok(PortalGrant {
        fd,
        node_id,
        width,
        height,
        restore_token: response.restore_token().map(str::to_owned),
    })
}

/// Enumerate monitors by opening a throwaway portal session.
fn enumerate_portal_monitors(
    restore_token: Option<String>,
) -> Result<Vec<Monitor>, CaptureError> {
    let join = std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CaptureError::Connection(format!("runtime: {e}")))?;
        runtime.block_on(async {
            let portal_err = |e: ashpd::Error| CaptureError::Connection(format!("portal: {e}"));
            let proxy = Screencast::new().await.map_err(portal_err)?;
            let session = proxy.create_session().await.map_err(portal_err)?;
            proxy
                .select_sources(
                    &session,
                    CursorMode::Hidden,
                    SourceType::Monitor.into(),
                    true,
                    restore_token.as_deref(),
                    PersistMode::ExplicitlyRevoked,
                )
                .await
                .map_err(portal_err)?;
            let response = proxy
                .start(&session, None)
                .await
                .map_err(portal_err)?
                .response()
                .map_err(|_| CaptureError::PermissionDenied)?;

            let mut monitors = Vec::new();
            for stream in response.streams() {
                let (width, height) = stream.size().unwrap_or((0, 0));
                let (x, y) = stream.position().unwrap_or((0, 0));
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                monitors.push(Monitor {
                    id: monitors.len() as u32,
                    name: stream
                        .id()
                        .filter(|id| !id.trim().is_empty())
                        .map(str::to_owned)
                        .unwrap_or_else(|| format!("Display {}", monitors.len())),
                    x,
                    y,
                    width: width.max(0) as u32,
                    height: height.max(0) as u32,
                    refresh_mhz: 0,
                    primary: monitors.is_empty(),
                });
            }
            Ok(monitors)
        })
    });
    join.join()
        .map_err(|_| CaptureError::CaptureFailure("portal monitor probe thread panicked".into()))?
}

/// Worker: portal negotiation then the `PipeWire` stream loop.
fn portal_worker(
    shared: &Arc<PortalShared>,
    restore_token: Option<String>,
    token_sink: Option<RestoreTokenSink>,
) -> Result<(), CaptureError> {
    let show_cursor = shared
        .config
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .show_cursor;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CaptureError::Connection(format!("runtime: {e}")))?;

    // The permission dialog can sit unanswered forever; poll the running
    // flag so stop() cancels the negotiation.
    let running = || shared.running.load(Ordering::SeqCst);
    let grant = runtime.block_on(async {
        let negotiate = negotiate_portal(show_cursor, restore_token);
        tokio::pin!(negotiate);
        loop {
            tokio::select! {
                result = &mut negotiate => return result,
                () = tokio::time::sleep(Duration::from_millis(100)) => {
                    if !running() {
                        return Err(CaptureError::Timeout);
                    }
                }
            }
        }
    })?;
    drop(runtime);

    if let (Some(sink), Some(token)) = (&token_sink, &grant.restore_token) {
        sink(token);
    }

    *shared
        .resolution
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = (grant.width, grant.height);

    tracing::info!(
        node_id = grant.node_id,
        width = grant.width,
        height = grant.height,
        "Portal session granted, joining PipeWire stream"
    );

    run_video_loop(shared, grant)
}

/// Per-stream state owned by the `PipeWire` callbacks.
struct StreamData {
    shared: Arc<PortalShared>,
    format: pw::spa::param::video::VideoInfoRaw,
    have_format: bool,
    window_start: std::time::Instant,
    window_frames: u32,
}

/// Run the `PipeWire` main loop consuming the granted video node.
fn run_video_loop(shared: &Arc<PortalShared>, grant: PortalGrant) -> Result<(), CaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None).map_err(|_| CaptureError::Connection("failed to create PipeWire main loop".into()))?;
    let context = pw::context::Context::new(&mainloop)
        .map_err(|_| CaptureError::Connection("failed to create PipeWire context".into()))?;
    let core = context
        .connect_fd(grant.fd, None)
        .map_err(|_| CaptureError::Connection("failed to connect PipeWire remote".into()))?;

    let stream = Stream::new(
        &core,
        "streamlinux-video",
        properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|_| CaptureError::Connection("failed to create PipeWire stream".into()))?;

    let data = StreamData {
        shared: Arc::clone(shared),
        format: pw::spa::param::video::VideoInfoRaw::new(),
        have_format: false,
        window_start: std::time::Instant::now(),
        window_frames: 0,
    };

    let _listener = stream
        .add_local_listener_with_user_data(data)
        .state_changed(|_stream, _data, old, new| {
            tracing::debug!("PipeWire video stream state: {old:?} -> {new:?}");
        })
        .param_changed(|_stream, data, id, param| {
            if id != pw::spa::param::ParamType::Format.as_raw() {
                return;
            }
            let Some(param) = param else {
                return;
            };
            let Ok((media_type, media_subtype)) =
                pw::spa::param::format_utils::parse_format(param)
            else {
                return;
            };
            if media_type != pw::spa::param::format::MediaType::Video
                || media_subtype != pw::spa::param::format::MediaSubtype::Raw
            {
                return;
            }
            if data.format.parse(param).is_ok() {
                data.have_format = true;
                let size = data.format.size();
                tracing::info!(
                    format = ?data.format.format(),
                    width = size.width,
                    height = size.height,
                    "PipeWire video format negotiated"
                );
                *data
                    .shared
                    .resolution
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) =
                    (size.width, size.height);
            }
        })
        .process(|stream_ref, data| {
            process_video(stream_ref, data);
        })
        .register()
        .map_err(|_| CaptureError::Connection("failed to register stream listener".into()))?;

    // Offer the packed 32-bit formats we can wrap without conversion.
    let obj = pw::spa::pod::object!(
        pw::spa::utils::SpaTypes::ObjectParamFormat,
        pw::spa::param::ParamType::EnumFormat,
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaType,
            Id,
            pw::spa::param::format::MediaType::Video
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::MediaSubtype,
            Id,
            pw::spa::param::format::MediaSubtype::Raw
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            pw::spa::param::video::VideoFormat::BGRx,
            pw::spa::param::video::VideoFormat::BGRx,
            pw::spa::param::video::VideoFormat::BGRA,
            pw::spa::param::video::VideoFormat::RGBx,
            pw::spa::param::video::VideoFormat::RGBA
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            pw::spa::utils::Rectangle { width: 1920, height: 1080 },
            pw::spa::utils::Rectangle { width: 1, height: 1 },
            pw::spa::utils::Rectangle { width: MAX_DIMENSION, height: MAX_DIMENSION }
        ),
        pw::spa::pod::property!(
            pw::spa::param::format::FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            pw::spa::utils::Fraction { num: 30, denom: 1 },
            pw::spa::utils::Fraction { num: 0, denom: 1 },
            pw::spa::utils::Fraction { num: 240, denom: 1 }
        ),
    );
    let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(obj),
    )
    .map_err(|_| CaptureError::Connection("failed to serialize format pod".into()))?
    .0
    .into_inner();
    let mut params = [pw::spa::pod::Pod::from_bytes(&values).expect("valid pod")];

    stream
        .connect(
            pw::spa::utils::Direction::Input,
            Some(grant.node_id),
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|_| CaptureError::Connection("failed to connect video stream".into()))?;

    while shared.running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(Duration::from_millis(50));
    }

    tracing::info!("PipeWire video main loop exiting");
    Ok(())
}

/// Consume one buffer from the stream: validate, wrap, deliver.
fn process_video(stream: &pw::stream::StreamRef, data: &mut StreamData) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    if !data.have_format {
        return;
    }

    let size = data.format.size();
    let (width, height) = (size.width, size.height);

    // Validate declared geometry before touching the buffer; a compositor
    // bug here must not become an oversized copy.
    if width == 0
        || height == 0
        || width > MAX_DIMENSION
        || height > MAX_DIMENSION
        || PixelLayout::Bgra.buffer_size(width, height) > MAX_BUFFER
    {
        tracing::warn!(width, height, "Rejecting frame with invalid dimensions");
        return;
    }

    let datas = buffer.datas_mut();
    if datas.is_empty() {
        return;
    }
    let d = &mut datas[0];
    let chunk_size = d.chunk().size() as usize;
    let chunk_stride = d.chunk().stride();

    let Some(slice) = d.data() else {
        return;
    };
    if chunk_size == 0 || chunk_size > slice.len() || chunk_size as u64 > MAX_BUFFER {
        tracing::warn!(chunk_size, "Rejecting frame with invalid buffer size");
        return;
    }

    #[allow(clippy::cast_sign_loss)]
    let stride = if chunk_stride > 0 {
        chunk_stride as u32
    } else {
        width * 4
    };
    if u64::from(stride) * u64::from(height) > chunk_size as u64 {
        tracing::warn!(stride, height, chunk_size, "Rejecting frame with short buffer");
        return;
    }

    let layout = match data.format.format() {
        pw::spa::param::video::VideoFormat::RGBx | pw::spa::param::video::VideoFormat::RGBA => {
            PixelLayout::Rgba
        }
        _ => PixelLayout::Bgra,
    };

    let mut frame = RawVideoFrame {
        data: slice[..chunk_size].to_vec(),
        width,
        height,
        stride,
        layout,
        pts_us: clock::monotonic_us(),
        keyframe_hint: false,
    };
    if frame.validate().is_err() {
        return;
    }
    frame.ensure_alpha_opaque();

    data.window_frames += 1;
    let elapsed = data.window_start.elapsed();
    if elapsed >= Duration::from_secs(1) {
        let fps = f64::from(data.window_frames) / elapsed.as_secs_f64();
        data.shared
            .measured_fps
            .store(fps.to_bits(), Ordering::Relaxed);
        data.window_start = std::time::Instant::now();
        data.window_frames = 0;
    }

    let sink = data
        .shared
        .sink
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    if let Some(sink) = sink {
        sink(frame);
    }
}
