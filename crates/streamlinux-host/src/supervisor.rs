//! Session supervisor.
//!
//! Wires capture → encoders → synchronizer → peer transport, registers
//! with the broker, drives the offer/answer cycle for the viewer and
//! applies control-channel requests to the running pipeline. On a fatal
//! component error the session is closed (children in reverse dependency
//! order), the viewer gets a final Error message when the channel is
//! still up, and the error is returned to `main`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::sync::{mpsc, watch};

use stream_capture::audio::{AudioBackend, AudioCaptureConfig, CpalAudioBackend};
use stream_capture::{
    select_audio_backend, select_backend, BackendChoice, CaptureBackend, CaptureConfig,
    CaptureRegion, PixelLayout, RawAudioFrame, RawVideoFrame,
};
use stream_encode::{
    AudioConfig, GstVideoEncoder, HwAccel, OpusAudioEncoder, VideoCodec, VideoConfig, VideoEncoder,
};
use stream_sync::{SyncConfig, Synchronizer};
use stream_transport::control::{ControlChannel, ControlPayload, QualityPreset};
use stream_transport::peer::{PeerTransport, PeerTransportConfig, TransportState};
use stream_transport::signaling::{SignalingClient, SignalingEvent};

use crate::config::HostConfig;
use crate::settings;

/// Capture → encoder handoff depth.
const CAPTURE_QUEUE: usize = 2;

/// Audio capture → encoder handoff depth (frames are 20 ms).
const AUDIO_QUEUE: usize = 8;

/// Synchronizer → transport handoff depth.
const PAIR_QUEUE: usize = 30;

/// Worker join budget during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Consecutive encode failures tolerated before the session dies.
const ENCODE_FAILURE_BUDGET: u32 = 30;

// ---------------------------------------------------------------------------
// Bounded handoff queue
// ---------------------------------------------------------------------------

/// Bounded queue with drop-oldest overflow, shared between a capture
/// callback and an encoder worker.
struct HandoffQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Condvar,
    dropped: AtomicU64,
}

impl<T> HandoffQueue<T> {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Condvar::new(),
            dropped: AtomicU64::new(0),
        })
    }

    fn push(&self, item: T) {
        let mut queue = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(item);
        drop(queue);
        self.available.notify_one();
    }

    fn pop(&self, timeout: Duration) -> Option<T> {
        let mut queue = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(item) = queue.pop_front() {
            return Some(item);
        }
        let (mut queue, _) = self
            .available
            .wait_timeout(queue, timeout)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        queue.pop_front()
    }

    fn try_pop(&self) -> Option<T> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
    }
}

// ---------------------------------------------------------------------------
// Worker commands
// ---------------------------------------------------------------------------

enum VideoCommand {
    SetBitrate(u64),
    RequestKeyframe,
    /// Re-init at explicit output dimensions (0 = follow capture).
    SetOutputSize(u32, u32),
    SetFps(u32),
}

/// Current stream parameters, reported in State replies.
#[derive(Debug, Clone, Copy)]
struct StreamParams {
    paused: bool,
    width: u32,
    height: u32,
    bitrate_bps: u64,
    fps: u32,
    cursor: bool,
}

// ---------------------------------------------------------------------------
// Session entry point
// ---------------------------------------------------------------------------

/// Options resolved from CLI flags and the config file.
pub struct SessionOptions {
    pub config: HostConfig,
    pub backend_choice: BackendChoice,
    /// Token presented to the broker.
    pub token: Option<String>,
    pub host_name: String,
}

/// Run one streaming session until shutdown is signalled or a fatal
/// component error occurs.
pub async fn run_session(
    options: SessionOptions,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let config = &options.config;

    let video_codec: VideoCodec = config
        .video
        .codec
        .parse()
        .map_err(|e| anyhow!("{e}"))?;
    let hw_accel = match config.video.hw_accel.as_str() {
        "vaapi" => HwAccel::Vaapi,
        "nvenc" => HwAccel::Nvenc,
        "software" => HwAccel::Software,
        _ => HwAccel::Auto,
    };

    // ---- Capture ----------------------------------------------------------
    let mut capture = build_capture_backend(options.backend_choice)?;
    let capture_config = CaptureConfig {
        region: CaptureRegion::Monitor(config.display.monitor),
        fps: config.display.fps,
        show_cursor: config.display.cursor,
        preferred_layout: PixelLayout::Bgra,
    };
    capture
        .initialize(&capture_config)
        .context("capture initialization failed")?;

    let video_queue = HandoffQueue::<RawVideoFrame>::new(CAPTURE_QUEUE);
    {
        let queue = Arc::clone(&video_queue);
        capture.set_frame_sink(Arc::new(move |frame| queue.push(frame)));
    }
    capture.start().context("capture start failed")?;
    let capture = Arc::new(Mutex::new(capture));

    // ---- Audio capture ----------------------------------------------------
    let audio_queue = HandoffQueue::<RawAudioFrame>::new(AUDIO_QUEUE);
    let mic_queue = HandoffQueue::<RawAudioFrame>::new(AUDIO_QUEUE);
    let audio_enabled = config.audio.source != "none";
    let mut audio_backends: Vec<Box<dyn AudioBackend>> = Vec::new();

    if audio_enabled {
        let audio_capture_config = AudioCaptureConfig {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            frame_ms: config.audio.frame_ms,
            device: None,
        };

        if matches!(config.audio.source.as_str(), "system" | "mixed") {
            let mut backend = select_audio_backend();
            backend
                .initialize(&audio_capture_config)
                .context("audio initialization failed")?;
            let queue = Arc::clone(&audio_queue);
            backend.set_frame_sink(Arc::new(move |frame| queue.push(frame)));
            backend.start().context("audio start failed")?;
            audio_backends.push(backend);
        }

        if matches!(config.audio.source.as_str(), "mic" | "mixed") {
            let mut backend: Box<dyn AudioBackend> = Box::new(CpalAudioBackend::new());
            backend
                .initialize(&audio_capture_config)
                .context("microphone initialization failed")?;
            // For "mic" alone the primary queue carries the mic.
            let queue = if config.audio.source == "mic" {
                Arc::clone(&audio_queue)
            } else {
                Arc::clone(&mic_queue)
            };
            backend.set_frame_sink(Arc::new(move |frame| queue.push(frame)));
            backend.start().context("microphone start failed")?;
            audio_backends.push(backend);
        }
    }

    // ---- Synchronizer -----------------------------------------------------
    let synchronizer = Arc::new(Synchronizer::new(SyncConfig::default()));

    // ---- Shared runtime state ---------------------------------------------
    let workers_running = Arc::new(AtomicBool::new(true));
    let paused = Arc::new(AtomicBool::new(false));
    let params = Arc::new(Mutex::new(StreamParams {
        paused: false,
        width: config.video.width,
        height: config.video.height,
        bitrate_bps: config.video.bitrate,
        fps: config.display.fps,
        cursor: config.display.cursor,
    }));
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(4);

    // ---- Video encoder worker ---------------------------------------------
    let (video_cmd_tx, video_cmd_rx) = std::sync::mpsc::channel::<VideoCommand>();
    let video_worker = {
        let queue = Arc::clone(&video_queue);
        let sync = Arc::clone(&synchronizer);
        let running = Arc::clone(&workers_running);
        let paused = Arc::clone(&paused);
        let fatal = fatal_tx.clone();
        let video_section = config.video.clone();
        let fps = config.display.fps;
        std::thread::Builder::new()
            .name("video-encode".into())
            .spawn(move || {
                video_encode_loop(
                    &queue,
                    &sync,
                    &running,
                    &paused,
                    &video_cmd_rx,
                    video_codec,
                    hw_accel,
                    &video_section,
                    fps,
                    &fatal,
                );
            })
            .context("failed to spawn video encoder worker")?
    };

    // ---- Audio encoder worker ---------------------------------------------
    let audio_worker = if audio_enabled {
        let queue = Arc::clone(&audio_queue);
        let mix = Arc::clone(&mic_queue);
        let mixed = config.audio.source == "mixed";
        let sync = Arc::clone(&synchronizer);
        let running = Arc::clone(&workers_running);
        let paused = Arc::clone(&paused);
        let fatal = fatal_tx.clone();
        let audio_config = AudioConfig {
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            bitrate_bps: config.audio.bitrate,
            frame_ms: config.audio.frame_ms,
        };
        Some(
            std::thread::Builder::new()
                .name("audio-encode".into())
                .spawn(move || {
                    audio_encode_loop(&queue, &mix, mixed, &sync, &running, &paused, &audio_config, &fatal);
                })
                .context("failed to spawn audio encoder worker")?,
        )
    } else {
        None
    };

    // ---- Transport + control ----------------------------------------------
    let control = Arc::new(ControlChannel::new());
    let transport_config = PeerTransportConfig {
        video_codec,
        stun_servers: config.network.stun_servers.clone(),
        reconnect_timeout: Duration::from_secs(10),
    };
    let (transport, mut candidate_rx, control_inbox) =
        PeerTransport::new(&transport_config, Arc::clone(&control), config.display.fps)
            .await
            .context("peer transport initialization failed")?;
    let transport = Arc::new(transport);

    // ---- Synchronizer pull thread → transport sender -----------------------
    let (pair_tx, mut pair_rx) = mpsc::channel(PAIR_QUEUE);
    let sync_pull = {
        let sync = Arc::clone(&synchronizer);
        let running = Arc::clone(&workers_running);
        std::thread::Builder::new()
            .name("sync-pull".into())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    if let Some(pair) = sync.next(None) {
                        // Drop under transport backpressure rather than
                        // stalling the synchronizer.
                        let _ = pair_tx.try_send(pair);
                    }
                }
            })
            .context("failed to spawn synchronizer pull worker")?
    };

    let sender_task = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            while let Some(pair) = pair_rx.recv().await {
                if transport.state() != TransportState::Connected {
                    continue;
                }
                if let Err(e) = transport.send_synced(pair).await {
                    tracing::debug!("Dropping pair: {e}");
                }
            }
        })
    };

    // ---- Signaling ---------------------------------------------------------
    let (signaling, mut signaling_rx) = SignalingClient::connect(
        &config.broker_url(),
        options.token.as_deref(),
        &config.network.room,
        Some(options.host_name.clone()),
    )
    .await
    .context("failed to connect to signaling broker")?;

    // Trickle local candidates to the bound viewer once one exists.
    let active_viewer: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let candidate_task = {
        let signaling = signaling.clone();
        let active_viewer = Arc::clone(&active_viewer);
        tokio::spawn(async move {
            let mut backlog = Vec::new();
            while let Some(candidate) = candidate_rx.recv().await {
                let viewer = active_viewer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .clone();
                match viewer {
                    Some(viewer) => {
                        for held in backlog.drain(..) {
                            let _ = signaling.send_candidate(&viewer, &held);
                        }
                        let _ = signaling.send_candidate(&viewer, &candidate);
                    }
                    None => backlog.push(candidate),
                }
            }
        })
    };

    tracing::info!(
        room = %config.network.room,
        broker = %config.broker_url(),
        "Session up, waiting for a viewer"
    );

    // ---- Main event loop ---------------------------------------------------
    let mut signaling_open = true;
    let result = loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
            }

            fatal = fatal_rx.recv() => {
                let error = fatal.map_or_else(|| anyhow!("fatal channel closed"), |e| e);
                tracing::error!("Fatal component error: {error:#}");
                let _ = transport
                    .send_control(ControlPayload::Error { message: format!("{error:#}") })
                    .await;
                break Err(error);
            }

            event = signaling_rx.recv(), if signaling_open => {
                let Some(event) = event else {
                    // Media does not flow through the broker; an
                    // established session keeps running without it.
                    tracing::warn!("Signaling channel closed");
                    signaling_open = false;
                    continue;
                };
                if let Err(e) = handle_signaling_event(
                    event,
                    &signaling,
                    &transport,
                    &control,
                    &active_viewer,
                ).await {
                    tracing::warn!("Signaling event error: {e:#}");
                }
            }

            // The inbox is bounded drop-oldest, so a stall in another
            // branch sheds stale requests instead of queueing them.
            message = control_inbox.recv() => {
                handle_control_message(
                    message.payload,
                    &video_cmd_tx,
                    &capture,
                    &paused,
                    &params,
                    &transport,
                    &synchronizer,
                ).await;
            }
        }
    };

    // ---- Teardown: reverse dependency order --------------------------------
    tracing::info!("Closing session");
    let _ = transport.close().await;
    sender_task.abort();
    candidate_task.abort();

    workers_running.store(false, Ordering::SeqCst);
    join_with_grace(video_worker, "video-encode");
    if let Some(worker) = audio_worker {
        join_with_grace(worker, "audio-encode");
    }
    join_with_grace(sync_pull, "sync-pull");
    synchronizer.reset();

    for mut backend in audio_backends {
        backend.stop();
    }
    capture
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .stop();

    result
}

/// Construct the capture backend, threading the persisted portal restore
/// token through so the permission dialog is skipped on restart.
fn build_capture_backend(choice: BackendChoice) -> Result<Box<dyn CaptureBackend>> {
    let resolved =
        stream_capture::backend::resolve_backend(choice).context("no capture backend")?;
    match resolved {
        BackendChoice::Compositor => {
            let saved = settings::load();
            let backend = stream_capture::portal::PortalBackend::new().with_restore_token(
                saved.portal_restore_token,
                Some(Arc::new(|token: &str| {
                    let mut updated = settings::load();
                    updated.portal_restore_token = Some(token.to_owned());
                    if let Err(e) = settings::save(&updated) {
                        tracing::debug!("Failed to persist restore token: {e:#}");
                    }
                })),
            );
            tracing::info!(backend = "portal", "Selected capture backend");
            Ok(Box::new(backend))
        }
        _ => select_backend(choice).context("no capture backend"),
    }
}

/// Join a worker, logging if it overruns the shutdown grace period.
fn join_with_grace(handle: std::thread::JoinHandle<()>, name: &str) {
    let deadline = std::time::Instant::now() + SHUTDOWN_GRACE;
    while !handle.is_finished() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        tracing::warn!(worker = name, "Worker did not stop within the grace period");
    }
}

// ---------------------------------------------------------------------------
// Encoder workers
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn video_encode_loop(
    queue: &HandoffQueue<RawVideoFrame>,
    sync: &Synchronizer,
    running: &AtomicBool,
    paused: &AtomicBool,
    commands: &std::sync::mpsc::Receiver<VideoCommand>,
    codec: VideoCodec,
    hw_accel: HwAccel,
    video_section: &crate::config::VideoSection,
    initial_fps: u32,
    fatal: &mpsc::Sender<anyhow::Error>,
) {
    let mut encoder: Option<GstVideoEncoder> = None;
    // 0 means follow the capture resolution.
    let mut out_width = video_section.width;
    let mut out_height = video_section.height;
    let mut bitrate = video_section.bitrate;
    let mut fps = initial_fps;
    let keyframe_secs = video_section.keyframe_interval_secs;
    let mut pending_keyframe = false;
    let mut consecutive_failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        // Apply queued control commands first.
        while let Ok(command) = commands.try_recv() {
            match command {
                VideoCommand::SetBitrate(bps) => {
                    bitrate = bps;
                    if let Some(enc) = &encoder {
                        enc.set_bitrate(bps);
                    }
                }
                VideoCommand::RequestKeyframe => {
                    if let Some(enc) = &encoder {
                        enc.request_keyframe();
                    } else {
                        pending_keyframe = true;
                    }
                }
                VideoCommand::SetOutputSize(width, height) => {
                    out_width = width;
                    out_height = height;
                    // Drop the encoder; it is rebuilt on the next frame
                    // at the new geometry with a fresh keyframe.
                    encoder = None;
                    pending_keyframe = true;
                }
                VideoCommand::SetFps(new_fps) => {
                    fps = new_fps.max(1);
                    encoder = None;
                    pending_keyframe = true;
                }
            }
        }

        let Some(mut frame) = queue.pop(Duration::from_millis(100)) else {
            continue;
        };

        // Pause gates the encoder input; the synchronizer keeps draining.
        if paused.load(Ordering::SeqCst) {
            continue;
        }

        let target_w = if out_width == 0 { frame.width } else { out_width };
        let target_h = if out_height == 0 { frame.height } else { out_height };

        // Rebuild on geometry change (monitor switch, resolution request).
        let needs_rebuild = match &encoder {
            Some(enc) => enc.config().width != target_w || enc.config().height != target_h,
            None => true,
        };
        if needs_rebuild {
            let config = VideoConfig {
                width: target_w,
                height: target_h,
                fps,
                bitrate_bps: bitrate,
                codec,
                hw_accel,
                keyframe_interval: fps.saturating_mul(keyframe_secs).max(1),
            };
            match GstVideoEncoder::new(&config, frame.layout) {
                Ok(enc) => {
                    if pending_keyframe {
                        enc.request_keyframe();
                        pending_keyframe = false;
                    }
                    encoder = Some(enc);
                }
                Err(e) => {
                    let _ = fatal.blocking_send(anyhow!("video encoder init failed: {e}"));
                    return;
                }
            }
        }

        let enc = encoder.as_mut().expect("encoder exists after rebuild");
        frame.keyframe_hint = frame.keyframe_hint || pending_keyframe;
        pending_keyframe = false;

        match enc.encode(frame) {
            Ok(frames) => {
                consecutive_failures = 0;
                for encoded in frames {
                    sync.push_video(encoded);
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!("Video encode failed ({consecutive_failures}): {e}");
                if consecutive_failures >= ENCODE_FAILURE_BUDGET {
                    let _ = fatal.blocking_send(anyhow!("video encoder failing persistently: {e}"));
                    return;
                }
            }
        }
    }

    if let Some(mut enc) = encoder {
        if let Ok(frames) = enc.flush() {
            for encoded in frames {
                sync.push_video(encoded);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn audio_encode_loop(
    queue: &HandoffQueue<RawAudioFrame>,
    mic: &HandoffQueue<RawAudioFrame>,
    mixed: bool,
    sync: &Synchronizer,
    running: &AtomicBool,
    paused: &AtomicBool,
    config: &AudioConfig,
    fatal: &mpsc::Sender<anyhow::Error>,
) {
    let mut encoder = match OpusAudioEncoder::new(config) {
        Ok(enc) => enc,
        Err(e) => {
            let _ = fatal.blocking_send(anyhow!("audio encoder init failed: {e}"));
            return;
        }
    };
    let mut consecutive_failures: u32 = 0;

    while running.load(Ordering::SeqCst) {
        let Some(mut frame) = queue.pop(Duration::from_millis(100)) else {
            continue;
        };
        if paused.load(Ordering::SeqCst) {
            continue;
        }

        // Mixed mode folds the microphone into the system stream.
        if mixed {
            if let Some(mic_frame) = mic.try_pop() {
                mix_into(&mut frame, &mic_frame);
            }
        }

        match encoder.encode(&frame) {
            Ok(encoded) => {
                consecutive_failures = 0;
                sync.push_audio(encoded);
            }
            Err(e) => {
                consecutive_failures += 1;
                tracing::warn!("Audio encode failed ({consecutive_failures}): {e}");
                if consecutive_failures >= ENCODE_FAILURE_BUDGET {
                    let _ = fatal.blocking_send(anyhow!("audio encoder failing persistently: {e}"));
                    return;
                }
            }
        }
    }
}

/// Sample-wise addition with clipping; frames of different lengths mix
/// over the shorter prefix.
fn mix_into(target: &mut RawAudioFrame, other: &RawAudioFrame) {
    for (a, b) in target.samples.iter_mut().zip(other.samples.iter()) {
        *a = (*a + *b).clamp(-1.0, 1.0);
    }
}

// ---------------------------------------------------------------------------
// Signaling + control handling
// ---------------------------------------------------------------------------

async fn handle_signaling_event(
    event: SignalingEvent,
    signaling: &SignalingClient,
    transport: &Arc<PeerTransport>,
    control: &Arc<ControlChannel>,
    active_viewer: &Arc<Mutex<Option<String>>>,
) -> Result<()> {
    match event {
        SignalingEvent::Registered { peer_id } => {
            tracing::info!(%peer_id, "Registered with broker");
            Ok(())
        }
        SignalingEvent::ViewerJoined { peer_id, name } => {
            {
                let mut viewer = active_viewer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(existing) = viewer.as_deref() {
                    tracing::warn!(
                        %peer_id,
                        %existing,
                        "Additional viewer ignored, session is single-peer"
                    );
                    return Ok(());
                }
                *viewer = Some(peer_id.clone());
            }
            tracing::info!(%peer_id, ?name, "Viewer joined, sending offer");

            // The broker authenticated this peer's token; bind the
            // control channel to it before any media or control flows.
            control.bind_peer(&peer_id);

            let sdp = transport.create_offer().await?;
            signaling.send_offer(&peer_id, sdp)?;
            Ok(())
        }
        SignalingEvent::ViewerLeft { peer_id } => {
            let is_active = active_viewer
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .as_deref()
                == Some(peer_id.as_str());
            if is_active {
                tracing::info!(%peer_id, "Active viewer left");
            }
            Ok(())
        }
        SignalingEvent::Answer { from, sdp } => {
            if !is_active_peer(active_viewer, from.as_deref()) {
                tracing::warn!(?from, "Ignoring answer from unbound peer");
                return Ok(());
            }
            transport.set_remote_answer(&sdp).await?;
            tracing::info!("Answer applied, waiting for connection");

            // Budget: ICE gathering plus the DTLS handshake.
            let budget = stream_transport::peer::ICE_GATHER_TIMEOUT
                + stream_transport::peer::HANDSHAKE_TIMEOUT;
            let transport = Arc::clone(transport);
            tokio::spawn(async move {
                match transport.wait_connected(budget).await {
                    Ok(()) => tracing::info!("Peer connection established"),
                    Err(e) => tracing::warn!("Peer connection not established: {e}"),
                }
            });
            Ok(())
        }
        SignalingEvent::RemoteCandidate { from, candidate } => {
            if !is_active_peer(active_viewer, from.as_deref()) {
                return Ok(());
            }
            transport.add_ice_candidate(candidate).await?;
            Ok(())
        }
        SignalingEvent::BrokerError { message } => {
            tracing::warn!(%message, "Broker error");
            Ok(())
        }
        SignalingEvent::Disconnected => {
            tracing::warn!("Broker connection lost; existing session continues");
            Ok(())
        }
    }
}

fn is_active_peer(active_viewer: &Arc<Mutex<Option<String>>>, from: Option<&str>) -> bool {
    let viewer = active_viewer
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    match (viewer.as_deref(), from) {
        (Some(bound), Some(from)) => bound == from,
        // Tolerate brokers that do not stamp `from` once a viewer is bound.
        (Some(_), None) => true,
        _ => false,
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_control_message(
    payload: ControlPayload,
    video_cmd: &std::sync::mpsc::Sender<VideoCommand>,
    capture: &Arc<Mutex<Box<dyn CaptureBackend>>>,
    paused: &Arc<AtomicBool>,
    params: &Arc<Mutex<StreamParams>>,
    transport: &Arc<PeerTransport>,
    synchronizer: &Arc<Synchronizer>,
) {
    match payload {
        ControlPayload::Pause => {
            paused.store(true, Ordering::SeqCst);
            set_param(params, |p| p.paused = true);
            send_state(transport, params).await;
        }
        ControlPayload::Resume => {
            paused.store(false, Ordering::SeqCst);
            set_param(params, |p| p.paused = false);
            // Fresh keyframe so the viewer recovers instantly.
            let _ = video_cmd.send(VideoCommand::RequestKeyframe);
            send_state(transport, params).await;
        }
        ControlPayload::SetResolution { width, height } => {
            let _ = video_cmd.send(VideoCommand::SetOutputSize(width, height));
            set_param(params, |p| {
                p.width = width;
                p.height = height;
            });
            send_state(transport, params).await;
        }
        ControlPayload::SetBitrate { bps } => {
            let _ = video_cmd.send(VideoCommand::SetBitrate(bps));
            set_param(params, |p| p.bitrate_bps = bps);
            send_state(transport, params).await;
        }
        ControlPayload::SetQuality { preset } => {
            apply_quality(preset, video_cmd, capture, params);
            send_state(transport, params).await;
        }
        ControlPayload::SelectMonitor { id } => {
            let result = {
                let mut capture = capture
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let (fps, cursor) = get_param(params, |p| (p.fps, p.cursor));
                let monitors_ok = capture
                    .list_monitors()
                    .map(|m| m.iter().any(|mon| mon.id == id))
                    .unwrap_or(false);
                if monitors_ok {
                    capture.update_config(&CaptureConfig {
                        region: CaptureRegion::Monitor(id),
                        fps,
                        show_cursor: cursor,
                        preferred_layout: PixelLayout::Bgra,
                    })
                } else {
                    Err(stream_capture::CaptureError::MonitorNotFound(id))
                }
            };
            match result {
                Ok(()) => {
                    // The capture backend flags the next frame; the
                    // encoder also gets an explicit request in case the
                    // geometry is unchanged.
                    let _ = video_cmd.send(VideoCommand::RequestKeyframe);
                    synchronizer.reset();
                }
                Err(e) => {
                    tracing::warn!(monitor = id, "Monitor switch failed: {e}");
                    let _ = transport
                        .send_control(ControlPayload::Error {
                            message: format!("monitor switch failed: {e}"),
                        })
                        .await;
                }
            }
        }
        ControlPayload::RequestKeyframe => {
            let _ = video_cmd.send(VideoCommand::RequestKeyframe);
        }
        // Ping is answered inside the transport; the rest are
        // host-to-viewer messages that peers must not send.
        ControlPayload::Ping
        | ControlPayload::Pong { .. }
        | ControlPayload::State { .. }
        | ControlPayload::Error { .. } => {
            tracing::debug!("Ignoring viewer-side control payload");
        }
    }
}

fn apply_quality(
    preset: QualityPreset,
    video_cmd: &std::sync::mpsc::Sender<VideoCommand>,
    capture: &Arc<Mutex<Box<dyn CaptureBackend>>>,
    params: &Arc<Mutex<StreamParams>>,
) {
    let (scale, bitrate, fps) = preset.parameters();
    let (native_w, native_h) = capture
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .current_resolution();

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (width, height) = if native_w == 0 || scale >= 1.0 {
        (0, 0)
    } else {
        // Encoders want even dimensions.
        (
            ((f64::from(native_w) * scale) as u32) & !1,
            ((f64::from(native_h) * scale) as u32) & !1,
        )
    };

    let _ = video_cmd.send(VideoCommand::SetBitrate(bitrate));
    let _ = video_cmd.send(VideoCommand::SetOutputSize(width, height));
    let _ = video_cmd.send(VideoCommand::SetFps(fps));
    set_param(params, |p| {
        p.bitrate_bps = bitrate;
        p.width = width;
        p.height = height;
        p.fps = fps;
    });

    let _ = settings::save(&settings::Settings {
        last_quality: Some(format!("{preset:?}").to_lowercase()),
        ..settings::load()
    });
}

fn set_param(params: &Arc<Mutex<StreamParams>>, apply: impl FnOnce(&mut StreamParams)) {
    let mut params = params
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    apply(&mut params);
}

fn get_param<T>(params: &Arc<Mutex<StreamParams>>, read: impl FnOnce(&StreamParams) -> T) -> T {
    let params = params
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    read(&params)
}

async fn send_state(transport: &Arc<PeerTransport>, params: &Arc<Mutex<StreamParams>>) {
    let snapshot = get_param(params, |p| *p);
    let _ = transport
        .send_control(ControlPayload::State {
            paused: snapshot.paused,
            width: snapshot.width,
            height: snapshot.height,
            bitrate_bps: snapshot.bitrate_bps,
            fps: snapshot.fps,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handoff_queue_drops_oldest() {
        let queue = HandoffQueue::<u32>::new(2);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.dropped.load(Ordering::Relaxed), 1);
        assert_eq!(queue.pop(Duration::from_millis(0)), Some(2));
        assert_eq!(queue.pop(Duration::from_millis(0)), Some(3));
        assert_eq!(queue.pop(Duration::from_millis(0)), None);
    }

    #[test]
    fn mixing_clips_to_unit_range() {
        let mut a = RawAudioFrame {
            samples: vec![0.9, -0.9],
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 2,
            pts_us: 0,
        };
        let b = RawAudioFrame {
            samples: vec![0.5, -0.5],
            sample_rate: 48_000,
            channels: 1,
            samples_per_channel: 2,
            pts_us: 0,
        };
        mix_into(&mut a, &b);
        assert_eq!(a.samples, vec![1.0, -1.0]);
    }
}
