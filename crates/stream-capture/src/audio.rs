//! System audio capture.
//!
//! Captures the monitor of the default output sink as interleaved f32
//! PCM. The `PipeWire` backend connects a capture stream with
//! `stream.capture-sink` so the daemon routes the sink monitor to us; the
//! cpal backend is the compatibility path for hosts without a `PipeWire`
//! runtime. Both deliver frames of exactly `frame_ms` through a shared
//! accumulator that enforces the audio buffer limits.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pipewire as pw;
use pw::properties::properties;
use pw::stream::{Stream, StreamFlags};

use crate::clock;
use crate::error::AudioCaptureError;
use crate::frame::{RawAudioFrame, MAX_CHANNELS, MAX_FRAME_SAMPLES};

/// Audio capture configuration.
#[derive(Debug, Clone)]
pub struct AudioCaptureConfig {
    /// Sample rate in Hz (48 kHz canonical).
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Frame duration in milliseconds (default 20).
    pub frame_ms: u32,
    /// Device name, `None` for the default sink monitor.
    pub device: Option<String>,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_ms: 20,
            device: None,
        }
    }
}

/// An enumerable audio device.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    /// Whether this is a sink monitor (what we capture for system audio).
    pub monitor: bool,
}

/// Destination for captured audio frames. Must not block.
pub type AudioSink = Arc<dyn Fn(RawAudioFrame) + Send + Sync>;

/// An audio capture backend.
pub trait AudioBackend: Send {
    fn initialize(&mut self, config: &AudioCaptureConfig) -> Result<(), AudioCaptureError>;

    fn start(&mut self) -> Result<(), AudioCaptureError>;

    fn stop(&mut self);

    fn list_devices(&mut self) -> Result<Vec<AudioDevice>, AudioCaptureError>;

    fn select_device(&mut self, name: &str) -> Result<(), AudioCaptureError>;

    /// Estimated capture latency, from the accumulator fill level.
    fn measured_latency_ms(&self) -> f64;

    fn set_frame_sink(&mut self, sink: AudioSink);

    fn name(&self) -> &'static str;
}

/// Whether a `PipeWire` runtime is reachable for this session.
fn pipewire_available() -> bool {
    if std::env::var_os("PIPEWIRE_RUNTIME_DIR").is_some() {
        return true;
    }
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("pipewire-0").exists();
    }
    false
}

/// Construct the audio backend for this host: `PipeWire` when its runtime
/// is present, the cpal compatibility backend otherwise.
pub fn select_audio_backend() -> Box<dyn AudioBackend> {
    if pipewire_available() {
        tracing::info!("Selected PipeWire audio backend");
        Box::new(PipeWireAudioBackend::new())
    } else {
        tracing::info!("PipeWire runtime not found, using cpal audio backend");
        Box::new(CpalAudioBackend::new())
    }
}

// ---------------------------------------------------------------------------
// Framing accumulator
// ---------------------------------------------------------------------------

/// Reframes arbitrary-size PCM deliveries into exact `frame_ms` frames.
///
/// PTS is derived from the arrival clock of the first buffered sample and
/// advanced by one frame duration per emitted frame, resynchronized when
/// it drifts more than 100 ms from the arrival clock.
struct FrameAccumulator {
    sample_rate: u32,
    channels: u16,
    samples_per_frame: usize,
    buffer: Vec<f32>,
    next_pts: Option<i64>,
}

impl FrameAccumulator {
    fn new(sample_rate: u32, channels: u16, frame_ms: u32) -> Self {
        let samples_per_frame = (sample_rate as usize * frame_ms as usize) / 1000;
        Self {
            sample_rate,
            channels,
            samples_per_frame,
            buffer: Vec::with_capacity(samples_per_frame * usize::from(channels) * 2),
            next_pts: None,
        }
    }

    fn frame_duration_us(&self) -> i64 {
        (self.samples_per_frame as i64) * 1_000_000 / i64::from(self.sample_rate)
    }

    /// Push an interleaved chunk; returns the complete frames it produced.
    fn push(&mut self, samples: &[f32], arrival_us: i64) -> Vec<RawAudioFrame> {
        if self.next_pts.is_none() {
            let buffered = (self.buffer.len() / usize::from(self.channels)) as i64 * 1_000_000
                / i64::from(self.sample_rate);
            self.next_pts = Some(arrival_us - buffered);
        }

        self.buffer.extend_from_slice(samples);

        let frame_len = self.samples_per_frame * usize::from(self.channels);
        let mut frames = Vec::new();
        while self.buffer.len() >= frame_len {
            let rest = self.buffer.split_off(frame_len);
            let data = std::mem::replace(&mut self.buffer, rest);
            let pts = self.next_pts.unwrap_or(arrival_us);

            frames.push(RawAudioFrame {
                samples: data,
                sample_rate: self.sample_rate,
                channels: self.channels,
                samples_per_channel: self.samples_per_frame,
                pts_us: pts,
            });
            self.next_pts = Some(pts + self.frame_duration_us());
        }

        // Clock resync after device stalls: the derived PTS must not run
        // far ahead of or behind the arrival clock.
        if let Some(pts) = self.next_pts {
            if (pts - arrival_us).abs() > 100_000 {
                self.next_pts = None;
            }
        }

        frames
    }

    /// Samples currently buffered, as milliseconds of latency.
    fn buffered_ms(&self) -> f64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0.0;
        }
        let per_channel = self.buffer.len() / usize::from(self.channels);
        per_channel as f64 * 1000.0 / f64::from(self.sample_rate)
    }
}

/// Validate an incoming device buffer before it is copied anywhere.
fn validate_delivery(
    samples: &[f32],
    channels: u16,
    samples_per_channel: usize,
) -> Result<(), AudioCaptureError> {
    if channels == 0 || channels > MAX_CHANNELS {
        return Err(crate::frame::FrameError::BadChannelCount(channels).into());
    }
    if samples_per_channel > MAX_FRAME_SAMPLES {
        return Err(crate::frame::FrameError::BadSampleCount(samples_per_channel).into());
    }
    if samples.len() != samples_per_channel * usize::from(channels) {
        return Err(crate::frame::FrameError::ShortBuffer {
            len: samples.len() * 4,
            need: (samples_per_channel * usize::from(channels) * 4) as u64,
        }
        .into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// PipeWire backend
// ---------------------------------------------------------------------------

struct AudioShared {
    running: AtomicBool,
    sink: Mutex<Option<AudioSink>>,
    latency_ms: AtomicU64,
}

/// Captures the default sink monitor through `PipeWire`.
pub struct PipeWireAudioBackend {
    shared: Arc<AudioShared>,
    config: AudioCaptureConfig,
    worker: Option<std::thread::JoinHandle<()>>,
    initialized: bool,
}

impl PipeWireAudioBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AudioShared {
                running: AtomicBool::new(false),
                sink: Mutex::new(None),
                latency_ms: AtomicU64::new(0),
            }),
            config: AudioCaptureConfig::default(),
            worker: None,
            initialized: false,
        }
    }
}

impl Default for PipeWireAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipeWireAudioBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for PipeWireAudioBackend {
    fn initialize(&mut self, config: &AudioCaptureConfig) -> Result<(), AudioCaptureError> {
        if config.channels == 0 || config.channels > MAX_CHANNELS {
            return Err(crate::frame::FrameError::BadChannelCount(config.channels).into());
        }
        if config.frame_ms == 0 || config.sample_rate == 0 {
            return Err(AudioCaptureError::Stream(
                "frame_ms and sample_rate must be non-zero".into(),
            ));
        }
        self.config = config.clone();
        self.initialized = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioCaptureError> {
        if !self.initialized {
            return Err(AudioCaptureError::NotInitialized);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();
        let worker = std::thread::Builder::new()
            .name("pw-audio".into())
            .spawn(move || {
                if let Err(e) = run_audio_loop(&config, &shared) {
                    tracing::error!("PipeWire audio thread exited with error: {e}");
                }
                shared.running.store(false, Ordering::SeqCst);
            })
            .map_err(AudioCaptureError::SpawnThread)?;

        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn list_devices(&mut self) -> Result<Vec<AudioDevice>, AudioCaptureError> {
        // The stream autoconnects to the default sink monitor; explicit
        // device targeting goes through `select_device` with a node name.
        Ok(vec![AudioDevice {
            name: "default-sink-monitor".into(),
            monitor: true,
        }])
    }

    fn select_device(&mut self, name: &str) -> Result<(), AudioCaptureError> {
        self.config.device = Some(name.to_owned());
        Ok(())
    }

    fn measured_latency_ms(&self) -> f64 {
        f64::from_bits(self.shared.latency_ms.load(Ordering::Relaxed))
    }

    fn set_frame_sink(&mut self, sink: AudioSink) {
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    fn name(&self) -> &'static str {
        "pipewire"
    }
}

/// Run the `PipeWire` audio main loop on a dedicated thread.
fn run_audio_loop(
    config: &AudioCaptureConfig,
    shared: &Arc<AudioShared>,
) -> Result<(), AudioCaptureError> {
    pw::init();

    let mainloop = pw::main_loop::MainLoop::new(None).map_err(|_| AudioCaptureError::MainLoop)?;
    let context = pw::context::Context::new(&mainloop).map_err(|_| AudioCaptureError::Context)?;
    let core = context.connect(None).map_err(|_| AudioCaptureError::Connect)?;

    let mut props = properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Screen",
        *pw::keys::STREAM_CAPTURE_SINK => "true",
    };
    if let Some(device) = &config.device {
        props.insert(*pw::keys::TARGET_OBJECT, device.as_str());
    }

    let stream = Stream::new(&core, "streamlinux-audio", props)
        .map_err(|_| AudioCaptureError::CreateStream)?;

    struct AudioData {
        shared: Arc<AudioShared>,
        accumulator: FrameAccumulator,
        channels: u16,
    }

    let data = AudioData {
        shared: Arc::clone(shared),
        accumulator: FrameAccumulator::new(config.sample_rate, config.channels, config.frame_ms),
        channels: config.channels,
    };

    let _listener = stream
        .add_local_listener_with_user_data(data)
        .state_changed(|_stream, _data, old, new| {
            tracing::debug!("PipeWire audio stream state: {old:?} -> {new:?}");
        })
        .process(|stream_ref, data| {
            process_audio(stream_ref, data.channels, &mut data.accumulator, &data.shared);
        })
        .register()
        .map_err(|_| AudioCaptureError::RegisterListener)?;

    // F32 interleaved at the configured rate and channel count.
    let mut audio_info = pw::spa::param::audio::AudioInfoRaw::new();
    audio_info.set_format(pw::spa::param::audio::AudioFormat::F32LE);
    audio_info.set_rate(config.sample_rate);
    audio_info.set_channels(u32::from(config.channels));

    let values: Vec<u8> = pw::spa::pod::serialize::PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &pw::spa::pod::Value::Object(pw::spa::pod::Object {
            type_: pw::spa::utils::SpaTypes::ObjectParamFormat.as_raw(),
            id: pw::spa::param::ParamType::EnumFormat.as_raw(),
            properties: audio_info.into(),
        }),
    )
    .map_err(|_| AudioCaptureError::CreateStream)?
    .0
    .into_inner();

    let mut params = [pw::spa::pod::Pod::from_bytes(&values).expect("valid pod")];

    stream
        .connect(
            pw::spa::utils::Direction::Input,
            None,
            StreamFlags::AUTOCONNECT | StreamFlags::MAP_BUFFERS,
            &mut params,
        )
        .map_err(|_| AudioCaptureError::StreamConnect)?;

    tracing::info!(
        channels = config.channels,
        sample_rate = config.sample_rate,
        "PipeWire audio stream connected"
    );

    while shared.running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(std::time::Duration::from_millis(50));
    }

    tracing::info!("PipeWire audio main loop exiting");
    Ok(())
}

/// Process a single audio buffer from the `PipeWire` stream.
fn process_audio(
    stream: &pw::stream::StreamRef,
    channels: u16,
    accumulator: &mut FrameAccumulator,
    shared: &Arc<AudioShared>,
) {
    let Some(mut buffer) = stream.dequeue_buffer() else {
        return;
    };

    let datas = buffer.datas_mut();
    if datas.is_empty() {
        return;
    }
    let d = &mut datas[0];
    let size = d.chunk().size() as usize;
    let Some(slice) = d.data() else {
        return;
    };
    if size == 0 || size > slice.len() || size % 4 != 0 {
        return;
    }

    let bytes = &slice[..size];
    let mut samples = vec![0f32; size / 4];
    for (sample, chunk) in samples.iter_mut().zip(bytes.chunks_exact(4)) {
        *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    let per_channel = samples.len() / usize::from(channels.max(1));
    if let Err(e) = validate_delivery(&samples, channels, per_channel) {
        tracing::warn!("Rejecting audio buffer: {e}");
        return;
    }

    deliver_frames(accumulator, &samples, shared);
}

fn deliver_frames(accumulator: &mut FrameAccumulator, samples: &[f32], shared: &Arc<AudioShared>) {
    let frames = accumulator.push(samples, clock::monotonic_us());
    shared
        .latency_ms
        .store(accumulator.buffered_ms().to_bits(), Ordering::Relaxed);
    if frames.is_empty() {
        return;
    }
    let sink = shared
        .sink
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    if let Some(sink) = sink {
        for frame in frames {
            debug_assert!(frame.validate().is_ok());
            sink(frame);
        }
    }
}

// ---------------------------------------------------------------------------
// cpal backend
// ---------------------------------------------------------------------------

/// Compatibility capture through cpal for hosts without `PipeWire`.
///
/// On PulseAudio systems sink monitors are exposed as ordinary input
/// devices, so capturing "the monitor" is selecting the right device.
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated
/// worker thread for the lifetime of the capture.
pub struct CpalAudioBackend {
    shared: Arc<AudioShared>,
    config: AudioCaptureConfig,
    worker: Option<std::thread::JoinHandle<()>>,
    initialized: bool,
}

impl CpalAudioBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(AudioShared {
                running: AtomicBool::new(false),
                sink: Mutex::new(None),
                latency_ms: AtomicU64::new(0),
            }),
            config: AudioCaptureConfig::default(),
            worker: None,
            initialized: false,
        }
    }
}

fn find_cpal_device(
    host: &cpal::Host,
    wanted: Option<&str>,
) -> Result<cpal::Device, AudioCaptureError> {
    use cpal::traits::{DeviceTrait, HostTrait};

    match wanted {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| AudioCaptureError::Stream(e.to_string()))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false))
            .ok_or_else(|| AudioCaptureError::DeviceNotFound(wanted.to_owned())),
        None => {
            // Prefer a monitor source when one is visible, else the
            // default input.
            let monitor = host
                .input_devices()
                .map_err(|e| AudioCaptureError::Stream(e.to_string()))?
                .find(|d| {
                    d.name()
                        .map(|n| n.to_ascii_lowercase().contains("monitor"))
                        .unwrap_or(false)
                });
            monitor
                .or_else(|| host.default_input_device())
                .ok_or_else(|| AudioCaptureError::DeviceNotFound("default".into()))
        }
    }
}

/// Build and run the cpal stream; returns after `running` clears.
///
/// `ready` gets one message once the stream is playing (or the setup
/// error), so `start()` can report failures synchronously.
fn run_cpal_loop(
    config: &AudioCaptureConfig,
    shared: &Arc<AudioShared>,
    ready: &std::sync::mpsc::Sender<Result<(), AudioCaptureError>>,
) -> Result<(), AudioCaptureError> {
    use cpal::traits::{DeviceTrait, StreamTrait};

    let host = cpal::default_host();
    let device = find_cpal_device(&host, config.device.as_deref())?;

    let stream_config = cpal::StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let data_shared = Arc::clone(shared);
    let channels = config.channels;
    let mut accumulator =
        FrameAccumulator::new(config.sample_rate, config.channels, config.frame_ms);

    let stream = device
        .build_input_stream(
            &stream_config,
            move |samples: &[f32], _info: &cpal::InputCallbackInfo| {
                let per_channel = samples.len() / usize::from(channels.max(1));
                if let Err(e) = validate_delivery(samples, channels, per_channel) {
                    tracing::warn!("Rejecting audio buffer: {e}");
                    return;
                }
                deliver_frames(&mut accumulator, samples, &data_shared);
            },
            |err| {
                tracing::warn!("cpal stream error: {err}");
            },
            None,
        )
        .map_err(|e| AudioCaptureError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioCaptureError::Stream(e.to_string()))?;
    let _ = ready.send(Ok(()));

    tracing::info!(
        channels = config.channels,
        sample_rate = config.sample_rate,
        "cpal audio capture started"
    );

    while shared.running.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    drop(stream);
    Ok(())
}

impl Default for CpalAudioBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CpalAudioBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

impl AudioBackend for CpalAudioBackend {
    fn initialize(&mut self, config: &AudioCaptureConfig) -> Result<(), AudioCaptureError> {
        if config.channels == 0 || config.channels > MAX_CHANNELS {
            return Err(crate::frame::FrameError::BadChannelCount(config.channels).into());
        }
        self.config = config.clone();
        self.initialized = true;
        Ok(())
    }

    fn start(&mut self) -> Result<(), AudioCaptureError> {
        if !self.initialized {
            return Err(AudioCaptureError::NotInitialized);
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Device and stream setup happen on the worker; the first result
        // is reported back so start() can fail meaningfully.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let config = self.config.clone();

        let worker = std::thread::Builder::new()
            .name("cpal-audio".into())
            .spawn(move || {
                if let Err(e) = run_cpal_loop(&config, &shared, &ready_tx) {
                    let _ = ready_tx.send(Err(e));
                }
                shared.running.store(false, Ordering::SeqCst);
            })
            .map_err(AudioCaptureError::SpawnThread)?;
        self.worker = Some(worker);

        match ready_rx.recv_timeout(std::time::Duration::from_secs(2)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.shared.running.store(false, Ordering::SeqCst);
                if let Some(handle) = self.worker.take() {
                    let _ = handle.join();
                }
                Err(e)
            }
            Err(_) => {
                // No signal either way; assume the device is just slow.
                Ok(())
            }
        }
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn list_devices(&mut self) -> Result<Vec<AudioDevice>, AudioCaptureError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioCaptureError::Stream(e.to_string()))?;
        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| {
                let monitor = name.to_ascii_lowercase().contains("monitor");
                AudioDevice { name, monitor }
            })
            .collect())
    }

    fn select_device(&mut self, name: &str) -> Result<(), AudioCaptureError> {
        self.config.device = Some(name.to_owned());
        Ok(())
    }

    fn measured_latency_ms(&self) -> f64 {
        f64::from_bits(self.shared.latency_ms.load(Ordering::Relaxed))
    }

    fn set_frame_sink(&mut self, sink: AudioSink) {
        *self
            .shared
            .sink
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sink);
    }

    fn name(&self) -> &'static str {
        "cpal"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_emits_exact_frames() {
        let mut acc = FrameAccumulator::new(48_000, 2, 20);
        // 20 ms @ 48 kHz stereo = 960 * 2 samples.
        let chunk = vec![0.5f32; 960 * 2 + 100];
        let frames = acc.push(&chunk, 1_000_000);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples_per_channel, 960);
        assert_eq!(frames[0].channels, 2);
        assert_eq!(frames[0].samples.len(), 1920);
        assert!(frames[0].validate().is_ok());
        // 100 leftover samples stay buffered.
        assert_eq!(acc.buffer.len(), 100);
    }

    #[test]
    fn accumulator_pts_advances_by_frame_duration() {
        let mut acc = FrameAccumulator::new(48_000, 1, 20);
        let chunk = vec![0f32; 960 * 3];
        let frames = acc.push(&chunk, 500_000);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].pts_us, 500_000);
        assert_eq!(frames[1].pts_us, 520_000);
        assert_eq!(frames[2].pts_us, 540_000);
    }

    #[test]
    fn oversized_delivery_rejected() {
        let samples = vec![0f32; (MAX_FRAME_SAMPLES + 1) * 2];
        assert!(validate_delivery(&samples, 2, MAX_FRAME_SAMPLES + 1).is_err());

        let samples = vec![0f32; 90];
        assert!(validate_delivery(&samples, 9, 10).is_err());
    }

    #[test]
    fn mismatched_length_rejected() {
        let samples = vec![0f32; 959 * 2 + 1];
        assert!(validate_delivery(&samples, 2, 960).is_err());
    }
}
