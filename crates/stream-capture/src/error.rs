use crate::frame::FrameError;

/// Errors from the capture backends.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("backend not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no display server found (neither WAYLAND_DISPLAY nor DISPLAY set)")]
    BackendUnavailable,

    #[error("screen capture permission denied by the user")]
    PermissionDenied,

    #[error("capture failed: {0}")]
    CaptureFailure(String),

    #[error("monitor {0} not found")]
    MonitorNotFound(u32),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("display connection error: {0}")]
    Connection(String),

    #[error("failed to spawn capture thread")]
    SpawnThread(#[source] std::io::Error),

    #[error("operation timed out")]
    Timeout,
}

/// Errors from the audio backends.
#[derive(Debug, thiserror::Error)]
pub enum AudioCaptureError {
    #[error("audio backend not initialized")]
    NotInitialized,

    #[error("no audio backend available")]
    BackendUnavailable,

    #[error("audio device {0:?} not found")]
    DeviceNotFound(String),

    #[error("failed to create PipeWire main loop")]
    MainLoop,

    #[error("failed to create PipeWire context")]
    Context,

    #[error("failed to connect to PipeWire")]
    Connect,

    #[error("failed to create PipeWire audio stream")]
    CreateStream,

    #[error("failed to register audio stream listener")]
    RegisterListener,

    #[error("failed to connect audio stream")]
    StreamConnect,

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("failed to spawn audio thread")]
    SpawnThread(#[source] std::io::Error),
}
