/// Errors from the encoders.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encoder not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no usable encoder element for {0}")]
    NotSupported(String),

    #[error("GStreamer error: {0}")]
    Gstreamer(String),

    #[error("Opus error: {0}")]
    Opus(String),

    #[error("encoder failure: {0}")]
    EncoderFailure(String),
}

impl From<gstreamer::glib::Error> for EncodeError {
    fn from(e: gstreamer::glib::Error) -> Self {
        Self::Gstreamer(e.to_string())
    }
}

impl From<gstreamer::glib::BoolError> for EncodeError {
    fn from(e: gstreamer::glib::BoolError) -> Self {
        Self::Gstreamer(e.to_string())
    }
}

impl From<gstreamer::StateChangeError> for EncodeError {
    fn from(e: gstreamer::StateChangeError) -> Self {
        Self::Gstreamer(e.to_string())
    }
}

impl From<audiopus::Error> for EncodeError {
    fn from(e: audiopus::Error) -> Self {
        Self::Opus(e.to_string())
    }
}
