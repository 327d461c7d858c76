/// Result alias that carries the custom [`BeatSyncError`] type.
pub type Result<T> = std::result::Result<T, BeatSyncError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum BeatSyncError {
    /// Invalid configuration detected at construction time. Always fatal.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A declared band does not fit inside `(0, nyquist)`.
    #[error("invalid band range for `{tag}`: {low_hz} Hz..{high_hz} Hz (nyquist {nyquist} Hz)")]
    InvalidBandRange {
        tag: String,
        low_hz: f32,
        high_hz: f32,
        nyquist: f32,
    },
    /// No usable audio input. Fatal at start.
    #[error("audio device error: {0}")]
    Device(String),
    /// A single frame could not be analysed. Recovered locally.
    #[error("transient processing error: {0}")]
    TransientProcessing(String),
    /// The movement executor rejected or failed a command.
    #[error("actuation error: {0}")]
    Actuation(String),
    /// A beat listener failed.
    #[error("listener error: {0}")]
    Listener(String),
    /// Shared state is unusable, typically a poisoned lock.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl BeatSyncError {
    /// Creates a configuration error from the provided message.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    /// Creates an actuation error from the provided message.
    pub fn actuation<T: Into<String>>(msg: T) -> Self {
        Self::Actuation(msg.into())
    }

    /// Creates a listener error from the provided message.
    pub fn listener<T: Into<String>>(msg: T) -> Self {
        Self::Listener(msg.into())
    }

    /// Returns `true` for errors that must prevent startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::InvalidBandRange { .. } | Self::Device(_)
        )
    }
}

impl From<realfft::FftError> for BeatSyncError {
    fn from(value: realfft::FftError) -> Self {
        Self::TransientProcessing(value.to_string())
    }
}
