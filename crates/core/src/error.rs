/// Result alias that carries the custom [`WavtapError`] type.
pub type Result<T> = std::result::Result<T, WavtapError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum WavtapError {
    /// The audio source argument has an unsupported shape.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The backend rejected the bytes as unplayable.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The output device could not be opened or resumed.
    #[error("audio device error: {0}")]
    Device(String),
    /// The operation is not allowed in the current session state.
    #[error("invalid state: {0}")]
    State(&'static str),
    /// Malformed or out of range configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Remote locator could not be fetched.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl WavtapError {
    pub fn invalid_input<T: Into<String>>(msg: T) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn decode<T: Into<String>>(msg: T) -> Self {
        Self::Decode(msg.into())
    }

    pub fn device<T: Into<String>>(msg: T) -> Self {
        Self::Device(msg.into())
    }
}

impl From<serde_json::Error> for WavtapError {
    fn from(value: serde_json::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<realfft::FftError> for WavtapError {
    fn from(value: realfft::FftError) -> Self {
        Self::Device(format!("analysis transform failed: {value}"))
    }
}

impl From<std::convert::Infallible> for WavtapError {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}
