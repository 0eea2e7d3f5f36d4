use thiserror::Error;

pub type CaptionResult<T> = std::result::Result<T, CaptionError>;

#[derive(Debug, Error)]
pub enum CaptionError {
    /// Inconsistent options, or data that can never produce a valid step
    /// (e.g. a fully padded batch).
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("shape mismatch for {slot}: expected {expected}, got {actual}")]
    Shape {
        slot: &'static str,
        expected: String,
        actual: String,
    },

    /// A weight file, checkpoint or image that must exist does not.
    #[error("resource error: {0}")]
    Resource(String),

    /// Numerical failure during a step (non-finite loss or gradients).
    #[error("computation error: {0}")]
    Computation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl CaptionError {
    pub fn config(msg: impl Into<String>) -> Self {
        CaptionError::Configuration(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        CaptionError::Resource(msg.into())
    }
}
