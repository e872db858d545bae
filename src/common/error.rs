use thiserror::Error;

#[derive(Error, Debug)]
pub enum AttendanceError {
    /// Connect, send or receive failure on a server channel.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed chunk header, truncated message or unparseable payload.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A database key that is not a numeric vector.
    #[error("Key format error: {0}")]
    KeyFormat(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Preview error: {0}")]
    Preview(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("ORT error: {0}")]
    Ort(#[from] ort::OrtError),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AttendanceError>;
