use crate::archive::CodecError;
use crate::captioning::CaptionError;
use thiserror::Error;

/// Errors surfaced by dataset operations
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(String),

    /// A tagging job finished labeling without a single caption
    #[error("no captions collected from {images} images")]
    NoCaptions { images: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Caption(#[from] CaptionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DatasetError {
    /// Short machine-readable code used in logs and API envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            DatasetError::NotFound(_) => "NOT_FOUND",
            DatasetError::Conflict(_) => "CONFLICT",
            DatasetError::InvalidInput(_) => "INVALID_INPUT",
            DatasetError::Store(_) => "STORE_ERROR",
            DatasetError::NoCaptions { .. } => "NO_CAPTIONS",
            DatasetError::Codec(_) => "CODEC_ERROR",
            DatasetError::Caption(_) => "SERVICE_ERROR",
            DatasetError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<sqlx::Error> for DatasetError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => DatasetError::NotFound("record".to_string()),
            other => DatasetError::Store(other.to_string()),
        }
    }
}

pub type Result<T, E = DatasetError> = std::result::Result<T, E>;
