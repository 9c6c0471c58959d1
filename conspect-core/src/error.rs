use thiserror::Error;

/// All errors produced by conspect-core.
#[derive(Debug, Error)]
pub enum ConspectError {
    #[error("permission denied for {modality}")]
    PermissionDenied { modality: &'static str },

    #[error("screen capture failed: {0}")]
    CaptureFailed(String),

    #[error("OCR engine failed to initialize: {0}")]
    OcrInit(String),

    #[error("OCR recognition failed: {0}")]
    OcrRecognize(String),

    #[error("engine is already running")]
    AlreadyRunning,

    #[error("engine is not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ConspectError>;
