//! Error types for the pipeline and for the collaborators it drives.
//!
//! Only [FetchError] and [AdmissionError] are ever handed back to callers; collaborator errors are logged and folded
//! into the [FetchError] taxonomy inside the pipeline.
use crate::AssetId;

/// Why a fetch did not (or will not) deliver pixels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum FetchError {
    /// The server or cache confirmed the asset does not exist. Sticky until an explicit refetch.
    #[error("asset does not exist")]
    AssetMissing,
    /// Transient network or cache trouble; the caller may try again.
    #[error("network error")]
    NetworkError,
    /// The request was cancelled; not a failure.
    #[error("request cancelled")]
    Cancelled,
    /// Admission control rejected the request; try again next tick.
    #[error("fetch queue is full")]
    QueueFull,
    /// The asset decoded to something structurally unusable. Treated like a missing asset.
    #[error("asset is oversized or malformed")]
    Malformed,
}

impl FetchError {
    /// Whether this outcome permanently marks the asset as unavailable.
    pub fn is_sticky(self) -> bool {
        matches!(self, FetchError::AssetMissing | FetchError::Malformed)
    }
}

/// Rejection reasons for [crate::TextureFetchManager::create_request]. No state is created on rejection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    #[error("a request for {0} is already in flight with an equal or better discard target")]
    InFlight(AssetId),
    #[error("too many requests queued")]
    QueueFull,
    #[error("{0} is known to be missing")]
    AssetMissing(AssetId),
    #[error("the fetch manager is shutting down")]
    ShuttingDown,
}

impl AdmissionError {
    /// Map onto the pipeline taxonomy, or `None` when the rejection just means "already being fetched".
    pub fn as_fetch_error(&self) -> Option<FetchError> {
        match self {
            AdmissionError::InFlight(_) => None,
            AdmissionError::QueueFull => Some(FetchError::QueueFull),
            AdmissionError::AssetMissing(_) => Some(FetchError::AssetMissing),
            AdmissionError::ShuttingDown => Some(FetchError::Cancelled),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ImageError {
    #[error("image has a zero dimension ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("unsupported component count {0}")]
    BadComponents(u8),
    #[error("expected {expected} bytes of pixel data, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
}

/// Returned by [crate::TextureDecoder] implementations.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("corrupt image data: {0}")]
    Corrupt(String),
    #[error("not enough data to decode discard level {0}")]
    Truncated(i32),
    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Returned by [crate::HttpFetcher] implementations when no response was obtained at all.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no capability available for this request")]
    NoCapability,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
