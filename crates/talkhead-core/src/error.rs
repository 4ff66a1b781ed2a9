//! Error types for the talkhead serving core.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the serving core.
///
/// Variants follow the recovery policy of the component that raises them:
/// `Corrupt` and `OutOfMemory` are normally handled locally (rebuild, batch
/// back-off) and only escape when recovery is exhausted.
#[derive(Debug, Error)]
pub enum Error {
    /// A source image, audio clip or cache entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A cache entry failed checksum or shape validation.
    #[error("Corrupt cache entry: {0}")]
    Corrupt(String),

    /// An accelerator failed to initialize or could not be acquired in time.
    #[error("Accelerator unavailable: {0}")]
    AcceleratorUnavailable(String),

    /// No accelerator initialized at startup.
    #[error("No accelerator available")]
    NoAcceleratorAvailable,

    /// The backend ran out of accelerator memory.
    #[error("Out of memory on accelerator {accelerator}: {message}")]
    OutOfMemory { accelerator: usize, message: String },

    /// A request could not be parsed or named an unknown command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The job was cancelled because its client went away.
    #[error("Cancelled")]
    Cancelled,

    /// The request was well formed but its values are not acceptable.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An external collaborator (renderer, extractor, compositor, writer) failed.
    #[error("Backend error: {0}")]
    Backend(String),

    /// The service stopped accepting new jobs.
    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable tag reported to clients as `errorType`.
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "notFound",
            Error::Corrupt(_) => "corrupt",
            Error::AcceleratorUnavailable(_) => "acceleratorUnavailable",
            Error::NoAcceleratorAvailable => "noAcceleratorAvailable",
            Error::OutOfMemory { .. } => "outOfMemory",
            Error::Protocol(_) => "protocolError",
            Error::Cancelled => "cancelled",
            Error::InvalidInput(_) => "invalidInput",
            Error::Backend(_) => "backendError",
            Error::ShuttingDown => "shuttingDown",
            Error::Io(_) => "ioError",
            Error::Tensor(_) => "tensorError",
            Error::Serialization(_) => "serializationError",
        }
    }

    /// Whether the owning component recovers from this error on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Corrupt(_) | Error::OutOfMemory { .. })
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::OutOfMemory { .. })
    }
}
