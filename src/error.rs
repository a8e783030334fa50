use crate::compress::CompressError;
use crate::protocol::StatusCode;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown accession: {0}")]
    UnknownAccession(String),

    #[error("unknown assembly: {0}")]
    UnknownAssembly(String),

    #[error("methylome size mismatch (got {got}, expected {expected})")]
    MethylomeSizeMismatch { got: u32, expected: u32 },

    #[error("invalid offsets: {0}")]
    InvalidOffsets(String),

    #[error("server busy")]
    ServerBusy,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("compression error: {0}")]
    Compress(#[from] CompressError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The wire status reported to a client when this error terminates a
    /// request. File-level failures never reach the wire; they surface as
    /// `InternalError` only when triggered by a lazy load.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) | Error::Parse(_) | Error::UnsupportedVersion(_) => {
                StatusCode::BadRequest
            }
            Error::UnknownAccession(_) => StatusCode::UnknownAccession,
            Error::UnknownAssembly(_) => StatusCode::UnknownAssembly,
            Error::MethylomeSizeMismatch { .. } => StatusCode::MethylomeSizeMismatch,
            Error::InvalidOffsets(_) => StatusCode::InvalidOffsets,
            Error::ServerBusy => StatusCode::ServerBusy,
            Error::Integrity(_)
            | Error::Compress(_)
            | Error::Io(_)
            | Error::Metadata(_)
            | Error::Internal(_) => StatusCode::InternalError,
        }
    }
}
