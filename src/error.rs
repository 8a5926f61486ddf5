//! Error taxonomy shared by the library and the HTTP layer.
//!
//! Client mistakes (bad references, tampered tokens, unknown tasks) are kept
//! apart from upstream failures so the backend can map each one onto a
//! single response code.

use thiserror::Error;

/// A user supplied video reference that cannot be canonicalized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("invalid URL: {0}")]
    Malformed(String),
    #[error("invalid URL scheme: {0}")]
    Scheme(String),
    #[error("invalid URL host: {0}")]
    Host(String),
    #[error("invalid URL path: {0}")]
    Path(String),
    #[error("missing video ID in URL")]
    MissingVideoId,
    #[error("invalid video ID: {0}")]
    VideoId(String),
}

/// A format token that does not decode into the expected layout.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatTokenError {
    #[error("format token is not valid base64")]
    Encoding,
    #[error("format token checksum mismatch")]
    Checksum,
    #[error("format token has {found} fields, expected {expected}")]
    FieldCount { expected: usize, found: usize },
    #[error("format token kind `{0}` does not match the requested layout")]
    Kind(String),
    #[error("format token field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("format token field `{0}` is invalid")]
    InvalidField(&'static str),
}

/// Failure while fetching or decoding video metadata.
///
/// Cloneable so every caller waiting on the same single-flight fetch
/// receives an identical error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("failed to launch info extractor: {0}")]
    Spawn(String),
    #[error("info extractor exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
    #[error("failed to parse video info: {0}")]
    Parse(String),
    #[error("video info is missing mandatory field `{0}`")]
    MissingField(&'static str),
}

/// Registry level failures surfaced synchronously to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("download task not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Token(#[from] FormatTokenError),
}

/// Terminal failure recorded on a task. Never returned from the enqueue path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    #[error("Download cancelled by user")]
    Cancelled,
    #[error("Failed to start download: {0}")]
    Spawn(String),
    #[error("Download failed: {0}")]
    Exit(String),
    #[error("Failed to store downloaded file: {0}")]
    Relocation(String),
}
