//! Error types for remote resource access.

use reqwest::StatusCode;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while opening or reading a remote resource.
///
/// End-of-file is not an error: reads at or past the end return `Ok(0)`,
/// and a short tail read returns `Ok(n)` with fewer bytes than requested.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The initial HEAD request was rejected with a non-2xx status.
    #[error("HEAD {url} returned {status}")]
    Head { url: String, status: StatusCode },

    /// The server did not advertise a positive `Content-Length`.
    #[error("missing or invalid Content-Length")]
    MissingLength,

    /// `Accept-Ranges` did not contain `bytes`.
    #[error("server does not accept byte range requests")]
    RangesUnsupported,

    /// The remote resource changed under us: the server answered 412
    /// Precondition Failed, or a response carried validators that
    /// contradict the snapshot taken at open time.
    #[error("remote resource changed")]
    ResourceChanged,

    /// A response declared a total length that disagrees with the length
    /// observed when the resource was opened.
    #[error("resource length changed from {expected} to {actual}")]
    LengthChanged { expected: u64, actual: u64 },

    /// Any HTTP status other than the accepted ones for the operation.
    #[error("unexpected HTTP status {0}")]
    UnexpectedStatus(StatusCode),

    /// A seek computed a negative position.
    #[error("invalid seek")]
    InvalidSeek,

    /// A demand-paged mapping was requested for an unmappable resource.
    #[error("cannot map resource: {reason}")]
    InvalidMapping { reason: String },

    /// Lower-level HTTP client failure, surfaced unchanged.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Memory-mapping or fault-handler plumbing failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
