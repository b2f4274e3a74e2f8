//! Error kinds and their mapping to POSIX errno.
//!
//! Every closure submitted to the worker pool collapses whatever went wrong
//! into a single [`FsError`], which the facade converts to an errno at the
//! FUSE boundary. Internal exceptional conditions (a misused executor, a
//! malformed listing) become variants here rather than panics.

use thiserror::Error;

/// Errors produced by the engine.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// DNS/connect/SSL/partial-transfer class failure, retried inside the request executor.
    #[error("transport error: {0}")]
    TransportRetryable(String),

    /// Transport failure surviving all retries.
    #[error("transport error after retries exhausted: {0}")]
    TransportFatal(String),

    /// Deadline exceeded on an attempt; the executor that produced this is discarded.
    #[error("request timed out")]
    TimedOut,

    /// 4xx response the hook declined to retry.
    #[error("HTTP client error ({0})")]
    HttpClient(u16),

    /// 5xx response the hook declined to retry (or retries were exhausted).
    #[error("HTTP server error ({0})")]
    HttpServer(u16),

    /// Object exists but is the wrong kind for the requested operation.
    #[error("not a directory")]
    NotADirectory,

    /// Object exists but is the wrong kind for the requested operation.
    #[error("is a directory")]
    IsADirectory,

    /// No object at this path.
    #[error("no such object")]
    NotFound,

    /// Store rejected the credentials/signature.
    #[error("permission denied")]
    PermissionDenied,

    /// Pool is tearing down; pending and future work items fail with this.
    #[error("shutting down")]
    Shutdown,

    /// Malformed listing XML or unparseable user metadata.
    #[error("corrupt response: {0}")]
    Corrupt(String),

    /// A file handle id not present in the open-file table.
    #[error("bad file handle")]
    BadHandle,

    /// Caller misuse of the executor (body on GET, `init` after cancellation, etc).
    /// These are programmer errors, not operational ones.
    #[error("executor misuse: {0}")]
    Misuse(String),
}

impl FsError {
    /// Maps this error to the POSIX errno the facade returns to FUSE.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::TransportRetryable(_) | FsError::TransportFatal(_) => libc::EIO,
            FsError::TimedOut => libc::EIO,
            FsError::HttpClient(404) => libc::ENOENT,
            FsError::HttpClient(403) => libc::EACCES,
            FsError::HttpClient(_) => libc::EIO,
            FsError::HttpServer(_) => libc::EIO,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::Shutdown => libc::ESHUTDOWN,
            FsError::Corrupt(_) => libc::EIO,
            FsError::BadHandle => libc::EBADF,
            FsError::Misuse(_) => libc::EIO,
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        FsError::Corrupt(format!("scratch file I/O: {e}"))
    }
}

/// Result type threaded through the engine.
pub type FsResult<T> = Result<T, FsError>;
