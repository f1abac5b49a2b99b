use std::io;
use std::path::Path;

use thiserror::Error;

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the live restore file system.
#[derive(Debug, Error)]
pub enum Error {
    /// A name that exists in neither layer, or an operation on a removed
    /// name.
    #[error("{0}: no such file or directory")]
    NotFound(String),

    /// Create with the exclusive flag over an existing name.
    #[error("{0}: file already exists")]
    AlreadyExists(String),

    /// A malformed argument: bad extent metadata, an illegal state
    /// transition, an invalid configuration value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An invariant violation implying on-disk or in-memory corruption.
    /// Fatal for the affected handle; the file system enters a panic state.
    #[error("corruption detected: {0}")]
    Corrupt(String),

    /// A failure reported by the operating system.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// An operation that is not applicable to this handle or layer.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The file system previously hit a fatal error and refuses further
    /// work.
    #[error("live restore file system is panicked")]
    Panic,
}

impl Error {
    pub(crate) fn not_found(path: &Path) -> Self {
        Error::NotFound(path.display().to_string())
    }

    pub(crate) fn already_exists(path: &Path) -> Self {
        Error::AlreadyExists(path.display().to_string())
    }

    /// Convert an OS error for `path`, preserving the not-found and
    /// already-exists kinds as their dedicated variants.
    pub(crate) fn from_io(path: &Path, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::not_found(path),
            io::ErrorKind::AlreadyExists => Self::already_exists(path),
            _ => Error::Io(err),
        }
    }
}
