use std::path::PathBuf;

use crate::Error;
use crate::Result;

pub(crate) const DEFAULT_THREADS_MAX: usize = 8;
pub(crate) const DEFAULT_READ_SIZE: usize = 1 << 20;

/// Live restore configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Options {
    /// The read-only source directory the database is restored from.
    pub source: PathBuf,
    /// Number of background migration threads. Zero disables the background
    /// server entirely; foreground access still works and migration resumes
    /// on a later mount.
    pub threads_max: usize,
    /// Chunk size, in bytes, used for both atomic copies and background hole
    /// filling. Must be a power of two.
    pub read_size: usize,
    /// Log subdirectory inside the destination, relative to the destination
    /// home. Stop files created in it are cleaned up alongside the root's.
    pub log_path: Option<PathBuf>,
}

impl Options {
    /// Build a configuration restoring from `source` with default tunables.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Options {
            source: source.into(),
            threads_max: DEFAULT_THREADS_MAX,
            read_size: DEFAULT_READ_SIZE,
            log_path: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.read_size.is_power_of_two() {
            return Err(Error::InvalidArgument(
                "the live restore read size must be a power of two".to_string(),
            ));
        }
        if let Some(log_path) = &self.log_path {
            if log_path.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "the log path '{}' must be relative to the destination",
                    log_path.display()
                )));
            }
        }
        Ok(())
    }
}
