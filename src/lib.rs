//! Live restore file system for embedded storage engines.
//!
//! A database directory is served out of a writable *destination* layered
//! over a read-only *source* (typically a backup). The database is usable
//! immediately: reads of bytes not yet migrated fall through to the source,
//! writes always land in the destination, and background workers copy the
//! remaining byte ranges across until the source can be forgotten. Enough
//! metadata is persisted — a phase state file, per-table extent lists, stop
//! files — for a restore interrupted at any point to resume correctly.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::fs::LiveRestoreFs;
pub use crate::handle::LiveRestoreFile;
pub use crate::metadata::METADATA_PREFIX;
pub use crate::open_flags::OpenFlags;
pub use crate::options::Options;
pub use crate::osfs::OsFile;
pub use crate::osfs::OsFileSystem;
pub use crate::server::Catalog;
pub use crate::server::MigrationServer;
pub use crate::state::Phase;

mod error;
mod extent;
mod fs;
mod handle;
mod metadata;
mod open_flags;
mod options;
mod osfs;
mod server;
mod state;

/// Name of the phase state file persisted in the destination root. Its
/// presence means a live restore has started in this destination; its
/// contents are the current phase name.
pub const STATE_FILE: &str = "WiredTigerLiveRestoreState";

/// Suffix of the zero-byte marker files recording that a name must never be
/// resolved from the source again.
pub const STOP_FILE_SUFFIX: &str = ".stop";

/// Suffix of the staging files used for atomic whole-file copies. Safe to
/// delete at any time.
pub const TEMP_FILE_SUFFIX: &str = ".lr_tmp";

/// Name of the metadata turtle file. It cannot be queued for background
/// migration, so its holes are filled when it is closed instead.
pub const TURTLE_FILE: &str = "WiredTiger.turtle";

/// How a file is used by the engine, which decides how live restore
/// migrates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// A B-tree data file. Migrated extent by extent in the background.
    Data,
    /// An ordinary file. Copied whole, atomically, on first open.
    Regular,
    /// A write-ahead log file. Copied whole, atomically, on first open.
    Log,
    /// A directory. Created in the destination on first touch; its contents
    /// migrate file by file.
    Directory,
}

/// The file system surface both layers speak: the OS adapter implements it
/// over a local directory, and [`LiveRestoreFs`] implements it again on top
/// of two of them.
pub trait FileSystem: Send + Sync + fmt::Debug {
    /// Open or create a file. Fails with [`Error::AlreadyExists`] when
    /// `CREATE | EXCLUSIVE` is given and the file exists, and with
    /// [`Error::NotFound`] when the file is missing and `CREATE` is not.
    fn open_file(
        &self,
        path: &Path,
        file_type: FileType,
        flags: OpenFlags,
    ) -> Result<Arc<dyn FileHandle>>;

    /// Remove a file.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Rename a file.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Size of a file in bytes, by name.
    fn size(&self, path: &Path) -> Result<u64>;

    /// Whether a file exists.
    fn exist(&self, path: &Path) -> Result<bool>;

    /// Names in `directory` starting with `prefix`.
    fn directory_list(&self, directory: &Path, prefix: &str) -> Result<Vec<String>>;

    /// Like [`directory_list`](Self::directory_list) but returns at most one
    /// name.
    fn directory_list_single(&self, directory: &Path, prefix: &str) -> Result<Vec<String>>;

    /// Release any resources held by the file system itself.
    fn terminate(&self) -> Result<()> {
        Ok(())
    }
}

/// An open file.
pub trait FileHandle: Send + Sync + fmt::Debug {
    /// Read exactly `buf.len()` bytes at `offset`. A short read is an
    /// error.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` at `offset`.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Truncate or extend the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Flush the file to stable storage.
    fn sync(&self) -> Result<()>;

    /// Current size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Close the handle.
    fn close(&self) -> Result<()>;
}
