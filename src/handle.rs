//! A file handle composing a writable destination file with an optional
//! read-only source file. Reads are routed through the extent list to
//! whichever layer holds the bytes; writes always land in the destination
//! and shrink the holes.

use std::cmp::min;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::info;
use log::trace;
use parking_lot::RwLock;

use crate::Error;
use crate::FileHandle;
use crate::FileType;
use crate::Result;
use crate::TURTLE_FILE;
use crate::extent::ExtentList;
use crate::extent::ReadPlan;
use crate::fs::Shared;
use crate::metadata;

/// How often the hole-filling loop reports progress on a long copy.
const PROGRESS_MSG_PERIOD_SECS: u64 = 20;

/// State protected by the handle's extent lock. Anything observing or
/// changing the hole set goes through this struct.
#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) source: Option<Arc<dyn FileHandle>>,
    pub(crate) source_size: u64,
    pub(crate) holes: ExtentList,
    pub(crate) complete: bool,
    pub(crate) newly_created: bool,
}

/// An open file in a live restore file system.
#[derive(Debug)]
pub struct LiveRestoreFile {
    name: PathBuf,
    file_type: FileType,
    dest: Arc<dyn FileHandle>,
    shared: Arc<Shared>,
    inner: RwLock<Inner>,
}

impl LiveRestoreFile {
    pub(crate) fn new(
        name: PathBuf,
        file_type: FileType,
        dest: Arc<dyn FileHandle>,
        shared: Arc<Shared>,
        inner: Inner,
    ) -> Self {
        LiveRestoreFile {
            name,
            file_type,
            dest,
            shared,
            inner: RwLock::new(inner),
        }
    }

    /// The engine-visible path this handle was opened with.
    pub fn name(&self) -> &Path {
        &self.name
    }

    /// How the engine uses this file.
    pub fn file_type(&self) -> FileType {
        self.file_type
    }

    /// Whether every byte of the file is present in the destination.
    pub fn is_complete(&self) -> bool {
        self.inner.read().complete
    }

    fn reject_directory(&self, what: &'static str) -> Result<()> {
        if self.file_type == FileType::Directory {
            return Err(Error::Unsupported(what));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`. Bytes still missing from the
    /// destination come from the source at the same offset; a read that
    /// straddles the migration frontier is stitched together from both
    /// layers.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reject_directory("read on a directory handle")?;
        if buf.is_empty() {
            return Ok(());
        }
        trace!("read {}: {offset}, {}", self.name.display(), buf.len());

        let inner = self.inner.read();
        let source = match &inner.source {
            Some(source) if !inner.complete => source,
            _ => return self.dest.read(offset, buf),
        };
        let plan = match inner.holes.classify(offset, buf.len() as u64) {
            Ok(plan) => plan,
            Err(err) => {
                self.shared.set_panic();
                return Err(err);
            }
        };
        match plan {
            ReadPlan::Destination => self.dest.read(offset, buf),
            ReadPlan::Source => source.read(offset, buf),
            ReadPlan::Partial(hole) => {
                let migrated = (hole.off - offset) as usize;
                trace!(
                    "    partial read from destination ({offset}, {migrated}) and source ({}, {})",
                    hole.off,
                    buf.len() - migrated
                );
                let (head, tail) = buf.split_at_mut(migrated);
                self.dest.read(offset, head)?;
                source.read(hole.off, tail)
            }
        }
    }

    /// Write `buf` at `offset` into the destination, then drop the written
    /// range from the hole set. The extent shrinks only once the write has
    /// succeeded, so a concurrent reader either sees the new destination
    /// bytes or still fetches the old ones from the source.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.reject_directory("write on a directory handle")?;
        if buf.is_empty() {
            return Ok(());
        }
        trace!("write {}: {offset}, {}", self.name.display(), buf.len());
        let mut inner = self.inner.write();
        self.write_locked(&mut inner, offset, buf)
    }

    fn write_locked(&self, inner: &mut Inner, offset: u64, buf: &[u8]) -> Result<()> {
        self.dest.write(offset, buf)?;
        inner.holes.remove_range(offset, buf.len() as u64);
        Ok(())
    }

    /// Truncate (or extend) the destination to `len` bytes. The dropped or
    /// newly appended range will never be read from the source, so its
    /// extents go away with it.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.reject_directory("truncate on a directory handle")?;
        let old_len = self.dest.size()?;
        if old_len == len {
            return Ok(());
        }
        debug!(
            "truncating file {} from {old_len} to {len}",
            self.name.display()
        );
        let mut inner = self.inner.write();
        inner
            .holes
            .remove_range(old_len.min(len), old_len.abs_diff(len));
        self.dest.truncate(len)
    }

    /// Flush the destination. The source is read-only and has nothing to
    /// sync.
    pub fn sync(&self) -> Result<()> {
        self.dest.sync()
    }

    /// The destination file's size in bytes.
    pub fn size(&self) -> Result<u64> {
        self.dest.size()
    }

    /// Rebuild the hole set from the string stored in the table's metadata.
    /// `None` or an empty string means no holes are recorded: a freshly
    /// created destination keeps its seeded full-file hole, anything else is
    /// complete.
    pub fn import_extents(&self, config: Option<&str>) -> Result<()> {
        let phase = self.shared.phase();
        let mut inner = self.inner.write();
        let empty = config.is_none_or(str::is_empty);

        if phase.migration_complete() {
            if !empty {
                self.shared.set_panic();
                return Err(Error::Corrupt(format!(
                    "{}: metadata extent list is not empty after background migration has finished",
                    self.name.display()
                )));
            }
            return Ok(());
        }
        if !inner.holes.is_empty() {
            // The open path already seeded the list; the metadata must not
            // disagree with it.
            if !empty {
                self.shared.set_panic();
                return Err(Error::Corrupt(format!(
                    "{}: extent list not empty while trying to import",
                    self.name.display()
                )));
            }
            return Ok(());
        }
        let Some(config) = config.filter(|s| !s.is_empty()) else {
            if inner.newly_created {
                // Nothing recorded yet for a destination this mount created:
                // the whole file still lives in the source.
                let source_size = inner.source_size;
                inner.holes.insert_full(source_size);
            } else {
                inner.complete = true;
                inner.source = None;
            }
            return Ok(());
        };
        trace!(
            "{} metadata extent list string: {config}",
            self.name.display()
        );
        inner.holes = metadata::decode_extents(config, inner.source_size)?;
        Ok(())
    }

    /// Render the hole set for storage in the table's metadata. Returns
    /// `None` once the file is complete or migration has finished; a missing
    /// key is how "no holes" is recorded.
    pub fn export_extents(&self) -> Option<String> {
        if self.shared.phase().migration_complete() {
            return None;
        }
        let inner = self.inner.read();
        if inner.complete {
            return None;
        }
        let encoded = metadata::encode_extents(&inner.holes);
        trace!(
            "appending live restore extents ({encoded}) to metadata for {}",
            self.name.display()
        );
        Some(encoded)
    }

    /// Fill one leading chunk of the lowest hole. Returns true once no holes
    /// remain.
    fn fill_one_hole(
        &self,
        buf: &mut [u8],
        start: &Instant,
        msg_count: &mut u64,
    ) -> Result<bool> {
        let mut inner = self.inner.write();
        let Some(hole) = inner.holes.first() else {
            return Ok(true);
        };
        // Large holes are drained a read_size chunk at a time; the write
        // below shrinks the hole in place, so the next iteration picks up
        // where this one left off.
        let chunk = min(hole.len, buf.len() as u64) as usize;

        let elapsed_secs = start.elapsed().as_secs();
        if elapsed_secs / PROGRESS_MSG_PERIOD_SECS > *msg_count {
            *msg_count = elapsed_secs / PROGRESS_MSG_PERIOD_SECS;
            info!(
                "live restore running on {} for {elapsed_secs} seconds, currently copying \
                 offset {} of {} bytes",
                self.name.display(),
                hole.off,
                inner.source_size
            );
        }
        trace!(
            "    background read {}: {}, {chunk}",
            self.name.display(),
            hole.off
        );
        let source = match inner.source.clone() {
            Some(source) => source,
            None => {
                self.shared.set_panic();
                return Err(Error::Corrupt(format!(
                    "{}: holes remain but the source handle is gone",
                    self.name.display()
                )));
            }
        };
        source.read(hole.off, &mut buf[..chunk])?;
        self.write_locked(&mut inner, hole.off, &buf[..chunk])?;
        Ok(false)
    }

    /// Copy every remaining byte from the source into the destination, in
    /// ascending offset order. The extent lock is released between chunks so
    /// foreground I/O interleaves. Once the hole set empties the destination
    /// is synced, the source handle is dropped and the file is complete.
    pub fn fill_holes(&self) -> Result<()> {
        let mut buf = vec![0; self.shared.read_size];
        let start = Instant::now();
        let mut msg_count = 0;
        loop {
            if self.shared.panicked() {
                return Err(Error::Panic);
            }
            if self.fill_one_hole(&mut buf, &start, &mut msg_count)? {
                break;
            }
            thread::sleep(Duration::from_nanos(10_000));
        }
        // A copy write lost in a crash would leave its hole behind and the
        // copy would simply run again on restart, but sync rather than
        // depend on that property.
        self.dest.sync()?;
        let mut inner = self.inner.write();
        inner.complete = true;
        inner.source = None;
        Ok(())
    }

    /// Close the handle. The metadata turtle file cannot be queued for
    /// background migration, so it is the one file whose remaining holes are
    /// filled here; it is small.
    pub fn close(&self) -> Result<()> {
        debug!("closing file: {}", self.name.display());
        if self.file_type == FileType::Data
            && self.name.file_name().is_some_and(|n| n == TURTLE_FILE)
        {
            debug!("filling holes for the turtle file");
            self.fill_holes()?;
        }
        let mut inner = self.inner.write();
        inner.source = None;
        inner.holes.clear();
        self.dest.close()
    }
}

impl FileHandle for LiveRestoreFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        LiveRestoreFile::read(self, offset, buf)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        LiveRestoreFile::write(self, offset, buf)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        LiveRestoreFile::truncate(self, len)
    }

    fn sync(&self) -> Result<()> {
        LiveRestoreFile::sync(self)
    }

    fn size(&self) -> Result<u64> {
        LiveRestoreFile::size(self)
    }

    fn close(&self) -> Result<()> {
        LiveRestoreFile::close(self)
    }
}
