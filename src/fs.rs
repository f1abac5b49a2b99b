//! The live restore file system: a directory view composing the writable
//! destination with the read-only source, plus the stop-file bookkeeping
//! that records which names must never fall back to the source again.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;

use parking_lot::RwLock;

use crate::Error;
use crate::FileHandle;
use crate::FileSystem;
use crate::FileType;
use crate::OpenFlags;
use crate::Options;
use crate::Result;
use crate::STOP_FILE_SUFFIX;
use crate::TEMP_FILE_SUFFIX;
use crate::extent::ExtentList;
use crate::handle::Inner;
use crate::handle::LiveRestoreFile;
use crate::osfs::OsFileSystem;
use crate::state;
use crate::state::Phase;

/// Which layer a name resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layer {
    Destination,
    Source,
}

/// State shared between the file system, its handles and the background
/// migration server.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) os: Box<dyn FileSystem>,
    pub(crate) dest_home: PathBuf,
    pub(crate) source_home: PathBuf,
    pub(crate) phase: RwLock<Phase>,
    pub(crate) panic: AtomicBool,
    pub(crate) read_size: usize,
    pub(crate) threads_max: usize,
    pub(crate) log_path: Option<PathBuf>,
}

impl Shared {
    pub(crate) fn phase(&self) -> Phase {
        let phase = *self.phase.read();
        debug_assert_ne!(phase, Phase::None, "state not initialized");
        phase
    }

    pub(crate) fn set_panic(&self) {
        if !self.panic.swap(true, Ordering::SeqCst) {
            error!("live restore file system entering panic state");
        }
    }

    pub(crate) fn panicked(&self) -> bool {
        self.panic.load(Ordering::SeqCst)
    }
}

/// Append a suffix to the final component of a path.
fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    name.into()
}

/// A file system serving a database out of a destination directory while the
/// contents of a source directory are still being migrated into it.
#[derive(Debug)]
pub struct LiveRestoreFs {
    pub(crate) shared: Arc<Shared>,
}

impl LiveRestoreFs {
    /// Compose `dest_home` over the source named in `options`. Validates
    /// both directories against the persisted phase and creates or adopts
    /// the state file.
    pub fn new(dest_home: impl Into<PathBuf>, options: Options) -> Result<Self> {
        options.validate()?;
        let os: Box<dyn FileSystem> = Box::new(OsFileSystem::new());

        // The source directory must at least be openable; its contents are
        // checked below.
        os.open_file(&options.source, FileType::Directory, OpenFlags::empty())?
            .close()?;

        let shared = Arc::new(Shared {
            os,
            dest_home: dest_home.into(),
            source_home: options.source,
            phase: RwLock::new(Phase::None),
            panic: AtomicBool::new(false),
            read_size: options.read_size,
            threads_max: options.threads_max,
            log_path: options.log_path,
        });
        state::validate_directories(&shared)?;
        state::init_state(&shared)?;
        Ok(LiveRestoreFs { shared })
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    /// Whether a fatal error has put the file system in a panic state.
    pub fn panicked(&self) -> bool {
        self.shared.panicked()
    }

    /// Record a fatal failure; every long-running copy loop aborts at its
    /// next check.
    pub fn set_panic(&self) {
        self.shared.set_panic();
    }

    /// Advance out of the log copy phase once recovery has opened (and
    /// thereby copied) its log files. A no-op when already past it.
    pub fn finish_log_copy(&self) -> Result<()> {
        if self.shared.phase() == Phase::LogCopy {
            state::set_state(&self.shared, Phase::BackgroundMigration)?;
        }
        Ok(())
    }

    /// Advance the phase machine one step, persisting the new phase first.
    /// Anything but the immediate successor of the current phase is an
    /// error; the restore lifecycle only moves forward. Most embedders never
    /// call this: the migration server drives the chain itself.
    pub fn set_state(&self, phase: Phase) -> Result<()> {
        state::set_state(&self.shared, phase)
    }

    /// Map an engine-visible path to the backing file in one layer. Caller
    /// paths always begin with the destination home.
    fn backing_path(&self, layer: Layer, name: &Path) -> PathBuf {
        let Ok(relative) = name.strip_prefix(&self.shared.dest_home) else {
            panic!(
                "provided name '{}' does not start with the destination home '{}'",
                name.display(),
                self.shared.dest_home.display()
            );
        };
        match layer {
            Layer::Destination => name.to_path_buf(),
            Layer::Source => self.shared.source_home.join(relative),
        }
    }

    fn has_file(&self, layer: Layer, name: &Path) -> Result<bool> {
        self.shared.os.exist(&self.backing_path(layer, name))
    }

    /// Resolve a name to the layer holding it: the destination wins, and the
    /// source is only consulted while migration is still running.
    fn find_layer(&self, name: &Path) -> Result<Option<Layer>> {
        if self.has_file(Layer::Destination, name)? {
            return Ok(Some(Layer::Destination));
        }
        if !self.shared.phase().migration_complete() && self.has_file(Layer::Source, name)? {
            return Ok(Some(Layer::Source));
        }
        Ok(None)
    }

    fn stop_file_path(&self, name: &Path) -> PathBuf {
        with_suffix(&self.backing_path(Layer::Destination, name), STOP_FILE_SUFFIX)
    }

    fn has_stop_file(&self, name: &Path) -> Result<bool> {
        let exists = self.shared.os.exist(&self.stop_file_path(name))?;
        trace!("stop file check for {}: {exists}", name.display());
        Ok(exists)
    }

    /// Record that `name` must never be resolved from the source again.
    /// Pointless (and skipped) once migration has finished. Stop files are
    /// written durably: losing one in a crash would silently resurrect
    /// source data.
    fn create_stop_file(&self, name: &Path) -> Result<()> {
        if self.shared.phase().migration_complete() {
            return Ok(());
        }
        let path = self.stop_file_path(name);
        debug!("creating stop file: {}", path.display());
        self.shared
            .os
            .open_file(
                &path,
                FileType::Data,
                OpenFlags::CREATE | OpenFlags::DURABLE,
            )?
            .close()
    }

    /// Open (or create) a file, composing the two layers according to the
    /// file type, the migration phase and any stop file for the name.
    pub fn open(
        &self,
        name: &Path,
        file_type: FileType,
        flags: OpenFlags,
    ) -> Result<Arc<LiveRestoreFile>> {
        if file_type == FileType::Directory {
            return self.open_directory(name, flags);
        }
        let phase = self.shared.phase();
        let dest_exist = self.has_file(Layer::Destination, name)?;
        let mut check_source = !phase.migration_complete();
        let mut have_stop = false;
        if check_source {
            have_stop = self.has_stop_file(name)?;
            check_source = !have_stop;
        }
        let source_exist = check_source && self.has_file(Layer::Source, name)?;

        let create = flags.contains(OpenFlags::CREATE);
        if (dest_exist || source_exist) && create && flags.contains(OpenFlags::EXCLUSIVE) {
            return Err(Error::already_exists(name));
        }
        if !dest_exist && !source_exist && !create {
            return Err(Error::not_found(name));
        }
        if !dest_exist && have_stop && !create {
            // The file was deleted in the destination; the source copy no
            // longer counts.
            return Err(Error::not_found(name));
        }

        match file_type {
            FileType::Data => {
                self.open_data(name, flags, phase, have_stop, dest_exist, source_exist)
            }
            FileType::Regular | FileType::Log => {
                self.open_regular(name, file_type, flags, dest_exist, source_exist)
            }
            FileType::Directory => unreachable!("directories are handled above"),
        }
    }

    /// Data files are the B-trees: the only type whose holes are tracked
    /// rather than copied whole on open.
    fn open_data(
        &self,
        name: &Path,
        flags: OpenFlags,
        phase: Phase,
        have_stop: bool,
        dest_exist: bool,
        source_exist: bool,
    ) -> Result<Arc<LiveRestoreFile>> {
        let mut source = None;
        let mut source_size = 0;
        if !(have_stop || phase.migration_complete() || !source_exist) {
            let handle = self.shared.os.open_file(
                &self.backing_path(Layer::Source, name),
                FileType::Data,
                OpenFlags::READONLY,
            )?;
            source_size = handle.size()?;
            debug_assert_ne!(source_size, 0);
            debug!(
                "{}: opening source file, source size is {source_size}",
                name.display()
            );
            source = Some(handle);
        }
        let complete = source.is_none();

        let mut dest_flags = flags;
        if !dest_exist {
            dest_flags |= OpenFlags::CREATE;
        }
        let dest = self.shared.os.open_file(
            &self.backing_path(Layer::Destination, name),
            FileType::Data,
            dest_flags,
        )?;

        let mut holes = ExtentList::default();
        let mut newly_created = false;
        if !complete && !dest_exist {
            // A fresh destination backed by a source file: give it the
            // source's length up front (a raw truncate, bypassing the extent
            // accounting) and start with one hole covering everything.
            debug!(
                "{}: creating destination file backed by the source file",
                name.display()
            );
            dest.truncate(source_size)?;
            holes.insert_full(source_size);
            newly_created = true;
        }
        Ok(Arc::new(LiveRestoreFile::new(
            name.to_path_buf(),
            FileType::Data,
            dest,
            self.shared.clone(),
            Inner {
                source,
                source_size,
                holes,
                complete,
                newly_created,
            },
        )))
    }

    /// Log and regular files are copied whole, atomically, the first time
    /// they are opened; afterwards they live entirely in the destination.
    fn open_regular(
        &self,
        name: &Path,
        file_type: FileType,
        flags: OpenFlags,
        dest_exist: bool,
        source_exist: bool,
    ) -> Result<Arc<LiveRestoreFile>> {
        if !dest_exist && source_exist {
            self.atomic_copy(name, file_type)?;
        }
        let mut dest_flags = flags;
        if !dest_exist {
            dest_flags |= OpenFlags::CREATE;
        }
        let dest = self.shared.os.open_file(
            &self.backing_path(Layer::Destination, name),
            file_type,
            dest_flags,
        )?;
        Ok(Arc::new(LiveRestoreFile::new(
            name.to_path_buf(),
            file_type,
            dest,
            self.shared.clone(),
            Inner {
                source: None,
                source_size: 0,
                holes: ExtentList::default(),
                complete: true,
                newly_created: false,
            },
        )))
    }

    /// Directories are created in the destination on first touch (their
    /// contents migrate file by file) and are immediately complete. The
    /// engine never removes or renames a directory, so no stop files.
    fn open_directory(&self, name: &Path, flags: OpenFlags) -> Result<Arc<LiveRestoreFile>> {
        let dest_exist = self.has_file(Layer::Destination, name)?;
        let source_exist = self.has_file(Layer::Source, name)?;
        if !dest_exist && !source_exist && !flags.contains(OpenFlags::CREATE) {
            return Err(Error::not_found(name));
        }
        let mut dest_flags = flags;
        if !dest_exist {
            dest_flags |= OpenFlags::CREATE;
        }
        let dest = self.shared.os.open_file(
            &self.backing_path(Layer::Destination, name),
            FileType::Directory,
            dest_flags,
        )?;
        Ok(Arc::new(LiveRestoreFile::new(
            name.to_path_buf(),
            FileType::Directory,
            dest,
            self.shared.clone(),
            Inner {
                source: None,
                source_size: 0,
                holes: ExtentList::default(),
                complete: true,
                newly_created: false,
            },
        )))
    }

    /// Copy a whole file from the source to the destination through a
    /// `.lr_tmp` staging file. The final rename is the commit point: a crash
    /// at any earlier moment leaves only the staging file, which the next
    /// open deletes and the copy restarts from scratch.
    fn atomic_copy(&self, name: &Path, file_type: FileType) -> Result<()> {
        debug_assert!(!self.shared.phase().migration_complete());
        debug!(
            "atomically copying {file_type:?} file {} from source to destination",
            name.display()
        );

        let os = &self.shared.os;
        let source_path = self.backing_path(Layer::Source, name);
        let dest_path = self.backing_path(Layer::Destination, name);
        let tmp_path = with_suffix(&dest_path, TEMP_FILE_SUFFIX);

        if os.exist(&tmp_path)? {
            warn!(
                "found existing temporary file {}, deleting it",
                tmp_path.display()
            );
            os.remove(&tmp_path)?;
        }

        let source = os.open_file(&source_path, file_type, OpenFlags::READONLY)?;
        let dest = os.open_file(
            &tmp_path,
            file_type,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        )?;
        let source_size = source.size()?;

        let mut buf = vec![0; self.shared.read_size];
        let mut offset = 0;
        while offset < source_size {
            let chunk = (source_size - offset).min(buf.len() as u64) as usize;
            source.read(offset, &mut buf[..chunk])?;
            dest.write(offset, &buf[..chunk])?;
            offset += chunk as u64;
            // The copy can take a long time; bail out if the system has
            // entered a panic state in the meantime.
            if self.shared.panicked() {
                return Err(Error::Panic);
            }
        }
        dest.sync()?;
        dest.close()?;
        source.close()?;
        os.rename(&tmp_path, &dest_path)
    }

    /// Remove a file. Only the destination copy can be deleted; a stop file
    /// records that the name is gone no matter what the source still holds.
    pub fn remove(&self, name: &Path) -> Result<()> {
        let Some(layer) = self.find_layer(name)? else {
            return Ok(());
        };
        if layer == Layer::Destination {
            self.shared
                .os
                .remove(&self.backing_path(Layer::Destination, name))?;
        }
        self.create_stop_file(name)
    }

    /// Rename a destination file, leaving stop files for both names so
    /// neither ever falls back to the source.
    pub fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        debug!("renaming file from {} to {}", from.display(), to.display());
        let Some(layer) = self.find_layer(from)? else {
            return Err(Error::not_found(from));
        };
        if layer != Layer::Destination {
            return Err(Error::InvalidArgument(format!(
                "rename of '{}' failed as the file does not exist in the destination",
                from.display()
            )));
        }
        self.shared.os.rename(
            &self.backing_path(Layer::Destination, from),
            &self.backing_path(Layer::Destination, to),
        )?;
        self.create_stop_file(to)?;
        self.create_stop_file(from)
    }

    /// Size of the destination copy if present, otherwise of the source
    /// copy.
    pub fn size(&self, name: &Path) -> Result<u64> {
        let Some(layer) = self.find_layer(name)? else {
            return Err(Error::not_found(name));
        };
        self.shared.os.size(&self.backing_path(layer, name))
    }

    /// Whether a name resolves in either layer.
    pub fn exist(&self, name: &Path) -> Result<bool> {
        Ok(self.find_layer(name)?.is_some())
    }

    fn directory_list_worker(
        &self,
        directory: &Path,
        prefix: &str,
        single: bool,
    ) -> Result<Vec<String>> {
        let os = &self.shared.os;
        let phase = self.shared.phase();
        let mut entries = Vec::new();

        let dest_dir = self.backing_path(Layer::Destination, directory);
        let dest_folder_exists = os.exist(&dest_dir)?;
        if dest_folder_exists {
            for name in os.directory_list(&dest_dir, prefix)? {
                if !name.ends_with(STOP_FILE_SUFFIX) {
                    entries.push(name);
                    if single {
                        return Ok(entries);
                    }
                }
            }
        }

        // Once past the background migration stage the source directory is
        // never inspected again.
        if phase.migration_complete() {
            if !dest_folder_exists {
                return Err(Error::not_found(directory));
            }
            return Ok(entries);
        }

        let source_dir = self.backing_path(Layer::Source, directory);
        let source_folder_exists = os.exist(&source_dir)?;
        if source_folder_exists {
            for name in os.directory_list(&source_dir, prefix)? {
                if name.ends_with(STOP_FILE_SUFFIX) {
                    self.shared.set_panic();
                    return Err(Error::Corrupt(format!(
                        "'{name}' found in the source directory; stop files may only exist in \
                         the destination"
                    )));
                }
                let add = if dest_folder_exists {
                    let dest_backing = dest_dir.join(&name);
                    !os.exist(&dest_backing)?
                        && !os.exist(&with_suffix(&dest_backing, STOP_FILE_SUFFIX))?
                } else {
                    true
                };
                if add {
                    entries.push(name);
                    if single {
                        return Ok(entries);
                    }
                }
            }
        }

        if !dest_folder_exists && !source_folder_exists {
            return Err(Error::not_found(directory));
        }
        Ok(entries)
    }

    /// List a directory: the destination's files (stop files excluded)
    /// united with the source files that have neither been migrated nor
    /// stopped.
    pub fn directory_list(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        self.directory_list_worker(directory, prefix, false)
    }

    /// Like [`directory_list`](Self::directory_list) but stops at the first
    /// match.
    pub fn directory_list_single(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        self.directory_list_worker(directory, prefix, true)
    }
}

impl FileSystem for LiveRestoreFs {
    fn open_file(
        &self,
        path: &Path,
        file_type: FileType,
        flags: OpenFlags,
    ) -> Result<Arc<dyn FileHandle>> {
        let handle = self.open(path, file_type, flags)?;
        Ok(handle)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        LiveRestoreFs::remove(self, path)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        LiveRestoreFs::rename(self, from, to)
    }

    fn size(&self, path: &Path) -> Result<u64> {
        LiveRestoreFs::size(self, path)
    }

    fn exist(&self, path: &Path) -> Result<bool> {
        LiveRestoreFs::exist(self, path)
    }

    fn directory_list(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        LiveRestoreFs::directory_list(self, directory, prefix)
    }

    fn directory_list_single(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        LiveRestoreFs::directory_list_single(self, directory, prefix)
    }
}

/// Delete every stop file from the destination root and, when a log
/// subdirectory is configured, from there too. Runs during the clean up
/// phase; completion is what lets future mounts skip the source entirely.
pub(crate) fn cleanup_stop_files(shared: &Shared) -> Result<()> {
    let os = &shared.os;
    for name in os.directory_list(&shared.dest_home, "")? {
        if name.ends_with(STOP_FILE_SUFFIX) {
            let path = shared.dest_home.join(&name);
            info!("removing stop file {}", path.display());
            os.remove(&path)?;
        }
    }
    if let Some(log_path) = &shared.log_path {
        let log_dir = shared.dest_home.join(log_path);
        if os.exist(&log_dir)? {
            for name in os.directory_list(&log_dir, "")? {
                if name.ends_with(STOP_FILE_SUFFIX) {
                    let path = log_dir.join(&name);
                    info!("removing log directory stop file {}", path.display());
                    os.remove(&path)?;
                }
            }
        }
    }
    Ok(())
}
