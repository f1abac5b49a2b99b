//! The thin local file system layer both live restore layers sit on. It
//! carries no live restore policy: it opens, reads, writes and lists
//! whatever it is pointed at and reports every failure as-is.

use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use crate::Error;
use crate::FileHandle;
use crate::FileSystem;
use crate::FileType;
use crate::OpenFlags;
use crate::Result;

/// The local-directory implementation of [`FileSystem`].
#[derive(Debug, Default)]
pub struct OsFileSystem;

impl OsFileSystem {
    /// The adapter is stateless; every operation takes the full path.
    pub fn new() -> Self {
        OsFileSystem
    }
}

/// An open local file (or directory).
#[derive(Debug)]
pub struct OsFile {
    path: PathBuf,
    file: File,
}

impl FileSystem for OsFileSystem {
    fn open_file(
        &self,
        path: &Path,
        file_type: FileType,
        flags: OpenFlags,
    ) -> Result<Arc<dyn FileHandle>> {
        let file = if file_type == FileType::Directory {
            if flags.contains(OpenFlags::CREATE) && !path.is_dir() {
                fs::create_dir(path).map_err(|err| Error::from_io(path, err))?;
            }
            File::open(path).map_err(|err| Error::from_io(path, err))?
        } else {
            let mut options = OpenOptions::new();
            options.read(true);
            if flags.contains(OpenFlags::READONLY) {
                options.write(false);
            } else {
                options.write(true);
            }
            if flags.contains(OpenFlags::CREATE) {
                if flags.contains(OpenFlags::EXCLUSIVE) {
                    options.create_new(true);
                } else {
                    options.create(true);
                }
            }
            if flags.contains(OpenFlags::DURABLE) {
                options.custom_flags(libc::O_DSYNC);
            }
            options.open(path).map_err(|err| Error::from_io(path, err))?
        };
        Ok(Arc::new(OsFile {
            path: path.to_path_buf(),
            file,
        }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|err| Error::from_io(path, err))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|err| Error::from_io(from, err))
    }

    fn size(&self, path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).map_err(|err| Error::from_io(path, err))?;
        Ok(metadata.len())
    }

    fn exist(&self, path: &Path) -> Result<bool> {
        match fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn directory_list(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        let entries = fs::read_dir(directory).map_err(|err| Error::from_io(directory, err))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) {
                names.push(name);
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    fn directory_list_single(&self, directory: &Path, prefix: &str) -> Result<Vec<String>> {
        let mut names = self.directory_list(directory, prefix)?;
        names.truncate(1);
        Ok(names)
    }
}

impl FileHandle for OsFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|err| Error::from_io(&self.path, err))
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|err| Error::from_io(&self.path, err))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|err| Error::from_io(&self.path, err))
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|err| Error::from_io(&self.path, err))
    }

    fn size(&self) -> Result<u64> {
        let metadata = self
            .file
            .metadata()
            .map_err(|err| Error::from_io(&self.path, err))?;
        Ok(metadata.len())
    }

    fn close(&self) -> Result<()> {
        // The descriptor is released when the last reference drops.
        Ok(())
    }
}
