use std::fmt::Display;
use std::fmt::Formatter;

bitflags::bitflags! {
    /// Flags accepted by [`FileSystem::open_file`](crate::FileSystem::open_file).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpenFlags: u32 {
        /// Create the file if it does not exist.
        const CREATE = 1 << 0;
        /// Fail with `AlreadyExists` if the file exists. Only meaningful
        /// together with `CREATE`.
        const EXCLUSIVE = 1 << 1;
        /// Writes through this handle reach stable storage before they
        /// return.
        const DURABLE = 1 << 2;
        /// Open the file for reading only.
        const READONLY = 1 << 3;
    }
}

impl Display for OpenFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.bits(), f)
    }
}
