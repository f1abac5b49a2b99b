//! The live restore phase machine and its on-disk persistence.
//!
//! The phase is recorded as human-readable text in the
//! [`STATE_FILE`](crate::STATE_FILE) inside the destination so a restore
//! interrupted at any point resumes where it left off. Phases only ever
//! advance, one step at a time.

use std::fmt;
use std::path::Path;

use log::debug;
use log::info;

use crate::Error;
use crate::FileSystem;
use crate::FileType;
use crate::OpenFlags;
use crate::Result;
use crate::STATE_FILE;
use crate::STOP_FILE_SUFFIX;
use crate::fs::Shared;

/// The lifecycle phase of a live restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No restore has ever started in this destination. Never persisted;
    /// represented on disk by the state file's absence.
    None,
    /// Log files are being copied across before the database opens.
    LogCopy,
    /// Background workers are migrating data files extent by extent.
    BackgroundMigration,
    /// All data has been migrated; stop files are being removed.
    CleanUp,
    /// The restore is finished and the source is never consulted again.
    Complete,
}

impl Phase {
    /// Whether migration has finished: the source layer no longer holds any
    /// authoritative data and must not be consulted.
    pub fn migration_complete(self) -> bool {
        matches!(self, Phase::CleanUp | Phase::Complete)
    }

    fn as_str(self) -> &'static str {
        match self {
            Phase::None => "NONE",
            Phase::LogCopy => "LOG_COPY",
            Phase::BackgroundMigration => "BACKGROUND_MIGRATION",
            Phase::CleanUp => "CLEAN_UP",
            Phase::Complete => "COMPLETE",
        }
    }

    fn parse(s: &str) -> Result<Phase> {
        match s {
            "LOG_COPY" => Ok(Phase::LogCopy),
            "BACKGROUND_MIGRATION" => Ok(Phase::BackgroundMigration),
            "CLEAN_UP" => Ok(Phase::CleanUp),
            "COMPLETE" => Ok(Phase::Complete),
            _ => Err(Error::InvalidArgument(format!(
                "invalid live restore state string: '{s}'"
            ))),
        }
    }

    fn predecessor(self) -> Option<Phase> {
        match self {
            Phase::None => None,
            Phase::LogCopy => Some(Phase::None),
            Phase::BackgroundMigration => Some(Phase::LogCopy),
            Phase::CleanUp => Some(Phase::BackgroundMigration),
            Phase::Complete => Some(Phase::CleanUp),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read the phase recorded in `folder`, returning [`Phase::None`] when no
/// state file exists there.
pub(crate) fn read_phase_file(os: &dyn FileSystem, folder: &Path) -> Result<Phase> {
    let path = folder.join(STATE_FILE);
    if !os.exist(&path)? {
        return Ok(Phase::None);
    }
    let fh = os.open_file(&path, FileType::Regular, OpenFlags::READONLY)?;
    let size = fh.size()?;
    let mut buf = vec![0; size as usize];
    fh.read(0, &mut buf)?;
    fh.close()?;
    let text = String::from_utf8(buf)
        .map_err(|_| Error::InvalidArgument("state file is not valid UTF-8".to_string()))?;
    Phase::parse(text.trim_end())
}

fn write_phase_file(shared: &Shared, phase: Phase, create: bool) -> Result<()> {
    let path = shared.dest_home.join(STATE_FILE);
    let flags = if create {
        OpenFlags::CREATE | OpenFlags::EXCLUSIVE
    } else {
        OpenFlags::empty()
    };
    let fh = shared.os.open_file(&path, FileType::Regular, flags)?;
    // Rewrite the whole file so a shorter phase name never leaves a stale
    // tail behind, and make the advance durable before it takes effect in
    // memory.
    fh.truncate(0)?;
    fh.write(0, phase.as_str().as_bytes())?;
    fh.sync()?;
    fh.close()
}

/// Adopt the phase persisted in the destination, or start a brand new
/// restore by creating the state file in the log copy phase.
pub(crate) fn init_state(shared: &Shared) -> Result<()> {
    let mut guard = shared.phase.write();
    debug_assert_eq!(*guard, Phase::None, "state initialized twice");

    let on_disk = read_phase_file(shared.os.as_ref(), &shared.dest_home)?;
    if on_disk != Phase::None {
        *guard = on_disk;
    } else {
        write_phase_file(shared, Phase::LogCopy, true)?;
        *guard = Phase::LogCopy;
    }
    info!("live restore starting in the {} phase", *guard);
    Ok(())
}

/// Advance to `new_phase`, persisting it first. Any transition other than
/// the immediate successor of the current phase is rejected.
pub(crate) fn set_state(shared: &Shared, new_phase: Phase) -> Result<()> {
    let mut guard = shared.phase.write();
    if *guard == Phase::None {
        return Err(Error::InvalidArgument(
            "live restore state was never initialized".to_string(),
        ));
    }
    if new_phase.predecessor() != Some(*guard) {
        return Err(Error::InvalidArgument(format!(
            "invalid live restore state transition: {} -> {new_phase}",
            *guard
        )));
    }
    let path = shared.dest_home.join(STATE_FILE);
    if !shared.os.exist(&path)? {
        return Err(Error::Corrupt(format!(
            "state file '{}' disappeared mid-restore",
            path.display()
        )));
    }
    write_phase_file(shared, new_phase, false)?;
    *guard = new_phase;
    debug!("live restore state advanced to {new_phase}");
    Ok(())
}

/// Remove a state file from `folder` if it records a finished restore.
///
/// A backup taken from a completed destination before the engine restarted
/// without live restore will contain such a file; it is the one thing this
/// crate is allowed to delete from a source directory.
pub(crate) fn delete_complete_state_file(os: &dyn FileSystem, folder: &Path) -> Result<()> {
    if read_phase_file(os, folder)? == Phase::Complete {
        let path = folder.join(STATE_FILE);
        info!("removing completed state file {}", path.display());
        os.remove(&path)?;
    }
    Ok(())
}

/// Validate the source and destination contents against the persisted phase
/// before the file system comes up.
pub(crate) fn validate_directories(shared: &Shared) -> Result<()> {
    let os = shared.os.as_ref();

    delete_complete_state_file(os, &shared.source_home)?;

    let source_files = os.directory_list(&shared.source_home, "")?;
    if source_files.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "source directory '{}' is empty, nothing to restore",
            shared.source_home.display()
        )));
    }
    for name in &source_files {
        if name.ends_with(STOP_FILE_SUFFIX) || name == STATE_FILE {
            return Err(Error::InvalidArgument(format!(
                "source directory contains live restore metadata file '{name}'; this implies it \
                 is a destination directory that has not finished restoration"
            )));
        }
    }

    let phase = read_phase_file(os, &shared.dest_home)?;
    let dest_files = os.directory_list(&shared.dest_home, "")?;
    match phase {
        Phase::None => {
            // A brand new restore must not overwrite an existing database.
            if !dest_files.is_empty() {
                return Err(Error::InvalidArgument(
                    "live restore is about to start but the destination directory is not empty"
                        .to_string(),
                ));
            }
        }
        Phase::LogCopy => {
            let log_dir = shared
                .log_path
                .as_ref()
                .map(|p| p.display().to_string());
            for name in &dest_files {
                if name.ends_with(".log") || name == STATE_FILE || Some(name) == log_dir.as_ref() {
                    continue;
                }
                return Err(Error::InvalidArgument(format!(
                    "live restore is in the log copy phase but the destination contains a file \
                     other than logs or the state file: {name}"
                )));
            }
        }
        Phase::BackgroundMigration | Phase::CleanUp => {}
        Phase::Complete => {
            for name in &dest_files {
                if name.ends_with(STOP_FILE_SUFFIX) {
                    return Err(Error::InvalidArgument(format!(
                        "live restore is complete but stop file '{name}' still exists"
                    )));
                }
            }
        }
    }
    Ok(())
}
