//! File system level behavior: the open decision matrix, stop files,
//! rename/remove, directory listing union rules, atomic copies and the
//! persisted phase machine.

use std::fs;
use std::path::PathBuf;

use liverestore::Error;
use liverestore::FileType;
use liverestore::LiveRestoreFs;
use liverestore::OpenFlags;
use liverestore::Options;
use liverestore::Phase;
use liverestore::STATE_FILE;
use tempfile::TempDir;
use tempfile::tempdir;

const READ_SIZE: usize = 4096;

fn options(source: &TempDir) -> Options {
    let mut options = Options::new(source.path());
    options.threads_max = 2;
    options.read_size = READ_SIZE;
    options
}

fn new_fs(source: &TempDir, dest: &TempDir) -> LiveRestoreFs {
    let fs = LiveRestoreFs::new(dest.path(), options(source)).unwrap();
    fs.finish_log_copy().unwrap();
    fs
}

fn source_file(source: &TempDir, name: &str, contents: &[u8]) {
    fs::write(source.path().join(name), contents).unwrap();
}

fn dest_path(dest: &TempDir, name: &str) -> PathBuf {
    dest.path().join(name)
}

#[test]
fn open_decision_matrix() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "backed.wt", &[b'A'; 4096]);
    let fs = new_fs(&source, &dest);

    // Present in neither layer, no create.
    assert!(matches!(
        fs.open(&dest_path(&dest, "nope.wt"), FileType::Data, OpenFlags::empty()),
        Err(Error::NotFound(_))
    ));

    // Exclusive create over a source-only file.
    assert!(matches!(
        fs.open(
            &dest_path(&dest, "backed.wt"),
            FileType::Data,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        ),
        Err(Error::AlreadyExists(_))
    ));

    // Creating a brand new file succeeds and is born complete.
    let fresh = fs
        .open(
            &dest_path(&dest, "fresh.wt"),
            FileType::Data,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        )
        .unwrap();
    assert!(fresh.is_complete());

    // Exclusive create over the now-existing destination file.
    assert!(matches!(
        fs.open(
            &dest_path(&dest, "fresh.wt"),
            FileType::Data,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        ),
        Err(Error::AlreadyExists(_))
    ));

    // A source-backed open seeds the full-file hole.
    let backed = fs
        .open(&dest_path(&dest, "backed.wt"), FileType::Data, OpenFlags::empty())
        .unwrap();
    assert!(!backed.is_complete());
    assert_eq!(
        backed.export_extents().as_deref(),
        Some(",live_restore=0-4096")
    );
}

#[test]
fn remove_then_recreate_never_falls_back_to_the_source() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "f.wt", &[b'S'; 100]);
    let fs = new_fs(&source, &dest);

    let handle = fs
        .open(&dest_path(&dest, "f.wt"), FileType::Data, OpenFlags::CREATE)
        .unwrap();
    handle.write(0, &[b'N'; 10]).unwrap();
    handle.close().unwrap();
    drop(handle);

    fs.remove(&dest_path(&dest, "f.wt")).unwrap();
    assert!(!dest_path(&dest, "f.wt").exists());
    assert!(dest_path(&dest, "f.wt.stop").exists());

    // The source still has f.wt, but the stop file hides it.
    assert!(matches!(
        fs.open(&dest_path(&dest, "f.wt"), FileType::Data, OpenFlags::empty()),
        Err(Error::NotFound(_))
    ));
    assert!(!fs.exist(&dest_path(&dest, "f.wt")).unwrap());

    // Recreation starts from scratch: empty and complete.
    let recreated = fs
        .open(
            &dest_path(&dest, "f.wt"),
            FileType::Data,
            OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
        )
        .unwrap();
    assert!(recreated.is_complete());
    assert_eq!(recreated.size().unwrap(), 0);
    assert!(dest_path(&dest, "f.wt.stop").exists());
}

#[test]
fn remove_of_a_source_only_file_leaves_a_stop_file() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "s.wt", &[b'S'; 100]);
    let fs = new_fs(&source, &dest);

    fs.remove(&dest_path(&dest, "s.wt")).unwrap();
    assert!(dest_path(&dest, "s.wt.stop").exists());
    assert!(source.path().join("s.wt").exists());

    // Removing a name that exists nowhere is quietly accepted.
    fs.remove(&dest_path(&dest, "ghost.wt")).unwrap();
    assert!(!dest_path(&dest, "ghost.wt.stop").exists());
}

#[test]
fn rename_requires_a_destination_copy() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "src_only.wt", &[b'S'; 100]);
    let fs = new_fs(&source, &dest);

    assert!(matches!(
        fs.rename(
            &dest_path(&dest, "src_only.wt"),
            &dest_path(&dest, "new.wt")
        ),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        fs.rename(&dest_path(&dest, "ghost.wt"), &dest_path(&dest, "new.wt")),
        Err(Error::NotFound(_))
    ));

    let handle = fs
        .open(&dest_path(&dest, "old.wt"), FileType::Data, OpenFlags::CREATE)
        .unwrap();
    handle.write(0, b"payload").unwrap();
    handle.close().unwrap();
    drop(handle);

    fs.rename(&dest_path(&dest, "old.wt"), &dest_path(&dest, "new.wt"))
        .unwrap();
    assert!(!dest_path(&dest, "old.wt").exists());
    assert_eq!(fs::read(dest_path(&dest, "new.wt")).unwrap(), b"payload");
    assert!(dest_path(&dest, "old.wt.stop").exists());
    assert!(dest_path(&dest, "new.wt.stop").exists());
}

#[test]
fn size_prefers_the_destination_and_falls_back_to_the_source() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "s.wt", &[b'S'; 500]);
    let fs = new_fs(&source, &dest);

    assert_eq!(fs.size(&dest_path(&dest, "s.wt")).unwrap(), 500);
    assert!(matches!(
        fs.size(&dest_path(&dest, "ghost.wt")),
        Err(Error::NotFound(_))
    ));

    let handle = fs
        .open(&dest_path(&dest, "d.wt"), FileType::Data, OpenFlags::CREATE)
        .unwrap();
    handle.write(0, &[b'D'; 42]).unwrap();
    drop(handle);
    assert_eq!(fs.size(&dest_path(&dest, "d.wt")).unwrap(), 42);

    assert!(fs.exist(&dest_path(&dest, "s.wt")).unwrap());
    assert!(!fs.exist(&dest_path(&dest, "ghost.wt")).unwrap());
}

#[test]
fn directory_list_unions_the_layers() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "s1.wt", &[b'S'; 100]);
    source_file(&source, "s2.wt", &[b'S'; 100]);
    let fs = new_fs(&source, &dest);

    // s1.wt gains a destination copy; s2.wt is removed (stop file only).
    fs.open(&dest_path(&dest, "s1.wt"), FileType::Data, OpenFlags::empty())
        .unwrap();
    fs.remove(&dest_path(&dest, "s2.wt")).unwrap();

    let mut listed = fs.directory_list(dest.path(), "").unwrap();
    listed.sort_unstable();
    assert_eq!(listed, vec![STATE_FILE.to_string(), "s1.wt".to_string()]);

    let prefixed = fs.directory_list(dest.path(), "s").unwrap();
    assert_eq!(prefixed, vec!["s1.wt".to_string()]);

    let single = fs.directory_list_single(dest.path(), "s").unwrap();
    assert_eq!(single.len(), 1);

    assert!(matches!(
        fs.directory_list(&dest_path(&dest, "missing_dir"), ""),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn stale_atomic_copy_leftovers_are_cleaned_and_the_copy_restarts() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    source_file(&source, "000000001.log", &contents);
    let fs = new_fs(&source, &dest);

    // As if a previous mount crashed mid-copy.
    fs::write(dest_path(&dest, "000000001.log.lr_tmp"), b"garbage").unwrap();

    let handle = fs
        .open(
            &dest_path(&dest, "000000001.log"),
            FileType::Log,
            OpenFlags::empty(),
        )
        .unwrap();
    assert!(handle.is_complete());
    assert!(!dest_path(&dest, "000000001.log.lr_tmp").exists());
    assert_eq!(fs::read(dest_path(&dest, "000000001.log")).unwrap(), contents);

    // A second open finds the destination copy and leaves it alone.
    drop(handle);
    let again = fs
        .open(
            &dest_path(&dest, "000000001.log"),
            FileType::Log,
            OpenFlags::empty(),
        )
        .unwrap();
    assert!(again.is_complete());
}

#[test]
fn phase_file_tracks_the_lifecycle() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "a.wt", &[b'A'; 100]);

    let fs = LiveRestoreFs::new(dest.path(), options(&source)).unwrap();
    assert_eq!(fs.phase(), Phase::LogCopy);
    assert_eq!(
        fs::read_to_string(dest_path(&dest, STATE_FILE)).unwrap(),
        "LOG_COPY"
    );

    fs.finish_log_copy().unwrap();
    assert_eq!(fs.phase(), Phase::BackgroundMigration);
    assert_eq!(
        fs::read_to_string(dest_path(&dest, STATE_FILE)).unwrap(),
        "BACKGROUND_MIGRATION"
    );
    // Repeating the no-op helper is fine, repeating a transition is not.
    fs.finish_log_copy().unwrap();
    assert!(matches!(
        fs.set_state(Phase::BackgroundMigration),
        Err(Error::InvalidArgument(_))
    ));
    // Skipping a phase is rejected too.
    assert!(matches!(
        fs.set_state(Phase::Complete),
        Err(Error::InvalidArgument(_))
    ));

    fs.set_state(Phase::CleanUp).unwrap();
    assert_eq!(
        fs::read_to_string(dest_path(&dest, STATE_FILE)).unwrap(),
        "CLEAN_UP"
    );

    // A new mount adopts the persisted phase.
    drop(fs);
    let fs = LiveRestoreFs::new(dest.path(), options(&source)).unwrap();
    assert_eq!(fs.phase(), Phase::CleanUp);
}

#[test]
fn mount_validation_rejects_bad_directories() {
    // An empty source has nothing to restore.
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    assert!(matches!(
        LiveRestoreFs::new(dest.path(), options(&source)),
        Err(Error::InvalidArgument(_))
    ));

    // Stop files in the source mean it is itself a half-restored
    // destination.
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "a.wt", &[b'A'; 100]);
    source_file(&source, "a.wt.stop", &[]);
    assert!(matches!(
        LiveRestoreFs::new(dest.path(), options(&source)),
        Err(Error::InvalidArgument(_))
    ));

    // A fresh restore must not overwrite an existing database.
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "a.wt", &[b'A'; 100]);
    fs::write(dest_path(&dest, "existing.wt"), b"data").unwrap();
    assert!(matches!(
        LiveRestoreFs::new(dest.path(), options(&source)),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn completed_state_file_in_the_source_is_deleted() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "a.wt", &[b'A'; 100]);
    // A backup of a finished destination carries its state file along.
    fs::write(source.path().join(STATE_FILE), "COMPLETE").unwrap();

    let fs = LiveRestoreFs::new(dest.path(), options(&source)).unwrap();
    assert!(!source.path().join(STATE_FILE).exists());
    assert_eq!(fs.phase(), Phase::LogCopy);
}

#[test]
fn source_is_ignored_once_migration_is_complete() {
    let (source, dest) = (tempdir().unwrap(), tempdir().unwrap());
    source_file(&source, "late.wt", &[b'S'; 100]);
    let fs = new_fs(&source, &dest);
    fs.set_state(Phase::CleanUp).unwrap();

    assert!(!fs.exist(&dest_path(&dest, "late.wt")).unwrap());
    assert!(matches!(
        fs.size(&dest_path(&dest, "late.wt")),
        Err(Error::NotFound(_))
    ));
    let listed = fs.directory_list(dest.path(), "late").unwrap();
    assert!(listed.is_empty());
    assert!(matches!(
        fs.open(&dest_path(&dest, "late.wt"), FileType::Data, OpenFlags::empty()),
        Err(Error::NotFound(_))
    ));
}
