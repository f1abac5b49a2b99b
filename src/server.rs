//! The background migration server: a pool of worker threads that drains
//! the holes of every data file in the catalog, then drives the phase
//! machine through clean up to completion.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::thread::JoinHandle;

use log::debug;
use log::error;
use log::info;

use parking_lot::Mutex;

use crate::Error;
use crate::Result;
use crate::fs::LiveRestoreFs;
use crate::fs::Shared;
use crate::fs::cleanup_stop_files;
use crate::handle::LiveRestoreFile;
use crate::state;
use crate::state::Phase;

/// Catalog entries with this prefix name B-tree data files and become work
/// items; everything else is ignored.
const WORK_URI_PREFIX: &str = "file:";

/// The engine's table catalog, as seen by the migration server.
///
/// Workers reach a file's live restore handle directly through
/// [`open_target`](Catalog::open_target) rather than traversing the cursor
/// machinery. Implementations resolve the URI to an open handle with its
/// extent metadata already imported — ideally the same handle foreground
/// I/O uses, so both sides share one hole set. Returning `Ok(None)` means
/// the file was dropped after the queue was built, which is benign.
pub trait Catalog: Send + Sync {
    /// Every URI in the catalog. Only `file:` entries are queued.
    fn uris(&self) -> Result<Vec<String>>;

    /// Resolve a URI to its live restore file handle, or `None` if the file
    /// no longer exists.
    fn open_target(&self, uri: &str) -> Result<Option<Arc<LiveRestoreFile>>>;
}

/// The queue and the count of workers still running, guarded together so
/// the last worker out can tell the migration is done.
struct QueueState {
    items: VecDeque<String>,
    threads_working: usize,
}

struct ServerShared {
    fs: Arc<Shared>,
    catalog: Arc<dyn Catalog>,
    queue: Mutex<QueueState>,
    running: AtomicBool,
}

/// Worker threads migrating data files in the background. Dropping the
/// server cancels the workers at their next loop iteration; use
/// [`wait`](MigrationServer::wait) to let them finish.
pub struct MigrationServer {
    shared: Arc<ServerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl MigrationServer {
    /// Build the work queue from the catalog and start the worker threads.
    ///
    /// Returns `None` when there is nothing to do: the thread count is
    /// configured to zero or the restore already completed. A restore that
    /// crashed between phases is finished up here (a `CleanUp` mount only
    /// has stop files left to remove).
    pub fn start(fs: &LiveRestoreFs, catalog: Arc<dyn Catalog>) -> Result<Option<MigrationServer>> {
        let fs_shared = fs.shared.clone();
        if fs_shared.threads_max == 0 {
            return Ok(None);
        }
        match fs_shared.phase() {
            Phase::Complete => return Ok(None),
            Phase::CleanUp => {
                cleanup_stop_files(&fs_shared)?;
                state::set_state(&fs_shared, Phase::Complete)?;
                info!("live restore finished");
                return Ok(None);
            }
            Phase::LogCopy => state::set_state(&fs_shared, Phase::BackgroundMigration)?,
            Phase::BackgroundMigration => {}
            Phase::None => {
                return Err(Error::InvalidArgument(
                    "live restore state was never initialized".to_string(),
                ));
            }
        }

        let items: VecDeque<String> = catalog
            .uris()?
            .into_iter()
            .filter(|uri| uri.starts_with(WORK_URI_PREFIX))
            .collect();
        info!(
            "initializing the live restore work queue with {} items",
            items.len()
        );

        let threads = fs_shared.threads_max;
        let shared = Arc::new(ServerShared {
            fs: fs_shared,
            catalog,
            queue: Mutex::new(QueueState {
                items,
                // Set before the threads start in case one immediately
                // exits and decrements it.
                threads_working: threads,
            }),
            running: AtomicBool::new(true),
        });
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let shared = Arc::clone(&shared);
            let worker = thread::Builder::new()
                .name(format!("live-restore-{i}"))
                .spawn(move || worker_run(&shared))
                .map_err(Error::Io)?;
            workers.push(worker);
        }
        Ok(Some(MigrationServer { shared, workers }))
    }

    /// Block until every worker has drained its share of the queue. Fails
    /// if the file system panicked along the way.
    pub fn wait(mut self) -> Result<()> {
        self.join_workers();
        if self.shared.fs.panicked() {
            return Err(Error::Panic);
        }
        Ok(())
    }

    /// Stop the workers at their next loop iteration and drop any queued
    /// work. The remaining holes stay recorded in the table metadata and
    /// migration resumes on the next mount.
    pub fn shutdown(mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        self.join_workers();
        self.shared.queue.lock().items.clear();
        Ok(())
    }

    fn join_workers(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("live restore worker thread panicked");
                self.shared.fs.set_panic();
            }
        }
    }
}

impl Drop for MigrationServer {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.join_workers();
    }
}

impl fmt::Debug for MigrationServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("MigrationServer")
            .field("queued", &queue.items.len())
            .field("threads_working", &queue.threads_working)
            .finish()
    }
}

fn worker_run(shared: &ServerShared) {
    while shared.running.load(Ordering::SeqCst) && !shared.fs.panicked() {
        let item = shared.queue.lock().items.pop_front();
        let Some(uri) = item else {
            debug!("live restore worker terminating");
            break;
        };
        debug!("live restore worker taking queue item: {uri}");
        if let Err(err) = migrate_one(shared, &uri) {
            error!("live restore migration of {uri} failed: {err}");
            shared.fs.set_panic();
            break;
        }
    }
    worker_stop(shared);
}

fn migrate_one(shared: &ServerShared, uri: &str) -> Result<()> {
    // The file may have been dropped after the queue was built; that is not
    // an error.
    let Some(handle) = shared.catalog.open_target(uri)? else {
        return Ok(());
    };
    debug!("live restore worker filling holes for: {uri}");
    handle.fill_holes()
}

/// Bookkeeping when a worker exits. The last one out with an empty queue
/// owns the end of the migration: advance to clean up, remove the stop
/// files and complete the restore.
fn worker_stop(shared: &ServerShared) {
    let mut queue = shared.queue.lock();
    queue.threads_working -= 1;
    if queue.threads_working > 0 || !queue.items.is_empty() || shared.fs.panicked() {
        return;
    }
    drop(queue);

    let finish = || -> Result<()> {
        state::set_state(&shared.fs, Phase::CleanUp)?;
        cleanup_stop_files(&shared.fs)?;
        state::set_state(&shared.fs, Phase::Complete)?;
        Ok(())
    };
    match finish() {
        Ok(()) => info!("live restore finished"),
        Err(err) => {
            error!("live restore failed to complete: {err}");
            shared.fs.set_panic();
        }
    }
}
