//! Restore a database directory from a read-only backup while keeping it
//! usable, then wait for the background migration to finish.
//!
//! ```console
//! $ RUST_LOG=debug cargo run --example migrate -- --source /backups/db --dest /var/db
//! ```

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use liverestore::Catalog;
use liverestore::Error;
use liverestore::FileType;
use liverestore::LiveRestoreFile;
use liverestore::LiveRestoreFs;
use liverestore::MigrationServer;
use liverestore::OpenFlags;
use liverestore::Options;
use liverestore::Result;
use liverestore::STATE_FILE;

#[derive(Parser)]
#[command(version, about = "Migrate a backup into a live destination directory")]
struct Args {
    /// Read-only source directory to restore from
    #[arg(long)]
    source: PathBuf,

    /// Writable destination directory to restore into
    #[arg(long)]
    dest: PathBuf,

    /// Number of background worker threads
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Copy chunk size in bytes; must be a power of two
    #[arg(long, default_value_t = 1 << 20)]
    read_size: usize,
}

/// A catalog that treats every name visible in the composed directory as a
/// data file. A real engine would walk its metadata table instead.
struct DirCatalog {
    fs: Arc<LiveRestoreFs>,
    dest: PathBuf,
    names: Vec<String>,
}

impl Catalog for DirCatalog {
    fn uris(&self) -> Result<Vec<String>> {
        Ok(self.names.iter().map(|name| format!("file:{name}")).collect())
    }

    fn open_target(&self, uri: &str) -> Result<Option<Arc<LiveRestoreFile>>> {
        let name = uri.trim_start_matches("file:");
        match self
            .fs
            .open(&self.dest.join(name), FileType::Data, OpenFlags::empty())
        {
            Ok(handle) => Ok(Some(handle)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    fs::create_dir_all(&args.dest).map_err(Error::Io)?;

    let mut options = Options::new(&args.source);
    options.threads_max = args.threads;
    options.read_size = args.read_size;
    let fs = Arc::new(LiveRestoreFs::new(&args.dest, options)?);
    fs.finish_log_copy()?;

    let names = fs
        .directory_list(&args.dest, "")?
        .into_iter()
        .filter(|name| name != STATE_FILE)
        .collect();
    let catalog = Arc::new(DirCatalog {
        fs: Arc::clone(&fs),
        dest: args.dest.clone(),
        names,
    });

    if let Some(server) = MigrationServer::start(&fs, catalog)? {
        server.wait()?;
    }
    println!("restore finished in the {} phase", fs.phase());
    Ok(())
}
