#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use strata_core::Database;
use strata_fuse::MountOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Snapshot-versioned copy-on-write filesystem over a directory store.
///
/// Without a mountpoint, lists the store's versions as `index<TAB>unix
/// seconds` and exits. With a mountpoint, serves the union of all versions;
/// a writable mount materializes changes into a freshly created head
/// version and persists them on unmount.
#[derive(Parser)]
#[command(name = "stratafs", version)]
struct Cli {
    /// Backing store directory.
    store: PathBuf,

    /// Where to mount the filesystem; omit to list versions instead.
    mountpoint: Option<PathBuf>,

    /// Expose only the first N versions of the chain (0 = the full chain).
    /// A nonzero value implies a read-only historical mount.
    #[arg(long = "version", value_name = "N", default_value_t = 0)]
    version_index: usize,

    /// Mount read-only.
    #[arg(long)]
    readonly: bool,

    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let Some(mountpoint) = cli.mountpoint else {
        return list_versions(&cli.store, cli.version_index);
    };

    let writable = !cli.readonly && cli.version_index == 0;
    let db = Database::open(&cli.store, cli.version_index, writable)
        .with_context(|| format!("failed to open store {}", cli.store.display()))?;
    info!(
        store = %db.store().display(),
        versions = db.versions().len(),
        writable,
        "serving version store"
    );

    let options = MountOptions {
        read_only: !writable,
        allow_other: cli.allow_other,
        auto_unmount: true,
    };
    strata_fuse::mount(db.root().cloned(), &mountpoint, &options)
        .with_context(|| format!("FUSE mount failed at {}", mountpoint.display()))?;

    if writable {
        db.save().context("failed to save version store")?;
    }
    Ok(())
}

fn list_versions(store: &PathBuf, version_index: usize) -> Result<()> {
    let db = Database::open(store, version_index, false)
        .with_context(|| format!("failed to open store {}", store.display()))?;
    for (index, stamp) in db.dump() {
        println!("{index}\t{stamp}");
    }
    Ok(())
}
