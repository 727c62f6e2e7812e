//! atlas-idb Inspection Binary
//!
//! Opens a backing store directory and reports on it or runs maintenance.

use std::path::PathBuf;
use std::process;

use atlas_idb::maintenance::{PreCloseTask, SweepMode, TombstoneSweeper};
use atlas_idb::{BackingStore, Config, DataLoss, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// atlas-idb inspector
#[derive(Parser, Debug)]
#[command(name = "atlas-idb-inspect")]
#[command(about = "Inspect and maintain an atlas-idb backing store")]
#[command(version)]
struct Args {
    /// Store directory
    #[arg(short, long, default_value = "./atlas_idb_data")]
    data_dir: PathBuf,

    /// Origin the store belongs to
    #[arg(short, long, default_value = "http://localhost")]
    origin: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List databases and their versions
    List,

    /// Print the schema of one database
    Metadata {
        /// Database name
        name: String,
    },

    /// Delete every blob file named by the recovery journal
    CleanJournal,

    /// Count stale index entries, deleting them with --delete
    Sweep {
        #[arg(long)]
        delete: bool,
    },

    /// Print the store size in bytes
    Size,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,atlas_idb=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("atlas-idb-inspect v{}", atlas_idb::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = Config::builder()
        .data_dir(&args.data_dir)
        .origin(&args.origin)
        .build();

    let (store, data_loss) = BackingStore::open(config)?;
    if data_loss.status == DataLoss::Total {
        tracing::warn!("{}", data_loss.message);
    }

    match args.command {
        Commands::List => {
            for (name, version) in store.get_database_names_and_versions()? {
                println!("{}\tversion {}", name, version);
            }
        }

        Commands::Metadata { name } => {
            let database = store.create_or_open_database(&name)?;
            let metadata = database.metadata();
            println!("{} (id {:?}, version {})", metadata.name, metadata.id, metadata.version);
            for store_metadata in metadata.object_stores.values() {
                println!(
                    "  store {} {:?} key_path={:?} auto_increment={}",
                    store_metadata.id, store_metadata.name, store_metadata.key_path, store_metadata.auto_increment
                );
                for index in store_metadata.indexes.values() {
                    println!(
                        "    index {} {:?} key_path={:?} unique={} multi_entry={}",
                        index.id, index.name, index.key_path, index.unique, index.multi_entry
                    );
                }
            }
        }

        Commands::CleanJournal => {
            store.clean_recovery_journal();
            println!("recovery journal cleaned");
        }

        Commands::Sweep { delete } => {
            let mode = if delete { SweepMode::Delete } else { SweepMode::Count };
            let mut sweeper = TombstoneSweeper::new(store.engine().clone(), mode);
            sweeper.set_metadata(&store.get_complete_metadata()?);
            while !sweeper.run_round()? {}
            let stats = sweeper.stats();
            println!(
                "seen {} entries, {} stale ({} bytes), {} deleted",
                stats.entries_seen, stats.tombstones_found, stats.tombstone_bytes, stats.tombstones_deleted
            );
        }

        Commands::Size => {
            println!("{}", store.size()?);
        }
    }
    Ok(())
}
