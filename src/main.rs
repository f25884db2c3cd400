//! pagevault - command line access to a block storage file

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use pagevault::config::Config;
use pagevault::database::Database;
use pagevault::tier::BlobOwner;
use std::path::PathBuf;
use std::time::SystemTime;

/// pagevault - A single-file block store with tiered value storage
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Database file
    #[arg(short = 'D', long, default_value = "./pagevault.db")]
    database: PathBuf,

    /// Blob directory (defaults to <database>.blobs)
    #[arg(short, long)]
    blobs: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty database file
    Init,
    /// Write a raw block
    Put {
        name: String,
        /// Block contents; read from --file when omitted
        value: Option<String>,
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Print a raw block
    Get {
        name: String,
        /// Write the block to a file instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Delete a raw block
    Delete { name: String },
    /// List blocks under a prefix
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Store a file as a tiered value
    Store {
        name: String,
        file: PathBuf,
        #[arg(long, default_value = "files")]
        table: String,
        #[arg(long, default_value = "data")]
        column: String,
    },
    /// Load a tiered value
    Load {
        name: String,
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Remove unreferenced blob files
    Sweep,
    /// List registered tables
    Tables,
    /// Print engine counters
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let mut config = Config::default();
    config.filestream.root = args.blobs.clone();

    if let Command::Init = args.command {
        let db = Database::create(&args.database, config)
            .await
            .context("Failed to create database")?;
        db.close().await?;
        println!("created {}", args.database.display());
        return Ok(());
    }

    let db = Database::open(&args.database, config)
        .await
        .with_context(|| format!("Failed to open {}", args.database.display()))?;
    let result = run(&db, args.command).await;
    db.close().await.context("Failed to close database")?;
    result
}

async fn run(db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Init => bail!("database is already initialized"),
        Command::Put { name, value, file } => {
            let payload = match (value, file) {
                (Some(value), None) => value.into_bytes(),
                (None, Some(file)) => std::fs::read(&file)
                    .with_context(|| format!("Failed to read {}", file.display()))?,
                _ => bail!("pass either a value or --file"),
            };
            let location = db.write_block(&name, payload).await?;
            println!(
                "{}: {} bytes at offset {} (generation {})",
                name, location.length, location.offset, location.generation
            );
        }
        Command::Get { name, out } => {
            let data = db.read_block(&name)?;
            emit(&data, out)?;
        }
        Command::Delete { name } => match db.delete_block(&name).await? {
            Some(_) => println!("deleted {name}"),
            None => println!("{name} does not exist"),
        },
        Command::List { prefix } => {
            for (name, location) in db.blocks().list(&prefix) {
                println!("{name}\t{}", location.length);
            }
        }
        Command::Store {
            name,
            file,
            table,
            column,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let owner = BlobOwner::new(table, column, name.clone());
            let reference = db.put_value(&name, &data, &owner).await?;
            println!("{}: {} bytes, {:?}", name, reference.len(), reference.tier());
        }
        Command::Load { name, out } => {
            let data = db.get_value(&name).await?;
            emit(&data, out)?;
        }
        Command::Sweep => {
            let report = db.sweep_orphans(SystemTime::now()).await?;
            println!(
                "scanned {}, referenced {}, retained {}, removed {} ({} bytes), temp files {}",
                report.scanned,
                report.referenced,
                report.retained,
                report.removed.len(),
                report.bytes_reclaimed,
                report.temp_files_removed
            );
        }
        Command::Tables => {
            for name in db.list_tables()? {
                let schema = db.load_table(&name)?;
                println!(
                    "{}\t{} columns\t{} indexes",
                    name,
                    schema.columns.len(),
                    schema.indexes.len()
                );
            }
        }
        Command::Stats => {
            let stats = db.stats();
            println!("blocks:            {}", stats.blocks);
            println!("pages:             {} ({} free)", stats.total_pages, stats.free_pages);
            println!("dirty entries:     {}", stats.dirty_entries);
            println!("snapshots written: {}", stats.snapshots_written);
            println!("journal records:   {}", stats.journal_records);
            println!(
                "writer:            {} ops in {} batches, {} failed",
                stats.writer.ops, stats.writer.batches, stats.writer.failed
            );
        }
    }
    Ok(())
}

fn emit(data: &[u8], out: Option<PathBuf>) -> Result<()> {
    match out {
        Some(path) => {
            std::fs::write(&path, data)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => println!("{}", String::from_utf8_lossy(data)),
    }
    Ok(())
}
