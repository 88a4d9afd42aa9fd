//! File store CLI - admin command line interface
//!
//! Stores and fetches items, evaluates patterns, inspects journals and runs
//! recovery against a local data directory.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use filestore_common::{Config, DataType, FsId, Xid};
use filestore_query::Matcher;
use filestore_storage::{FileStore, JournalStreamReader, RecoveryAction, read_journal_xid};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "filestore-cli")]
#[command(about = "File store admin CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "FILESTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (default from the configuration)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store an item in its own transaction
    Put {
        /// Item id, e.g. /cal/long/100:112
        id: String,
        /// Data type: blob, ts or mts
        #[arg(short = 't', long = "type", default_value = "blob")]
        data_type: String,
        /// Read the payload from a file instead of stdin
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Originator tag recorded with the entry
        #[arg(long, default_value_t = 0)]
        originator: i64,
    },
    /// Print a committed item to stdout
    Get {
        id: String,
        #[arg(short = 't', long = "type", default_value = "blob")]
        data_type: String,
    },
    /// List committed ids matching a pattern such as b@/cal/*
    Find { pattern: String },
    /// Show how a pattern classifies an id
    Explain { pattern: String, id: String },
    /// Journal inspection
    Journal {
        #[command(subcommand)]
        action: JournalCommands,
    },
    /// Open the store, run recovery and report what it did
    Recover,
}

#[derive(Subcommand, Debug)]
enum JournalCommands {
    /// List the entries of a journal file
    Dump {
        path: PathBuf,
        /// Expected transaction (default: the one in the header)
        #[arg(long)]
        xid: Option<String>,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir.clone_from(dir);
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    debug!(?config, "configuration loaded");

    match args.command {
        Commands::Put {
            id,
            data_type,
            file,
            originator,
        } => put(config, &id, &data_type, file, originator),
        Commands::Get { id, data_type } => get(config, &id, &data_type),
        Commands::Find { pattern } => {
            let store = FileStore::open(config)?;
            let mut out = std::io::stdout().lock();
            for id in store.find(&pattern)? {
                writeln!(out, "{id}")?;
            }
            Ok(())
        }
        Commands::Explain { pattern, id } => explain(&pattern, &id),
        Commands::Journal {
            action: JournalCommands::Dump { path, xid },
        } => dump(&path, xid.as_deref()),
        Commands::Recover => recover(config),
    }
}

fn put(
    config: Config,
    id: &str,
    data_type: &str,
    file: Option<PathBuf>,
    originator: i64,
) -> Result<()> {
    let id = FsId::parse(id)?;
    let data_type: DataType = data_type.parse()?;
    let mut input: Box<dyn Read> = match &file {
        Some(path) => Box::new(
            std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        ),
        None => Box::new(std::io::stdin().lock()),
    };

    let store = FileStore::open(config)?;
    let mut session = store.session()?;
    let xid = session.begin_transaction()?;
    let (offset, bytes) = {
        let mut stream = store.open_output_stream(xid, data_type, &id, originator)?;
        let bytes = std::io::copy(&mut input, &mut stream)?;
        (stream.close()?, bytes)
    };
    session.commit(xid)?;
    info!(%xid, %id, bytes, "stored");
    println!("{data_type} {id}: {bytes} bytes (journal offset {offset})");
    Ok(())
}

fn get(config: Config, id: &str, data_type: &str) -> Result<()> {
    let id = FsId::parse(id)?;
    let data_type: DataType = data_type.parse()?;
    let store = FileStore::open(config)?;
    let data = store.read(None, data_type, &id)?;
    std::io::stdout().lock().write_all(&data)?;
    Ok(())
}

fn explain(pattern: &str, id: &str) -> Result<()> {
    let matcher = Matcher::compile(pattern)?;
    let id = FsId::parse(id)?;
    let result = matcher.matches(&id);
    println!("Pattern: {pattern}");
    println!("Id: {id}");
    println!("Data type: {}", result.data_type);
    println!("Complete match: {}", result.complete_match);
    println!("Path matched: {}", result.path_matched);
    println!("Path prefix matched: {}", result.path_prefix_matched);
    Ok(())
}

fn dump(path: &Path, xid: Option<&str>) -> Result<()> {
    let declared = read_journal_xid(path)?;
    let expected: Xid = match xid {
        Some(text) => text.parse()?,
        None => declared,
    };
    println!("Journal: {}", path.display());
    println!("Transaction: {declared}");
    println!("{:>12}  {:>12}  {:>10}  ID", "OFFSET", "ORIGINATOR", "BYTES");
    let mut count = 0usize;
    for entry in JournalStreamReader::open(path, expected)? {
        let entry = entry?;
        println!(
            "{:>12}  {:>12}  {:>10}  {}",
            entry.offset,
            entry.originator,
            entry.data.len(),
            entry.id
        );
        count += 1;
    }
    println!("{count} entries");
    Ok(())
}

fn recover(config: Config) -> Result<()> {
    let store = FileStore::open(config)?;
    let report = store.recovery_report();
    if report.is_empty() {
        println!("Nothing to recover");
        return Ok(());
    }
    for status in report {
        let action = match status.action {
            RecoveryAction::Replayed { entries } => format!("replayed {entries} entries"),
            RecoveryAction::Cleaned => "cleaned".to_string(),
            RecoveryAction::RolledBack => "rolled back".to_string(),
            RecoveryAction::InDoubt => "in doubt".to_string(),
        };
        let types: Vec<String> = status.data_types.iter().map(ToString::to_string).collect();
        println!("{}  {:<24} [{}]", status.xid, action, types.join(", "));
    }
    if report.iter().any(|s| s.action == RecoveryAction::InDoubt) {
        bail!("some transactions are still in doubt; rerun after auto_rollback_secs");
    }
    Ok(())
}
