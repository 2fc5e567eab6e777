//! SubKV CLI
//!
//! Command-line access to a region file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use subkv::{replay, save_log, Engine, ErrorPolicy, OpenMode, RegionConfig, SetOptions};
use tracing_subscriber::{fmt, EnvFilter};

/// SubKV CLI
#[derive(Parser, Debug)]
#[command(name = "subkv")]
#[command(about = "Inspect and edit a SubKV region file")]
#[command(version)]
struct Args {
    /// Region file
    #[arg(short, long, default_value = "./region.skv")]
    region: PathBuf,

    /// Page size used when the region is created
    #[arg(long, default_value = "256")]
    page_size: usize,

    /// Keep removed keys as history records
    #[arg(long)]
    history: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value of a key
    Get {
        key: String,

        /// Print the stored bytes, ignoring expiry and history
        #[arg(long)]
        raw: bool,
    },

    /// Store a value
    Set {
        key: String,

        value: String,

        /// Expire after this many seconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Subkey names (replaces the current list)
        #[arg(long, value_delimiter = ',')]
        subkeys: Option<Vec<String>>,
    },

    /// Remove a key
    Del {
        key: String,

        /// Remove the subkeys too, recursively
        #[arg(long)]
        recursive: bool,
    },

    /// List keys
    List {
        /// Include expired and history records
        #[arg(long)]
        all: bool,
    },

    /// List the subkeys of a key
    Subkeys { key: String },

    /// Print region counters and run a structural check
    Stats {
        #[arg(long)]
        verify: bool,
    },

    /// Release the last region area if possible
    Compact,

    /// Apply a transaction log to the region
    Replay {
        log: PathBuf,

        #[arg(long, value_enum, default_value = "fail-fast")]
        policy: Policy,
    },

    /// Write every key to a fresh transaction log
    Save { log: PathBuf },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    FailFast,
    Skip,
}

impl From<Policy> for ErrorPolicy {
    fn from(policy: Policy) -> Self {
        match policy {
            Policy::FailFast => ErrorPolicy::FailFast,
            Policy::Skip => ErrorPolicy::SkipOnError,
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn open(args: &Args, read_only: bool) -> subkv::Result<Engine> {
    let config = RegionConfig::builder()
        .path(&args.region)
        .open_mode(if read_only {
            OpenMode::Open
        } else {
            OpenMode::OpenOrCreate
        })
        .read_only(read_only)
        .page_size(args.page_size)
        .history(args.history)
        .build();
    Engine::open(config)
}

fn run(args: Args) -> subkv::Result<()> {
    match &args.command {
        Commands::Get { key, raw } => {
            let engine = open(&args, true)?;
            match engine.get_with(key.as_bytes(), !raw)? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }

        Commands::Set {
            key,
            value,
            ttl,
            subkeys,
        } => {
            let engine = open(&args, false)?;
            let mut options = SetOptions::new();
            if let Some(secs) = ttl {
                options = options.ttl(Duration::from_secs(*secs));
            }
            let names: Option<Vec<&[u8]>> = subkeys
                .as_ref()
                .map(|list| list.iter().map(|s| s.as_bytes()).collect());
            engine.set_with(key.as_bytes(), value.as_bytes(), names.as_deref(), &options)?;
            engine.close(None)?;
            println!("OK");
        }

        Commands::Del { key, recursive } => {
            let engine = open(&args, false)?;
            let removed = engine.remove(key.as_bytes(), *recursive)?;
            engine.close(None)?;
            println!("{}", if removed { "1" } else { "0" });
        }

        Commands::List { all } => {
            let engine = open(&args, true)?;
            let entries = if *all { engine.iter_all() } else { engine.iter() };
            for entry in entries {
                let entry = entry?;
                println!(
                    "{}\t{} bytes\t{} subkeys",
                    printable(&entry.key),
                    entry.value.len(),
                    entry.subkeys.len()
                );
            }
        }

        Commands::Subkeys { key } => {
            let engine = open(&args, true)?;
            for name in engine.get_subkeys(key.as_bytes())? {
                println!("{}", printable(&name));
            }
        }

        Commands::Stats { verify } => {
            let engine = open(&args, true)?;
            println!("{:#?}", engine.stats()?);
            if *verify {
                let report = engine.verify()?;
                println!("{:#?}", report);
                if !report.is_clean() {
                    std::process::exit(2);
                }
            }
        }

        Commands::Compact => {
            let engine = open(&args, false)?;
            let released = engine.compact()?;
            engine.close(None)?;
            println!("{}", if released { "area released" } else { "nothing to release" });
        }

        Commands::Replay { log, policy } => {
            let engine = open(&args, false)?;
            let stats = replay(&engine, log, (*policy).into())?;
            engine.close(None)?;
            println!("{:#?}", stats);
        }

        Commands::Save { log } => {
            let engine = open(&args, true)?;
            let saved = save_log(&engine, log)?;
            println!("{} keys saved", saved);
        }
    }
    Ok(())
}

/// Keys may hold arbitrary bytes; history keys contain a NUL
fn printable(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).replace('\0', "\\0")
}
