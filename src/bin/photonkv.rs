//! PhotonKV admin binary
//!
//! Opens an engine directory for one maintenance command and exits.
//!
//! # Examples
//!
//! ```bash
//! # Store statistics
//! photonkv --data-dir /var/lib/photonkv info
//!
//! # Backup, keeping the configured number of older backups
//! photonkv --data-dir /var/lib/photonkv save
//!
//! # Drain pending deletions without the background thread
//! photonkv --data-dir /var/lib/photonkv reclaim --cycles 10000
//! ```

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use photonkv::engine::{Context, ReclaimCycle};
use photonkv::{Engine, Options};
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PhotonKV - versioned key-value engine
#[derive(Parser, Debug)]
#[command(name = "photonkv")]
#[command(version = photonkv::VERSION)]
#[command(about = "PhotonKV - versioned key-value engine", long_about = None)]
#[command(author = "Anton Feldmann <anton.feldmann@gmail.com>")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine directory (holds data/ and backup/)
    #[arg(long, global = true, default_value = "data/photonkv", env = "PHOTONKV_DATA")]
    data_dir: PathBuf,

    /// TOML options file
    #[arg(long, global = true, env = "PHOTONKV_CONFIG")]
    config: Option<PathBuf>,

    /// Log directory path
    #[arg(long, global = true, default_value = "logs", env = "PHOTONKV_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show store properties and reclaimer counters
    Info,

    /// Show the estimated key count
    Size,

    /// Compact the store
    Compact,

    /// Persist buffered writes
    Flush {
        /// Write a full checkpoint instead of only syncing the log
        #[arg(long)]
        wait: bool,
    },

    /// Create and verify a backup
    Save,

    /// List backups
    Backups,

    /// Delete every key
    FlushAll {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Read a string value
    Get { key: String },

    /// Write a string value
    Set { key: String, value: String },

    /// Delete a key
    Del { key: String },

    /// Run reclaim cycles in the foreground
    Reclaim {
        /// Stop after this many cycles (stops earlier once idle)
        #[arg(long, default_value = "1000")]
        cycles: u64,
    },

    /// List pending delete markers
    Pending {
        #[arg(long, default_value = "100")]
        limit: i64,
    },

    /// Print the default options as TOML
    DefaultConfig,

    /// Show version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::DefaultConfig => {
            print!("{}", Options::default().to_toml()?);
            return Ok(());
        }
        Commands::Version => {
            println!("PhotonKV {}", photonkv::VERSION);
            return Ok(());
        }
        _ => {}
    }

    setup_logging(&cli)?;

    let mut options = match &cli.config {
        Some(path) => Options::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => Options::default(),
    };
    // One-shot commands drive reclaim explicitly
    options.start_reclaimer = false;

    let engine: Engine = Engine::open(options, &cli.data_dir)
        .with_context(|| format!("opening {}", cli.data_dir.display()))?;
    run_command(&engine, cli.command)?;
    engine.close()?;
    Ok(())
}

fn run_command(engine: &Engine, command: Commands) -> anyhow::Result<()> {
    let mut ctx = Context::local();
    match command {
        Commands::Info => {
            for (name, value) in engine.info() {
                if value.contains('\n') {
                    println!("{}:", name);
                    for line in value.lines() {
                        println!("  {}", line);
                    }
                } else {
                    println!("{:<36} {}", name, value);
                }
            }
            let (files, bytes) = engine.data_files()?;
            println!("{:<36} {} files, {} bytes", "data-files", files, bytes);
        }
        Commands::Size => println!("{}", engine.size()),
        Commands::Compact => {
            info!("Compacting storage...");
            engine.compact()?;
            println!("Compaction finished");
        }
        Commands::Flush { wait } => {
            engine.flush(wait)?;
            println!("Flushed");
        }
        Commands::Save => {
            let backup = engine.save()?;
            println!(
                "Backup {} at {} ({} bytes, {} keys)",
                backup.id, backup.timestamp, backup.size, backup.num_keys
            );
        }
        Commands::Backups => {
            let backups = engine.backups()?;
            if backups.is_empty() {
                println!("No backups found.");
            }
            for backup in backups {
                println!(
                    "{:>4}  {}  {:>12} bytes  {:>10} keys  crc {:#010x}",
                    backup.id, backup.timestamp, backup.size, backup.num_keys, backup.crc32
                );
            }
        }
        Commands::FlushAll { force } => {
            if !force && !confirm("Delete every key?")? {
                println!("Aborted.");
                return Ok(());
            }
            let deleted = engine.flush_all(&mut ctx)?;
            println!("{} keys deleted", deleted);
        }
        Commands::Get { key } => match engine.get_string(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Commands::Set { key, value } => {
            engine.put_string(&mut ctx, key.as_bytes(), value.as_bytes())?;
            println!("OK");
        }
        Commands::Del { key } => {
            let existed = engine.del(&mut ctx, key.as_bytes())?;
            println!("{}", u8::from(existed));
        }
        Commands::Reclaim { cycles } => {
            let mut swept = 0u64;
            let mut abandoned = 0u64;
            for _ in 0..cycles {
                match engine.run_reclaim_cycle()? {
                    ReclaimCycle::Idle => break,
                    ReclaimCycle::Swept(..) => swept += 1,
                    ReclaimCycle::Abandoned => abandoned += 1,
                }
            }
            if abandoned > 0 {
                warn!(abandoned, "Some markers could not be reclaimed");
            }
            println!("{} swept, {} abandoned", swept, abandoned);
        }
        Commands::Pending { limit } => {
            for marker in engine.pending_reclaims(limit)? {
                println!(
                    "{}  version {}",
                    String::from_utf8_lossy(&marker.key),
                    marker.version
                );
            }
        }
        Commands::DefaultConfig | Commands::Version => {}
    }
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{} (yes/no): ", prompt);
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("yes"))
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "photonkv.log");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        .with(fmt::layer().with_writer(file_appender).with_ansi(false))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}
