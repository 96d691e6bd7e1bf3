mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::{ConfigError, LockstashConfig};
use lockstash_cache::{
    Cache, CacheError, CacheStatus, DecompressorRegistry, Dispatcher, ErrorClass, EvictOutcome,
    PurgeReport, RebuildReport,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "lockstash",
    version,
    about = "Shared, size-bounded cache of decompressed files"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML file with `[cache]` and `[logging]` tables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Cache directory (overrides the config file and LOCKSTASH_CACHE_DIR)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,
    /// Cache file name prefix
    #[arg(long, global = true)]
    prefix: Option<String>,
    /// Cache size limit in megabytes
    #[arg(long, global = true)]
    max_size_mb: Option<u64>,
    /// Log level or `EnvFilter` directives (merged with RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the path of the decompressed copy of SOURCE, producing it if needed
    Fetch(FetchArgs),
    /// Print the cache file name derived for SOURCE
    Path(SourceArgs),
    /// Show the recorded and actual cache size and the cached entries
    Status(JsonArgs),
    /// Remove least recently used entries down to the target size
    Purge(JsonArgs),
    /// Remove the cached copy of SOURCE unless it is in use
    Evict(SourceArgs),
    /// Rebuild the cache info file from the entries on disk
    Repair(JsonArgs),
}

#[derive(Args)]
struct FetchArgs {
    /// Compressed source file
    source: PathBuf,
    /// Keep the read lock for this many milliseconds before releasing it
    #[arg(long, default_value_t = 0)]
    hold_ms: u64,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct SourceArgs {
    source: PathBuf,
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct JsonArgs {
    /// Emit JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct FetchOutput {
    source: PathBuf,
    path: PathBuf,
    cached: bool,
}

#[derive(Serialize)]
struct PathOutput {
    source: PathBuf,
    path: PathBuf,
}

#[derive(Serialize)]
struct EvictOutput {
    path: PathBuf,
    #[serde(flatten)]
    outcome: EvictOutcome,
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("lockstash: {:#}", err);
            exit_code_for(&err)
        }
    };

    std::process::exit(exit_code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    match err.downcast_ref::<CacheError>().map(CacheError::class) {
        Some(ErrorClass::Configuration) => 2,
        Some(ErrorClass::Decompression) => 3,
        _ => 1,
    }
}

fn load_config(global: &GlobalArgs) -> Result<LockstashConfig> {
    let mut config = match &global.config {
        Some(path) => LockstashConfig::load_from_path(path)?,
        None => LockstashConfig::default(),
    };
    config.cache.merge_env()?;

    if let Some(dir) = &global.cache_dir {
        config.cache.dir = dir.clone();
    }
    if let Some(prefix) = &global.prefix {
        config.cache.prefix = prefix.clone();
    }
    if let Some(max_size_mb) = global.max_size_mb {
        config.cache.max_size_mb = max_size_mb;
    }
    if let Some(level) = &global.log_level {
        config.logging.level = level.clone();
    }
    if global.log_json {
        config.logging.json = true;
    }
    Ok(config)
}

fn run(cli: Cli) -> Result<i32> {
    let config = load_config(&cli.global)?;
    logging::init_tracing(&config.logging);
    tracing::debug!(
        target: "lockstash.cli",
        dir = %config.cache.dir.display(),
        prefix = %config.cache.prefix,
        max_size_mb = config.cache.max_size_mb,
        "configuration loaded"
    );
    config.cache.validate()?;

    match cli.command {
        Command::Path(args) => {
            let path = lockstash_cache::cache_file_name_for_path(
                &config.cache.dir,
                &config.cache.prefix,
                &args.source,
            )?;
            if args.json {
                print_json(&PathOutput {
                    source: args.source,
                    path,
                })?;
            } else {
                println!("{}", path.display());
            }
            Ok(0)
        }
        Command::Fetch(args) => {
            let cache = Cache::new(&config.cache)?;
            let dispatcher = Dispatcher::new(&cache, DecompressorRegistry::with_builtin());
            let fetched = dispatcher
                .fetch(&args.source)
                .with_context(|| format!("fetch {}", args.source.display()))?;

            let output = FetchOutput {
                path: fetched
                    .as_ref()
                    .map(|lock| lock.path().to_path_buf())
                    .unwrap_or_else(|| args.source.clone()),
                cached: fetched.is_some(),
                source: args.source,
            };
            if args.json {
                print_json(&output)?;
            } else {
                println!("{}", output.path.display());
            }

            if let Some(lock) = fetched {
                if args.hold_ms > 0 {
                    std::thread::sleep(Duration::from_millis(args.hold_ms));
                }
                cache.unlock(lock)?;
            }
            Ok(0)
        }
        Command::Status(args) => {
            let cache = Cache::new(&config.cache)?;
            let status = cache.status()?;
            print_status(&status, args.json)?;
            Ok(if status.is_consistent() { 0 } else { 1 })
        }
        Command::Purge(args) => {
            let cache = Cache::new(&config.cache)?;
            let report = cache.purge_now()?;
            print_purge(&report, args.json)?;
            Ok(0)
        }
        Command::Evict(args) => {
            let cache = Cache::new(&config.cache)?;
            let path = cache.cache_file_name_for_path(&args.source)?;
            let outcome = cache.purge_file(&path)?;
            if args.json {
                print_json(&EvictOutput {
                    path: path.clone(),
                    outcome,
                })?;
            } else {
                match outcome {
                    EvictOutcome::Removed { bytes } => {
                        println!("removed {} ({bytes} bytes)", path.display())
                    }
                    EvictOutcome::Busy => println!("busy {}", path.display()),
                    EvictOutcome::Absent => println!("absent {}", path.display()),
                }
            }
            Ok(if outcome == EvictOutcome::Busy { 1 } else { 0 })
        }
        Command::Repair(args) => {
            let cache = Cache::new(&config.cache)?;
            let report = cache.rebuild_ledger()?;
            print_repair(&report, args.json)?;
            Ok(0)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

fn print_status(status: &CacheStatus, json: bool) -> Result<()> {
    if json {
        return print_json(status);
    }

    println!("cache:");
    println!("  dir: {}", status.dir.display());
    println!("  prefix: {}", status.prefix);
    println!("  max_size_bytes: {}", status.max_size_bytes);
    println!("  target_size_bytes: {}", status.target_size_bytes);
    println!("  ledger_bytes: {}", status.ledger_bytes);
    println!("  scanned_bytes: {}", status.scanned_bytes);
    println!("  consistent: {}", status.is_consistent());
    println!("  entries: {}", status.entries.len());
    for entry in &status.entries {
        println!("    {} ({} bytes)", entry.path.display(), entry.size_bytes);
    }
    Ok(())
}

fn print_purge(report: &PurgeReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    println!("purge:");
    println!("  before_bytes: {}", report.before_bytes);
    println!("  after_bytes: {}", report.after_bytes);
    println!("  target_bytes: {}", report.target_bytes);
    for entry in &report.removed {
        println!("  removed: {} ({} bytes)", entry.path.display(), entry.size_bytes);
    }
    for path in &report.skipped_busy {
        println!("  busy: {}", path.display());
    }
    Ok(())
}

fn print_repair(report: &RebuildReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }

    match report.previous_bytes {
        Some(previous) => println!("repair: {previous} -> {} bytes", report.current_bytes),
        None => println!("repair: (unreadable) -> {} bytes", report.current_bytes),
    }
    for path in &report.removed_empty {
        println!("  removed empty: {}", path.display());
    }
    Ok(())
}
