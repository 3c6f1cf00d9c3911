use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use eoka_resolver::{CacheConfig, CandidateStore, Config, FileKv};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "eoka-resolver")]
#[command(about = "Element resolution config and cache tooling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output (-v for info, -vv for debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a config file and print a summary
    Check {
        config: PathBuf,
    },
    /// Inspect or maintain a persisted candidate cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// List cached candidates
    List { file: PathBuf },
    /// Remove expired entries and enforce the entry limit
    Sweep {
        file: PathBuf,
        /// Config supplying the cache policy (defaults otherwise)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Remove all entries, or one namespace's
    Clear {
        file: PathBuf,
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[tokio::main]
async fn main() -> eoka_resolver::Result<()> {
    let cli = Cli::parse();

    let level = if cli.quiet {
        Level::ERROR
    } else {
        match cli.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            _ => Level::DEBUG,
        }
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    match cli.command {
        Command::Check { config } => check(&config),
        Command::Cache { action } => cache(action).await,
    }
}

fn check(path: &Path) -> eoka_resolver::Result<()> {
    let config = Config::load(path)?;
    println!("Config valid: {}", path.display());
    println!(
        "  Resolver: min confidence {}, deadline {}ms",
        config.resolver.min_confidence, config.resolver.request_deadline_ms
    );
    println!(
        "  Cache: ttl {}ms, max {} entries",
        config.cache.ttl_ms, config.cache.max_entries
    );
    println!(
        "  Stabilize: {} stable samples, timeout {}ms",
        config.stabilize.stable_samples, config.stabilize.timeout_ms
    );

    let mut names: Vec<&String> = config.providers.keys().collect();
    names.sort();
    println!("  Providers: {}", names.len());
    for name in names {
        let provider = &config.providers[name];
        let versions: Vec<&str> = provider.versions.keys().map(String::as_str).collect();
        let default = provider.default_version.as_deref().unwrap_or("-");
        println!("    - {} (versions: [{}], default: {})", name, versions.join(", "), default);
        println!("      targets: {}", provider.targets().join(", "));
    }
    Ok(())
}

/// Policy for commands that must not evict while reading the cache.
fn unbounded() -> CacheConfig {
    CacheConfig {
        max_entries: usize::MAX,
        ..CacheConfig::default()
    }
}

/// Open a file cache and index everything persisted in it.
/// Returns the store and how many entries were found.
async fn open(file: PathBuf, config: CacheConfig) -> (CandidateStore, usize) {
    let store = CandidateStore::new(Arc::new(FileKv::new(file)), config);
    let found = store.hydrate().await;
    (store, found)
}

async fn cache(action: CacheAction) -> eoka_resolver::Result<()> {
    match action {
        CacheAction::List { file } => {
            let (store, _) = open(file, unbounded()).await;
            let now = store.clock().now_ms();
            let entries = store.entries();
            if entries.is_empty() {
                println!("No cached candidates");
            }
            for (key, entry) in entries {
                let expires = Utc
                    .timestamp_millis_opt(entry.expires_at)
                    .single()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| entry.expires_at.to_string());
                let state = if entry.is_expired(now) { " (expired)" } else { "" };
                println!("{}  {}", key, entry.record.locator);
                println!(
                    "    layer: {}, confidence: {}, expires: {}{}",
                    entry.record.layer, entry.record.confidence, expires, state
                );
            }
        }
        CacheAction::Sweep { file, config } => {
            let policy = match config {
                Some(path) => Config::load(path)?.cache,
                None => CacheConfig::default(),
            };
            // Hydrating under the policy already evicts past max_entries.
            let (store, found) = open(file, policy).await;
            store.force_sweep().await;
            let remaining = store.len();
            println!("Removed {} entries, {} remain", found.saturating_sub(remaining), remaining);
        }
        CacheAction::Clear { file, namespace } => {
            let (store, _) = open(file, unbounded()).await;
            let removed = store.clear(namespace.as_deref()).await;
            println!("Removed {} entries", removed);
        }
    }
    Ok(())
}
