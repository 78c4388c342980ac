//! diskcache CLI
//!
//! Entry point for the `diskcache` command-line tool.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use diskcache::{CacheConfig, Cacheable, FileCache, FileResource, Upstream, UNKNOWN};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "diskcache")]
#[command(about = "Size-bounded disk cache for byte streams", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Cache root directory (overrides config and environment)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Size limit in bytes (overrides config and environment)
    #[arg(long, global = true)]
    limit: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream an entry, filling the cache from a source on a miss
    Get {
        /// Entry id
        id: String,

        /// Declared size in bytes (-1 if unknown)
        #[arg(long, default_value_t = UNKNOWN, allow_negative_numbers = true)]
        size: i64,

        /// Version timestamp (-1 if unknown)
        #[arg(long, default_value_t = UNKNOWN, allow_negative_numbers = true)]
        last_modified: i64,

        /// File to read the content from on a miss
        #[arg(long)]
        source: Option<PathBuf>,

        /// Write to this file instead of stdout
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Cache a local file
    Put {
        /// File to cache
        file: PathBuf,

        /// Entry id (default: the canonical path of the file)
        #[arg(long)]
        id: Option<String>,
    },

    /// List cached entries
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show current size and limit
    Size {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Delete one entry unless it is in use
    Evict {
        /// Entry id
        id: String,

        /// Declared size in bytes (-1 if unknown)
        #[arg(long, allow_negative_numbers = true)]
        size: i64,

        /// Version timestamp (-1 if unknown)
        #[arg(long, allow_negative_numbers = true)]
        last_modified: i64,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref(), cli.root, cli.limit) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(2);
        }
    };

    let cache = match FileCache::open(config) {
        Ok(cache) => cache,
        Err(e) => {
            eprintln!("Error opening cache: {}", e);
            process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Get {
            id,
            size,
            last_modified,
            source,
            output,
        } => run_get(&cache, &id, size, last_modified, source, output),
        Commands::Put { file, id } => run_put(&cache, &file, id),
        Commands::List { json } => run_list(&cache, json),
        Commands::Size { json } => run_size(&cache, json),
        Commands::Evict {
            id,
            size,
            last_modified,
        } => run_evict(&cache, &id, size, last_modified),
    };

    cache.shutdown();
    process::exit(code);
}

fn load_config(
    path: Option<&Path>,
    root: Option<PathBuf>,
    limit: Option<u64>,
) -> Result<CacheConfig, diskcache::ConfigError> {
    let mut config = CacheConfig::load(path)?;
    if let Some(root) = root {
        config.cache_root = root;
    }
    if let Some(limit) = limit {
        config.size_limit = limit;
    }
    config.validate()?;
    Ok(config)
}

fn run_get(
    cache: &FileCache,
    id: &str,
    size: i64,
    last_modified: i64,
    source: Option<PathBuf>,
    output: Option<PathBuf>,
) -> i32 {
    let upstream: Option<Upstream> = match source {
        Some(path) => match File::open(&path) {
            Ok(file) => Some(Box::new(file) as Upstream),
            Err(e) => {
                eprintln!("Error opening source {}: {}", path.display(), e);
                return 1;
            }
        },
        None => None,
    };

    let Some(mut stream) = cache.get_cached_stream(id, upstream, size, last_modified) else {
        eprintln!("Not cached: {}", id);
        return 1;
    };
    debug!(id, kind = ?stream.kind(), "serving entry");

    let copied = match output {
        Some(path) => File::create(&path).and_then(|mut out| io::copy(&mut stream, &mut out)),
        None => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            io::copy(&mut stream, &mut out).and_then(|n| out.flush().map(|_| n))
        }
    };
    stream.close();

    match copied {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("Error reading {}: {}", id, e);
            1
        }
    }
}

fn run_put(cache: &FileCache, file: &Path, id: Option<String>) -> i32 {
    let resource = match id {
        Some(id) => FileResource::with_id(file, id),
        None => FileResource::new(file),
    };
    let resource = match resource {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Error reading {}: {}", file.display(), e);
            return 1;
        }
    };

    let mut stream = match cache.get_cacheable(&resource) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error fetching {}: {}", file.display(), e);
            return 1;
        }
    };
    let kind = stream.kind();
    let copied = io::copy(&mut stream, &mut io::sink());
    stream.close();

    match copied {
        Ok(bytes) => {
            println!("{} ({} bytes, {:?})", resource.unique_id(), bytes, kind);
            0
        }
        Err(e) => {
            eprintln!("Error caching {}: {}", file.display(), e);
            1
        }
    }
}

fn run_list(cache: &FileCache, json_output: bool) -> i32 {
    let entries = cache.entries();

    if json_output {
        let output: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.key.id_lossy(),
                    "size": e.key.size(),
                    "last_modified": e.key.last_modified(),
                    "len": e.len,
                    "complete": e.complete,
                    "last_access": e.last_access.map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
                    "path": e.path.display().to_string(),
                })
            })
            .collect();

        return match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                1
            }
        };
    }

    if entries.is_empty() {
        println!("Cache is empty.");
        return 0;
    }

    println!("Cached entries ({} total):\n", entries.len());
    for entry in entries {
        let size = match entry.key.known_size() {
            Some(size) => size.to_string(),
            None => "unknown".to_string(),
        };
        println!("  {}", entry.key.id_lossy());
        println!("    Size: {} on disk / {} declared", entry.len, size);
        println!("    Last modified: {}", entry.key.last_modified());
        println!("    Complete: {}", if entry.complete { "yes" } else { "no" });
        if let Some(t) = entry.last_access {
            println!("    Last access: {}", DateTime::<Utc>::from(t).format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    0
}

fn run_size(cache: &FileCache, json_output: bool) -> i32 {
    let current = cache.current_size();
    let limit = cache.size_limit();

    if json_output {
        let output = serde_json::json!({
            "current_size": current,
            "size_limit": limit,
            "root": cache.layout().root().display().to_string(),
        });
        return match serde_json::to_string_pretty(&output) {
            Ok(json) => {
                println!("{}", json);
                0
            }
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                1
            }
        };
    }

    println!("{} of {} bytes used ({})", current, limit, cache.layout().root().display());
    0
}

fn run_evict(cache: &FileCache, id: &str, size: i64, last_modified: i64) -> i32 {
    if cache.evict(id, size, last_modified) {
        println!("Evicted {}", id);
        0
    } else {
        eprintln!("Entry {} is not cached or is in use", id);
        1
    }
}
