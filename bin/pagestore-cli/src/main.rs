//! PageStore CLI - drive a page store directory from the shell
//!
//! Every invocation opens the store, runs one command, and shuts the store
//! down so the registry snapshot carries the ledgers to the next invocation.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pagestore_common::{ItemKey, ItemQuery, SessionId, StoreConfig};
use pagestore_storage::{BlobStore, HandlePool, StatsSnapshot};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "pagestore-cli")]
#[command(about = "PageStore blob store CLI")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "pagestore.toml")]
    config: String,

    /// Root directory holding the <app>-filestore folder
    #[arg(long, env = "PAGESTORE_ROOT")]
    root_dir: Option<PathBuf>,

    /// Application name
    #[arg(long)]
    app_name: Option<String>,

    /// Write through on the calling thread instead of the flusher
    #[arg(long)]
    synchronous: bool,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store a blob
    Put {
        session: String,
        stream: String,
        id: i32,
        #[arg(long, default_value_t = 0)]
        item_version: i32,
        #[arg(long, default_value_t = 0)]
        sub_version: i32,
        /// Inline payload
        #[arg(long, conflicts_with = "file")]
        data: Option<String>,
        /// Read the payload from a file
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Load a blob; -1 selects the latest version or sub-version
    Get {
        session: String,
        stream: String,
        id: i32,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        item_version: i32,
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        sub_version: i32,
        /// Write the payload here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Remove one item (every version) or the whole sub-stream
    Rm {
        session: String,
        stream: String,
        /// Item id; omit to drop the sub-stream and its file
        #[arg(long)]
        id: Option<i32>,
    },
    /// Drop a session and all of its files
    Unbind { session: String },
    /// List the most recently written windows of a sub-stream
    Recent {
        session: String,
        stream: String,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Print sessions, pool state and counters as JSON
    Stats,
}

/// Configuration file structure
#[derive(Debug, Deserialize, Default)]
struct Config {
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
struct LoggingConfig {
    #[serde(default = "default_log_level")]
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

#[derive(Debug, Serialize)]
struct StatsReport {
    store_dir: PathBuf,
    synchronous: bool,
    pool: PoolReport,
    sessions: Vec<SessionReport>,
    counters: StatsSnapshot,
}

#[derive(Debug, Serialize)]
struct PoolReport {
    capacity: usize,
    open: usize,
    idle: usize,
    opened: u64,
    reclaimed: u64,
    deferred_deletes: u64,
    over_capacity: u64,
}

#[derive(Debug, Serialize)]
struct SessionReport {
    id: String,
    size: u64,
    streams: Vec<StreamReport>,
}

#[derive(Debug, Serialize)]
struct StreamReport {
    name: String,
    size: u64,
}

fn load_config(path: &str) -> Config {
    if !std::path::Path::new(path).exists() {
        return Config::default();
    }
    match std::fs::read_to_string(path).map(|s| toml::from_str::<Config>(&s)) {
        Ok(Ok(config)) => config,
        Ok(Err(e)) => {
            eprintln!("Warning: Failed to parse config file: {}", e);
            Config::default()
        }
        Err(e) => {
            eprintln!("Warning: Failed to read config file: {}", e);
            Config::default()
        }
    }
}

/// Command line values take precedence over the config file
fn apply_overrides(mut config: StoreConfig, args: &Args) -> StoreConfig {
    if let Some(root_dir) = &args.root_dir {
        config.root_dir.clone_from(root_dir);
    }
    if let Some(app_name) = &args.app_name {
        config.app_name.clone_from(app_name);
    }
    if args.synchronous {
        config.synchronous = true;
    }
    config
}

fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args.config);

    // Initialize logging
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

    let store_config = apply_overrides(config.store, &args);
    debug!("Store config: {:?}", store_config);

    let store = BlobStore::open(store_config).context("failed to open page store")?;
    let result = run(&store, args.command);
    store.shutdown();
    result
}

fn run(store: &BlobStore, command: Commands) -> Result<()> {
    match command {
        Commands::Put {
            session,
            stream,
            id,
            item_version,
            sub_version,
            data,
            file,
        } => {
            let bytes = match (data, file) {
                (Some(data), None) => data.into_bytes(),
                (None, Some(path)) => std::fs::read(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?,
                _ => bail!("exactly one of --data or --file is required"),
            };

            let key = ItemKey::new(id, item_version, sub_version);
            let errors_before = store.stats().snapshot().write_errors;
            store.store(&SessionId::new(session.as_str()), &stream, key, &bytes);
            store.flush();
            if store.stats().snapshot().write_errors > errors_before {
                bail!("failed to write {} to {}/{}", key, session, stream);
            }
            info!("Stored {} bytes as {} in {}/{}", bytes.len(), key, session, stream);
            println!("stored {key} ({} bytes)", bytes.len());
        }
        Commands::Get {
            session,
            stream,
            id,
            item_version,
            sub_version,
            out,
        } => {
            let query = ItemQuery::from_raw(id, item_version, sub_version);
            let Some(bytes) = store.load(&SessionId::new(session.as_str()), &stream, query) else {
                bail!("item {} not found in {}/{}", id, session, stream);
            };
            match out {
                Some(path) => std::fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => {
                    let mut stdout = std::io::stdout().lock();
                    stdout.write_all(&bytes)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::Rm {
            session,
            stream,
            id,
        } => {
            store.remove(&SessionId::new(session), &stream, id);
        }
        Commands::Unbind { session } => {
            store.unbind(&SessionId::new(session));
        }
        Commands::Recent {
            session,
            stream,
            count,
        } => {
            for window in store.recent_windows(&SessionId::new(session), &stream, count) {
                println!("{}\toffset={}\tsize={}", window.key, window.offset, window.size);
            }
        }
        Commands::Stats => {
            let report = stats_report(store);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

fn stats_report(store: &BlobStore) -> StatsReport {
    let sessions = store
        .sessions()
        .into_iter()
        .map(|id| {
            let streams: Vec<StreamReport> = store
                .stream_sizes(&id)
                .into_iter()
                .map(|(name, size)| StreamReport { name, size })
                .collect();
            SessionReport {
                size: streams.iter().map(|s| s.size).sum(),
                id: id.to_string(),
                streams,
            }
        })
        .collect();

    StatsReport {
        store_dir: store.config().store_dir(),
        synchronous: store.config().synchronous,
        pool: pool_report(store.pool()),
        sessions,
        counters: store.stats().snapshot(),
    }
}

fn pool_report(pool: &HandlePool) -> PoolReport {
    let stats = pool.stats();
    PoolReport {
        capacity: pool.capacity(),
        open: pool.open_count(),
        idle: pool.idle_count(),
        opened: stats.opened.load(Ordering::Relaxed),
        reclaimed: stats.reclaimed.load(Ordering::Relaxed),
        deferred_deletes: stats.deferred_deletes.load(Ordering::Relaxed),
        over_capacity: stats.over_capacity.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_file_with_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pagestore.toml");
        std::fs::write(
            &path,
            r#"
            [store]
            app_name = "shop"
            max_bytes_per_sub_stream = 4096
            max_bytes_per_session = 8192

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        let config = load_config(path.to_str().unwrap());
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.store.max_bytes_per_sub_stream, 4096);

        let args = Args::parse_from([
            "pagestore-cli",
            "--root-dir",
            "/srv/pages",
            "--synchronous",
            "stats",
        ]);
        let store = apply_overrides(config.store, &args);
        assert_eq!(store.root_dir, PathBuf::from("/srv/pages"));
        assert_eq!(store.app_name, "shop");
        assert!(store.synchronous);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let config = load_config("/nonexistent/pagestore.toml");
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.store.handle_pool_capacity, 50);
    }

    #[test]
    fn test_get_accepts_wildcards() {
        let args = Args::parse_from([
            "pagestore-cli",
            "get",
            "s1",
            "main",
            "7",
            "--item-version",
            "-1",
        ]);
        match args.command {
            Commands::Get {
                id,
                item_version,
                sub_version,
                ..
            } => assert_eq!(
                ItemQuery::from_raw(id, item_version, sub_version),
                ItemQuery::latest(7)
            ),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_commands_round_trip_through_snapshot() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::with_root_dir(dir.path());

        {
            let store = BlobStore::open(config.clone()).unwrap();
            run(
                &store,
                Commands::Put {
                    session: "s1".into(),
                    stream: "main".into(),
                    id: 1,
                    item_version: 0,
                    sub_version: 0,
                    data: Some("hello".into()),
                    file: None,
                },
            )
            .unwrap();
        }

        let store = BlobStore::open(config).unwrap();
        let report = stats_report(&store);
        assert_eq!(report.sessions.len(), 1);
        assert_eq!(report.sessions[0].size, 5);
        assert_eq!(report.pool.capacity, 50);
        assert_eq!(
            store.load(&SessionId::new("s1"), "main", ItemQuery::latest(1)),
            Some(b"hello".to_vec())
        );

        run(&store, Commands::Unbind { session: "s1".into() }).unwrap();
        assert!(store.sessions().is_empty());
    }
}
