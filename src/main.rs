use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use tilecask::config::{CacheConfig, ServerConfig, ShardConfig};
use tilecask::dataset::{DatasetCache, ExpirySweep};
use tilecask::fs::{FileSystem, LocalFs};
use tilecask::http::{build_router, AppState};
use tilecask::pack::{pack_directory, PackOptions};
use tilecask::scheduler::Scheduler;
use tilecask::shard::ShardReader;

#[derive(Parser)]
#[command(name = "tilecask")]
#[command(about = "Serve small immutable blobs out of bloom-filtered shard files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve datasets below a root directory over HTTP
    Serve(ServeArgs),
    /// Pack the files of a directory into shards
    Pack(PackArgs),
    /// Print the keys stored in a shard, one per line
    List(ListArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Directory holding one sub-directory per dataset
    #[arg(long, env = "TILECASK_ROOT")]
    root: PathBuf,

    /// Address to listen on
    #[arg(long, env = "TILECASK_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Evict datasets idle for this many seconds
    #[arg(long, env = "TILECASK_TTL_SECS", default_value_t = 86_400)]
    ttl_secs: u64,

    /// Seconds between idle-dataset sweeps
    #[arg(long, env = "TILECASK_SWEEP_SECS", default_value_t = 60)]
    sweep_secs: u64,

    /// Per-request timeout in seconds
    #[arg(long, env = "TILECASK_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,
}

#[derive(Args)]
struct PackArgs {
    /// Directory of files to pack
    input: PathBuf,

    /// Directory to write shards into
    output: PathBuf,

    /// Sample every Nth key into the sparse index
    #[arg(long, default_value_t = 128)]
    index_interval: u32,

    /// Number of keys each bloom filter is sized for
    #[arg(long, default_value_t = 1024 * 1024)]
    bloom_keys: u64,

    /// Target bloom false-positive rate
    #[arg(long, default_value_t = 0.005)]
    bloom_error_rate: f64,

    /// Start a new shard after this many entries
    #[arg(long)]
    shard_entries: Option<u64>,
}

#[derive(Args)]
struct ListArgs {
    /// Shard directory holding data, index and bloom
    shard: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tilecask=info,tower_http=info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
        Command::Pack(args) => pack(args).await,
        Command::List(args) => list(args),
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = ServerConfig::new(args.root)
        .listen(args.listen)
        .request_timeout(Duration::from_secs(args.request_timeout_secs))
        .cache(
            CacheConfig::default()
                .ttl(Duration::from_secs(args.ttl_secs))
                .sweep_interval(Duration::from_secs(args.sweep_secs)),
        );
    config.validate()?;

    let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new());
    let cache = Arc::new(DatasetCache::new(fs, &config.root, config.cache.clone()));

    let scheduler = Scheduler::new();
    scheduler.register(Arc::new(ExpirySweep::new(
        cache.clone(),
        config.cache.sweep_interval,
    )))?;

    let app = build_router(AppState::new(cache.clone()), &config);
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    info!(
        root = %config.root.display(),
        addr = %config.listen,
        ttl = ?config.cache.ttl,
        "Serving datasets"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    scheduler.shutdown().await?;
    cache.clear();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn pack(args: PackArgs) -> anyhow::Result<()> {
    let mut options = PackOptions::default().shard(
        ShardConfig::default()
            .index_interval(args.index_interval)
            .bloom_expected_keys(args.bloom_keys)
            .bloom_error_rate(args.bloom_error_rate),
    );
    if let Some(entries) = args.shard_entries {
        options = options.shard_entries(entries);
    }

    let fs: Arc<dyn FileSystem> = Arc::new(LocalFs::new());
    let input = args.input.clone();
    let output = args.output.clone();
    let summary = tokio::task::spawn_blocking(move || pack_directory(fs, &input, &output, &options))
        .await?
        .with_context(|| format!("packing {}", args.input.display()))?;

    for shard in &summary.shards {
        println!(
            "{}\t{} entries\t{} bytes",
            shard.dir.display(),
            shard.entry_count,
            shard.data_len
        );
    }
    info!(
        files = summary.files,
        skipped = summary.skipped,
        shards = summary.shards.len(),
        "Packed {}",
        args.output.display()
    );
    Ok(())
}

fn list(args: ListArgs) -> anyhow::Result<()> {
    let reader = ShardReader::open(&LocalFs::new(), &args.shard)
        .with_context(|| format!("opening shard {}", args.shard.display()))?;
    let keys = reader.keys()?;

    let mut out = std::io::BufWriter::new(std::io::stdout().lock());
    for key in &keys {
        writeln!(out, "{}", String::from_utf8_lossy(key))?;
    }
    out.flush()?;
    tracing::debug!(shard = %args.shard.display(), keys = keys.len(), "Listed shard");
    Ok(())
}
