//! Cached Block File Bench
//!
//! Drives a randomized concurrent workload through a [`CachedBlockFile`]
//! and checks every read against a shadow copy of the file.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          cachedfile-bench                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐                          │
//! │  │ worker 0 │ │ worker 1 │ │ worker N │   each owns one region   │
//! │  │ + shadow │ │ + shadow │ │ + shadow │   of the file            │
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘                          │
//! │       └────────────┼────────────┘                                │
//! │                    ▼                                             │
//! │          CachedBlockFile ──► memory or filesystem lower file     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use bytes::{Bytes, BytesMut};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tracing::{debug, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cached_block_file::adapters::{
    CounterExporter, InMemoryReadCache, MemoryBlockFile, MemoryBlockFileConfig, ReadCacheConfig,
};
use cached_block_file::{
    BlockFile, CachedBlockFile, CachedFileConfig, FileId, IoBuffer, IoPriority, WritePolicy,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cached block file bench - randomized workload with shadow verification
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Back the file with this path instead of memory
    #[arg(long, env = "BENCH_PATH")]
    path: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(long, env = "BENCH_WORKERS", default_value = "4")]
    workers: usize,

    /// Operations per worker
    #[arg(long, env = "BENCH_OPS", default_value = "1000")]
    ops: usize,

    /// Bytes owned by each worker
    #[arg(long, env = "BENCH_REGION_SIZE", default_value = "1048576")]
    region_size: u64,

    /// Largest single transfer in bytes
    #[arg(long, env = "BENCH_MAX_IO_SIZE", default_value = "65536")]
    max_io_size: u64,

    /// Read cache capacity in MiB
    #[arg(long, env = "CACHE_CAPACITY_MB", default_value = "64")]
    cache_capacity_mb: u64,

    /// Write policy (cache-on-write, no-cache-on-write)
    #[arg(long, env = "WRITE_POLICY", default_value = "cache-on-write")]
    write_policy: WritePolicy,

    /// Maximum live request objects
    #[arg(long, env = "MAX_OUTSTANDING_REQUESTS", default_value = "1024")]
    max_outstanding_requests: usize,

    /// Maximum concurrent background I/O on the lower file
    #[arg(long, env = "BACKGROUND_QUEUE_LENGTH", default_value = "2")]
    background_queue_length: usize,

    /// Random seed (defaults to a random one)
    #[arg(long, env = "BENCH_SEED")]
    seed: Option<u64>,

    /// Print counters as JSON
    #[arg(long, env = "BENCH_JSON")]
    json: bool,

    /// Print counters in the Prometheus text format
    #[arg(long, env = "BENCH_PROMETHEUS")]
    prometheus: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    if args.workers == 0 || args.region_size < 4 || args.max_io_size == 0 {
        bail!("workers, region size and max I/O size must be positive");
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    let total_size = args
        .region_size
        .checked_mul(args.workers as u64)
        .context("file size overflows")?;

    info!("Starting cached block file bench");
    info!("  Workers: {}", args.workers);
    info!("  Operations per worker: {}", args.ops);
    info!("  File size: {} bytes", total_size);
    info!("  Write policy: {}", args.write_policy);
    info!("  Seed: {}", seed);

    let lower = open_lower_file(&args, total_size).await?;
    lower.set_background_queue_length(args.background_queue_length);

    let cache = Arc::new(InMemoryReadCache::new(ReadCacheConfig {
        capacity_bytes: args.cache_capacity_mb * 1024 * 1024,
    }));
    let file = Arc::new(CachedBlockFile::new(
        FileId::new(),
        lower,
        cache.clone(),
        CachedFileConfig {
            write_policy: args.write_policy,
            max_outstanding_requests: args.max_outstanding_requests,
        },
    )?);

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for worker in 0..args.workers {
        let file = Arc::clone(&file);
        let workload = Workload {
            base: worker as u64 * args.region_size,
            region_size: args.region_size,
            max_io_size: args.max_io_size.min(args.region_size / 4).max(1),
            ops: args.ops,
        };
        let rng = StdRng::seed_from_u64(seed.wrapping_add(worker as u64));
        workers.spawn(async move { workload.run(worker, &file, rng).await });
    }

    while let Some(joined) = workers.join_next().await {
        joined.context("worker task failed")??;
    }

    file.flush().await.context("flush failed")?;
    let elapsed = started.elapsed();
    let counters = file.counters();

    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        cache_bytes = cache.size_bytes(),
        hit_ratio = counters.read_hit_ratio(),
        "Workload verified"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&counters)?);
    } else {
        println!("{}", counters);
    }

    if args.prometheus {
        let exporter = CounterExporter::new()?;
        exporter.export(file.name(), &counters);
        print!("{}", exporter.encode()?);
    }

    file.close();
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

/// Open the lower file and zero-fill it to `size` bytes.
async fn open_lower_file(args: &Args, size: u64) -> anyhow::Result<Arc<dyn BlockFile>> {
    let lower: Arc<dyn BlockFile> = match &args.path {
        #[cfg(unix)]
        Some(path) => {
            let file = cached_block_file::adapters::FsBlockFile::open(path, true, 64)
                .with_context(|| format!("failed to open {}", path.display()))?;
            Arc::new(file)
        }
        #[cfg(not(unix))]
        Some(_) => bail!("filesystem backend is only available on unix"),
        None => Arc::new(MemoryBlockFile::new(MemoryBlockFileConfig {
            background_queue_length: args.background_queue_length,
            ..Default::default()
        })),
    };

    lower.set_file_size(0).await.context("failed to truncate")?;
    lower.set_file_size(size).await.context("failed to size")?;
    Ok(lower)
}

// =============================================================================
// Workload
// =============================================================================

struct Workload {
    base: u64,
    region_size: u64,
    max_io_size: u64,
    ops: usize,
}

impl Workload {
    async fn run(self, worker: usize, file: &CachedBlockFile, mut rng: StdRng) -> anyhow::Result<()> {
        let mut shadow = vec![0u8; self.region_size as usize];

        for op in 0..self.ops {
            let priority = if rng.gen_bool(0.5) {
                IoPriority::Foreground
            } else {
                IoPriority::Background
            };

            match rng.gen_range(0..10) {
                0..=3 => {
                    let (offset, length) = self.random_span(&mut rng);
                    let data = file
                        .read(priority, self.base + offset, length, None)?
                        .await
                        .with_context(|| format!("worker {} read failed", worker))?;
                    verify(worker, op, offset, &data.to_vec(), &shadow)?;
                }
                4 => {
                    let (offset, length) = self.random_span(&mut rng);
                    let data = file
                        .read_single(priority, self.base + offset, BytesMut::zeroed(length as usize), None)?
                        .await
                        .with_context(|| format!("worker {} read_single failed", worker))?;
                    verify(worker, op, offset, &data, &shadow)?;
                }
                5..=7 => {
                    let (offset, length) = self.random_span(&mut rng);
                    let mut bytes = vec![0u8; length as usize];
                    rng.fill(&mut bytes[..]);

                    // Split some writes across several elements
                    let split = rng.gen_range(0..=bytes.len());
                    let data: IoBuffer = [
                        Bytes::copy_from_slice(&bytes[..split]),
                        Bytes::copy_from_slice(&bytes[split..]),
                    ]
                    .into_iter()
                    .collect();

                    file.write_buffer(priority, self.base + offset, data, None)?
                        .await
                        .with_context(|| format!("worker {} write failed", worker))?;
                    let start = offset as usize;
                    shadow[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                _ => {
                    let half = self.region_size / 2;
                    let length = rng.gen_range(1..=self.max_io_size.min(half));
                    let low = rng.gen_range(0..=half - length);
                    let high = rng.gen_range(half..=self.region_size - length);
                    let (source, target) = if rng.gen_bool(0.5) {
                        (low, high)
                    } else {
                        (high, low)
                    };

                    file.copy(priority, self.base + source, self.base + target, length, None)?
                        .await
                        .with_context(|| format!("worker {} copy failed", worker))?;
                    let (source, target, length) = (source as usize, target as usize, length as usize);
                    shadow.copy_within(source..source + length, target);
                }
            }
        }

        let data = file
            .read(IoPriority::Background, self.base, self.region_size, None)?
            .await
            .with_context(|| format!("worker {} final read failed", worker))?;
        verify(worker, self.ops, 0, &data.to_vec(), &shadow)?;
        debug!(worker, "Worker finished");
        Ok(())
    }

    fn random_span(&self, rng: &mut StdRng) -> (u64, u64) {
        let length = rng.gen_range(1..=self.max_io_size);
        let offset = rng.gen_range(0..=self.region_size - length);
        (offset, length)
    }
}

fn verify(worker: usize, op: usize, offset: u64, data: &[u8], shadow: &[u8]) -> anyhow::Result<()> {
    let start = offset as usize;
    let expected = &shadow[start..start + data.len()];
    if data != expected {
        let at = data
            .iter()
            .zip(expected)
            .position(|(a, b)| a != b)
            .unwrap_or(0);
        bail!(
            "worker {} op {}: mismatch at region offset {}",
            worker,
            op,
            offset + at as u64
        );
    }
    Ok(())
}
