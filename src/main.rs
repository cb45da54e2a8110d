//! srf: command line tool for sector-allocated region files.
//!
//! Inspects region files, reads and writes single records, and runs a
//! random workload through the region file pool to report cache behaviour.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rand::Rng;

use srf_metrics::IoMetrics;
use srf_store::{
    Allocation, ByteArrayArray, RegionConfig, RegionFileCache, RegionPos, SimpleRegionFile,
    index_to_local,
};

#[derive(Parser)]
#[command(name = "srf", about = "Inspect and exercise sector-allocated region files")]
pub struct Args {
    /// JSON file with region settings. Flags below override it.
    #[arg(long, env = "SRF_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// log2 of the sector size in bytes
    #[arg(long, env = "SRF_SECTOR_EXPONENT", global = true)]
    pub sector_exponent: Option<u8>,

    /// Number of record slots per file
    #[arg(long, env = "SRF_ENTRIES", global = true)]
    pub entries: Option<usize>,

    /// Idle time before a file may be closed, in milliseconds
    #[arg(long, env = "SRF_TIMEOUT_MS", global = true)]
    pub timeout_ms: Option<u64>,

    /// Page cache size per open file
    #[arg(long, env = "SRF_CACHE_PAGES", global = true)]
    pub cache_pages: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print header statistics for a region file
    Info {
        file: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
        /// Also list every allocated entry
        #[arg(short, long)]
        verbose: bool,
    },
    /// Dump one record to stdout
    Get {
        file: PathBuf,
        index: usize,
        /// Print as hex instead of raw bytes
        #[arg(long)]
        hex: bool,
    },
    /// Store one record, read from a file or "-" for stdin
    Put {
        file: PathBuf,
        index: usize,
        input: String,
    },
    /// Random write/read workload through the region file pool
    Bench {
        #[arg(long, default_value = "bench-world")]
        dir: PathBuf,
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Largest payload written, in bytes
        #[arg(long, default_value_t = 8192)]
        max_size: usize,
        /// Chunk coordinates are drawn from -radius..radius
        #[arg(long, default_value_t = 64)]
        radius: i32,
    },
    /// Open every region file in a directory and let idle reclamation run
    Maintain {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = load_config(&args)?;

    match args.command {
        Command::Info { file, json, verbose } => info(&file, &config, json, verbose),
        Command::Get { file, index, hex } => get(&file, &config, index, hex),
        Command::Put { file, index, input } => put(&file, &config, index, &input),
        Command::Bench { dir, ops, max_size, radius } => bench(&dir, config, ops, max_size, radius),
        Command::Maintain { dir, seconds } => {
            let rt = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
            rt.block_on(maintain(&dir, config, seconds))
        }
    }
}

fn load_config(args: &Args) -> Result<RegionConfig> {
    let mut config = match &args.config {
        Some(path) => RegionConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RegionConfig::default(),
    };
    if let Some(v) = args.sector_exponent {
        config.sector_exponent = v;
    }
    if let Some(v) = args.entries {
        config.entries = v;
    }
    if let Some(v) = args.timeout_ms {
        config.timeout_ms = v;
    }
    if let Some(v) = args.cache_pages {
        config.cache_pages = v;
    }
    config.validate().context("Invalid region configuration")?;
    Ok(config)
}

fn open_existing(file: &Path, config: &RegionConfig) -> Result<SimpleRegionFile> {
    if !file.is_file() {
        bail!("{} does not exist", file.display());
    }
    SimpleRegionFile::open(file, config).with_context(|| format!("Failed to open {}", file.display()))
}

fn info(file: &Path, config: &RegionConfig, json: bool, verbose: bool) -> Result<()> {
    let region = open_existing(file, config)?;
    let stats = region.stats()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("Region file: {}", file.display());
        if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
            if let Some(pos) = RegionPos::from_filename(name) {
                println!("Region: ({}, {})", pos.x, pos.z);
            }
        }
        println!("Entries: {} allocated / {} slots", stats.allocated_entries, stats.entries);
        if stats.damaged_entries > 0 {
            println!("Damaged entries: {}", stats.damaged_entries);
        }
        println!("Sector size: {} bytes", stats.sector_size);
        println!(
            "Sectors: {} total, {} header, {} used, {} free",
            stats.total_sectors, stats.header_sectors, stats.used_sectors, stats.free_sectors
        );
        println!("File size: {} bytes", stats.file_bytes);
    }

    if verbose && !json {
        for index in 0..region.capacity() {
            if let Allocation::Allocated { start, count } = region.allocation(index)? {
                let (local_x, local_z) = index_to_local(index);
                println!(
                    "  [{:>5}] local ({:>2}, {:>2})  sectors {}+{}",
                    index, local_x, local_z, start, count
                );
            }
        }
    }

    region.attempt_close()?;
    Ok(())
}

fn get(file: &Path, config: &RegionConfig, index: usize, as_hex: bool) -> Result<()> {
    let region = open_existing(file, config)?;
    let data = region
        .read_entry(index)
        .with_context(|| format!("Failed to read entry {} of {}", index, file.display()))?;

    if as_hex {
        println!("{}", hex::encode(&data));
    } else {
        std::io::stdout().write_all(&data)?;
    }
    region.attempt_close()?;
    Ok(())
}

fn put(file: &Path, config: &RegionConfig, index: usize, input: &str) -> Result<()> {
    let data = if input == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("Failed to read stdin")?;
        buf
    } else {
        std::fs::read(input).with_context(|| format!("Failed to read {}", input))?
    };

    let region = SimpleRegionFile::open(file, config)
        .with_context(|| format!("Failed to open {}", file.display()))?;
    region
        .write_entry(index, &data)
        .with_context(|| format!("Failed to write entry {} of {}", index, file.display()))?;
    if !region.attempt_close()? {
        bail!("{} still busy, not closed", file.display());
    }

    println!("Stored {} bytes in entry {} of {}", data.len(), index, file.display());
    Ok(())
}

fn bench(dir: &Path, config: RegionConfig, ops: usize, max_size: usize, radius: i32) -> Result<()> {
    if radius <= 0 {
        bail!("radius must be positive");
    }
    let metrics = Arc::new(IoMetrics::new());
    let cache = RegionFileCache::with_metrics(config.clone(), metrics.clone());
    let mut rng = rand::thread_rng();
    let mut expected: HashMap<(i32, i32), Vec<u8>> = HashMap::new();

    println!("Running {} operations in {}...", ops, dir.display());
    for op in 0..ops {
        let (x, z) = (rng.gen_range(-radius..radius), rng.gen_range(-radius..radius));
        let size = rng.gen_range(0..=max_size);
        let mut data = vec![0u8; size];
        rng.fill(&mut data[..]);

        let region = cache.region_file(dir, x, z)?;
        region.write_entry(RegionFileCache::chunk_index(x, z), &data)?;
        expected.insert((x, z), data);

        // Read back a random earlier chunk.
        let (cx, cz) = (rng.gen_range(-radius..radius), rng.gen_range(-radius..radius));
        if let Some(want) = expected.get(&(cx, cz)) {
            let region = cache.region_file(dir, cx, cz)?;
            let got = region.read_entry(RegionFileCache::chunk_index(cx, cz))?;
            if &got != want {
                bail!("Chunk ({}, {}) read back wrong after {} ops", cx, cz, op);
            }
        }
        if op % 1000 == 999 {
            log::info!("{} ops done, {} region files open", op + 1, cache.len());
        }
    }

    let closed = cache.clear();
    println!("Closed {} region files, verifying from disk...", closed);

    let verify = RegionFileCache::with_metrics(config, metrics.clone());
    for ((x, z), want) in &expected {
        let region = verify.region_file(dir, *x, *z)?;
        let got = region.read_entry(RegionFileCache::chunk_index(*x, *z))?;
        if &got != want {
            bail!("Chunk ({}, {}) differs after reopen", x, z);
        }
    }
    verify.clear();

    println!("Verified {} chunks", expected.len());
    println!("{}", metrics.generate_report());
    Ok(())
}

async fn maintain(dir: &Path, config: RegionConfig, seconds: u64) -> Result<()> {
    let metrics = Arc::new(IoMetrics::new());
    let timeout = config.timeout();
    let cache = Arc::new(RegionFileCache::with_metrics(config, metrics.clone()));

    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(pos) = name.to_str().and_then(RegionPos::from_filename) {
            let (chunk_x, chunk_z) = pos.local_to_world(0, 0);
            cache.region_file(dir, chunk_x, chunk_z)?;
        }
    }
    println!("Opened {} region files, idle timeout {:?}", cache.len(), timeout);

    let period = std::cmp::max(timeout / 2, Duration::from_millis(10));
    let handle = cache.spawn_maintenance(period);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {},
        _ = tokio::signal::ctrl_c() => println!("Interrupted"),
    }
    handle.abort();

    println!("{} region files still open", cache.len());
    let closed = cache.clear();
    log::info!("Closed {} remaining region files", closed);
    println!("{}", metrics.generate_report());
    Ok(())
}
