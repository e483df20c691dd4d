//! Inspection tool for a tvbuf persistent heap.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`TVBUF_*`), and CLI flags. Opens the heap, recovers every series that owns regions, and prints
//! one line per series.
//!
//! Opening the heap starts a new epoch and rewrites `REGISTRY.bin`. Region contents and bindings
//! are not changed: recovered lists are dropped without release, so every series stays
//! recoverable.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tvbuf::config::load_pool_config;
use tvbuf::{
    ArrayPool, BufferError, DataType, Element, Persistent, PoolConfig, SeriesKey, TvList,
};

// ---------- CLI ----------

/// Inspect the series buffered in a tvbuf persistent heap.
#[derive(Parser, Debug)]
#[command(name = "tvbuf-inspect", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, `tvbuf.toml` is loaded when it exists.
    #[arg(long, env = "TVBUF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Override the persistent heap directory.
    #[arg(long, env = "TVBUF_PMEM_DIR")]
    pub pmem_dir: Option<PathBuf>,

    /// Override the chunk capacity; must match the heap's.
    #[arg(long)]
    pub array_size: Option<usize>,

    /// Override the persistent text slot width; must match the heap's.
    #[arg(long)]
    pub text_slot_bytes: Option<usize>,

    /// Load and validate config (file + env + CLI), print it, then exit. Does not open the heap.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,
}

fn load_config(cli: &Cli) -> Result<PoolConfig, BufferError> {
    let path = if cli.no_config {
        None
    } else {
        match &cli.config {
            Some(path) => Some(path.clone()),
            None => Some(PathBuf::from("tvbuf.toml")).filter(|p| p.exists()),
        }
    };
    let mut config = load_pool_config(path.as_deref())?;

    if let Some(dir) = &cli.pmem_dir {
        config.pmem_dir = Some(dir.clone());
    }
    if let Some(n) = cli.array_size {
        config.array_size = n;
    }
    if let Some(n) = cli.text_slot_bytes {
        config.text_slot_bytes = n;
    }
    config.validate()?;
    Ok(config)
}

/// Recovers one series as `T` and prints its summary line.
fn report<T: Element>(pool: &Arc<ArrayPool>, series: SeriesKey) -> Result<(), BufferError> {
    let list = TvList::<T, Persistent>::recover(Arc::clone(pool), series)?;
    let min_time = if list.is_empty() {
        "-".to_string()
    } else {
        list.min_time().to_string()
    };
    let max_time = list
        .max_time()?
        .map_or_else(|| "-".to_string(), |t| t.to_string());
    println!(
        "{}\t{}\tpoints={}\tchunks={}\tmin_time={}\tmax_time={}\tsorted={}",
        list.series(),
        list.data_type(),
        list.len(),
        list.chunk_count(),
        min_time,
        max_time,
        list.is_sorted()
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let config = load_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        match &config.pmem_dir {
            Some(dir) => println!("pmem_dir={}", dir.display()),
            None => println!("pmem_dir="),
        }
        println!("array_size={}", config.array_size);
        println!("text_slot_bytes={}", config.text_slot_bytes);
        println!("max_plain_chunks={:?}", config.max_plain_chunks);
        println!("max_persistent_chunks={:?}", config.max_persistent_chunks);
        return Ok(());
    }

    if config.pmem_dir.is_none() {
        eprintln!("config error: no pmem_dir configured");
        return Err(BufferError::ConfigError("no pmem_dir configured".to_string()).into());
    }

    let pool = ArrayPool::new(config).map_err(|e| {
        eprintln!("failed to open persistent heap: {}", e);
        e
    })?;
    let series = pool.recovered_series()?;
    let stats = pool.stats()?;
    println!(
        "series={}\tfree_regions={}",
        series.len(),
        stats.persistent_free
    );

    let mut failures = 0usize;
    for (key, data_type) in series {
        let shown = key.to_string();
        let result = match data_type {
            DataType::Boolean => report::<bool>(&pool, key),
            DataType::Int32 => report::<i32>(&pool, key),
            DataType::Int64 => report::<i64>(&pool, key),
            DataType::Float => report::<f32>(&pool, key),
            DataType::Double => report::<f64>(&pool, key),
            DataType::Text => report::<String>(&pool, key),
        };
        if let Err(e) = result {
            eprintln!("{}: {}", shown, e);
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(BufferError::Corruption {
            details: format!("{} series could not be recovered", failures),
            region: None,
        }
        .into());
    }
    Ok(())
}
