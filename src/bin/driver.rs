//! Workload driver for the dual-tree engine.
//!
//! Reads a key file (one decimal key per line, or packed little-endian u32
//! keys with `--binary`), loads a percentage of it into a disk-backed dual
//! tree, runs a batch of seeded point queries over the loaded prefix, then
//! inserts the remainder and prints the statistics line.

use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use nearsort_btree::{DualTree, EngineConfig, EngineError, Result};

#[derive(Parser)]
#[command(name = "driver", about = "Load a key file into the dual tree and query it")]
struct Args {
    /// Key file to load
    input_file: PathBuf,

    /// Configuration file (KEY = VALUE)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Seed for the query workload
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Percentage of the input loaded before the query phase
    #[arg(long = "perc_load", default_value_t = 100)]
    perc_load: u8,

    /// Point queries to run between the two load phases
    #[arg(long = "num_queries", default_value_t = 0)]
    num_queries: usize,

    /// Input is packed little-endian u32 keys instead of decimal lines
    #[arg(long)]
    binary: bool,
}

fn read_keys(path: &PathBuf, binary: bool) -> Result<Vec<u64>> {
    if binary {
        let bytes = std::fs::read(path)?;
        return Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as u64)
            .collect());
    }
    let text = std::fs::read_to_string(path)?;
    let mut keys = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let key = line.parse().map_err(|_| {
            EngineError::invalid_argument(format!("bad key {line:?} at line {}", idx + 1))
        })?;
        keys.push(key);
    }
    Ok(keys)
}

fn run(args: &Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let keys = read_keys(&args.input_file, args.binary)?;
    info!(keys = keys.len(), "input read");

    let sorted_path = args.input_file.with_extension("sorted.pages");
    let outlier_path = args.input_file.with_extension("outlier.pages");
    let dual = DualTree::open(&sorted_path, &outlier_path, &config)?;

    let load_count = keys.len() * args.perc_load as usize / 100;
    for &key in &keys[..load_count] {
        dual.insert(key, key)?;
    }
    info!(loaded = load_count, "load phase complete");

    if args.num_queries > 0 && load_count > 0 {
        let mut rng = StdRng::seed_from_u64(args.seed);
        let mut hits = 0usize;
        for _ in 0..args.num_queries {
            let key = keys[rng.gen_range(0..load_count)];
            if dual.contains(key)? {
                hits += 1;
            }
        }
        info!(queries = args.num_queries, hits, "query phase complete");
    }

    for &key in &keys[load_count..] {
        dual.insert(key, key)?;
    }
    dual.flush()?;

    println!("{}", dual.stats());
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{err}");
            exit(-1);
        }
    };
    if args.perc_load > 100 {
        eprintln!("--perc_load must be at most 100");
        exit(-1);
    }

    if let Err(err) = run(&args) {
        eprintln!("ERROR: {err}");
        exit(1);
    }
}
