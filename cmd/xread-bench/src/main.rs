//! xread load generator
//!
//! Opens `--connections` clients, each on its own thread, and keeps
//! submitting batches of block-aligned random reads against one object
//! until `--duration` elapses.
//!
//! Usage:
//!     ./target/release/xread-bench --file volume-0 --file-size 1073741824 \
//!         --connections 16 --batch 32 --block-size 4096 --duration 10

use xread_client::{Client, ClientConfig, ReadOp};

use clap::Parser;
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::process::ExitCode;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone)]
#[command(name = "xread-bench")]
#[command(about = "Batched random-read load generator for xread")]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:21321")]
    addr: String,

    /// Object name to read
    #[arg(short, long)]
    file: String,

    /// Readable size of the object in bytes
    #[arg(long)]
    file_size: u64,

    /// Bytes per read
    #[arg(short, long, default_value_t = 4096)]
    block_size: u64,

    /// Concurrent connections
    #[arg(short, long, default_value_t = 4)]
    connections: usize,

    /// Reads per batch
    #[arg(long, default_value_t = 16)]
    batch: usize,

    /// Run time in seconds
    #[arg(short, long, default_value_t = 10)]
    duration: u64,
}

#[derive(Default)]
struct Totals {
    reads: u64,
    failed: u64,
    bytes: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_thread_names(true)
        .init();

    let args = Args::parse();
    if args.block_size == 0 || args.file_size < args.block_size || args.batch == 0 {
        eprintln!("xread-bench: need block_size > 0, batch > 0 and file_size >= block_size");
        return ExitCode::FAILURE;
    }

    let deadline = Instant::now() + Duration::from_secs(args.duration);
    let started = Instant::now();
    let mut workers = Vec::with_capacity(args.connections);
    for id in 0..args.connections {
        let args = args.clone();
        let spawned = thread::Builder::new()
            .name(format!("bench-{}", id))
            .spawn(move || run_connection(id, &args, deadline));
        match spawned {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                eprintln!("xread-bench: failed to spawn worker: {}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    let mut total = Totals::default();
    let mut failed_workers = 0;
    for handle in workers {
        match handle.join() {
            Ok(Some(t)) => {
                total.reads += t.reads;
                total.failed += t.failed;
                total.bytes += t.bytes;
            }
            _ => failed_workers += 1,
        }
    }

    let secs = started.elapsed().as_secs_f64();
    println!(
        "connections={} reads={} failed={} reads_per_sec={:.0} mib_per_sec={:.1}",
        args.connections,
        total.reads,
        total.failed,
        total.reads as f64 / secs,
        total.bytes as f64 / secs / (1024.0 * 1024.0)
    );
    if failed_workers > 0 {
        eprintln!("xread-bench: {} connection(s) failed", failed_workers);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run_connection(id: usize, args: &Args, deadline: Instant) -> Option<Totals> {
    let client = match Client::connect(args.addr.as_str(), ClientConfig::default()) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("bench-{}: connect failed: {}", id, e);
            return None;
        }
    };

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(42 + id as u64);
    let blocks = args.file_size / args.block_size;
    let mut totals = Totals::default();

    while Instant::now() < deadline {
        let ops = (0..args.batch)
            .map(|_| {
                let block = rng.random_range(0..blocks);
                ReadOp::new(args.file.as_str(), block * args.block_size, args.block_size)
            })
            .collect();
        let handles = match client.submit_batch(ops) {
            Ok(handles) => handles,
            Err(e) => {
                eprintln!("bench-{}: submit failed: {}", id, e);
                break;
            }
        };
        // Per-read outcomes are collected below.
        let _ = client.wait_batch(&handles, None);
        for handle in handles {
            match client.result(&handle) {
                Ok(c) if c.is_ok() => totals.bytes += c.retval as u64,
                _ => totals.failed += 1,
            }
            totals.reads += 1;
            let _ = client.reclaim(handle);
        }
    }

    println!("bench-{}: {}", id, client.stats_string());
    Some(totals)
}
