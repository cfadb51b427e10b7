use std::{io, sync::Arc, time::Instant};

use clap::Parser;
use log::{LevelFilter, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::runtime::Builder;

use chunkscan_core::{
    accelerator::emulator::HostAccelerator,
    cache::{column_cache::MemoryColumnCache, scan_sync::MemoryScanSync},
    configuration::Configuration,
    core::{
        db_type::DbType,
        expression::{ComparerOperation, Expr, MathOperation},
        processor::{parallel::ParallelScan, scan::ScanBuilder},
        program::ScanProgram,
        schema::{Attribute, TupleDesc},
        storage_providers::{memory::MemoryStorageProvider, traits::BlockStorage},
        tuple::Datum,
    },
};

#[derive(Parser, Debug)]
#[command(name = "chunkscan_core", version, about = "Accelerated scan over a synthetic relation")]
struct Args {
    /// Number of blocks in the generated relation (default: 256)
    #[arg(long, value_name = "N", default_value_t = 256)]
    blocks: u32,

    /// Tuples stored in each block (default: 64)
    #[arg(long = "tuples-per-block", alias = "tuples_per_block", value_name = "N", default_value_t = 64)]
    tuples_per_block: usize,

    /// Percentage of tuples the filter keeps (default: 50)
    #[arg(long, value_name = "PERCENT", default_value_t = 50)]
    selectivity: i64,

    /// Number of concurrent scan workers (default: 4)
    #[arg(long = "concurrent-workers", alias = "concurrent_workers", value_name = "N")]
    concurrent_workers: Option<usize>,

    /// Chunk size in bytes (default: 1 MiB)
    #[arg(long = "chunk-size", alias = "chunk_size", value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Blocks requested from the range allocator at once (default: 8)
    #[arg(long = "blocks-per-request", alias = "blocks_per_request", value_name = "N")]
    blocks_per_request: Option<u32>,

    /// Transfer blocks straight from storage to the device (default: false)
    #[arg(long = "direct-transfer", alias = "direct_transfer", value_name = "BOOL")]
    direct_transfer: Option<bool>,

    /// Share of blocks left out of the host buffer cache, in percent (default: 50)
    #[arg(long = "uncached-percent", value_name = "PERCENT", default_value_t = 50)]
    uncached_percent: u32,

    /// Enable or disable the columnar cache (default: true)
    #[arg(long = "enable-cache", alias = "enable_cache", value_name = "BOOL")]
    enable_cache: Option<bool>,

    /// Blocks per columnar cache granule, a power of two (default: 16384)
    #[arg(long = "cache-granule", value_name = "N")]
    cache_granule: Option<u32>,

    /// Enable or disable CPU fallback (default: true)
    #[arg(long = "cpu-fallback", alias = "cpu_fallback", value_name = "BOOL")]
    cpu_fallback: Option<bool>,

    /// Start at the position reported by earlier scans (default: false)
    #[arg(long, value_name = "BOOL")]
    syncscan: Option<bool>,

    /// Device memory in MiB (default: 256)
    #[arg(long = "device-memory", value_name = "MIB", default_value_t = 256)]
    device_memory: usize,

    /// Seed for the generated data
    #[arg(long, value_name = "N", default_value_t = 42)]
    seed: u64,

    /// Logging level off, error, warn, info, debug, trace (default: info)
    #[arg(long = "log-level", alias = "log_level", value_name = "LEVEL")]
    log_level: Option<LevelFilter>,
}

fn generate(args: &Args, desc: Arc<TupleDesc>) -> io::Result<MemoryStorageProvider> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let categories = ["alpha", "beta", "gamma", "delta"];
    let nrows = args.blocks as usize * args.tuples_per_block;

    let rows = (0..nrows)
        .map(|i| {
            vec![
                Datum::I64(i as i64),
                Datum::I64(rng.random_range(0..100)),
                Datum::F64(rng.random_range(0.0..1000.0)),
                Datum::Text(categories[rng.random_range(0..categories.len())].to_string()),
            ]
        })
        .collect();

    let storage = MemoryStorageProvider::from_rows(1, desc, args.tuples_per_block, rows)?;
    for block in 0..storage.nblocks() {
        storage.set_buffered(block, rng.random_range(0..100) >= args.uncached_percent);
    }
    Ok(storage)
}

fn main() -> io::Result<()> {
    let args = Args::parse();

    let config = Configuration {
        chunk_size: args.chunk_size,
        blocks_per_request: args.blocks_per_request,
        cpu_fallback: args.cpu_fallback,
        direct_transfer: args.direct_transfer,
        enable_cache: args.enable_cache,
        cache_granule_blocks: args.cache_granule,
        syncscan: args.syncscan,
        concurrent_workers: args.concurrent_workers,
        ..Default::default()
    };
    config.validate().map_err(io::Error::other)?;

    let level = args.log_level.unwrap_or(LevelFilter::Info);
    env_logger::Builder::new().filter_level(level).init();

    let rt = Builder::new_multi_thread()
        .worker_threads(config.concurrent_workers())
        .enable_all()
        .build()?;

    rt.block_on(async {
        let desc = Arc::new(TupleDesc::new(vec![
            Attribute::new("id", DbType::I64),
            Attribute::new("bucket", DbType::I64),
            Attribute::new("amount", DbType::F64),
            Attribute::new("category", DbType::STRING).with_width(6),
        ]));
        let storage = Arc::new(generate(&args, desc.clone())?);

        // bucket < $1
        let quals = Expr::compare(ComparerOperation::Less, Expr::col(1), Expr::param(0));
        let projection = vec![
            ("id".to_string(), Expr::col(0)),
            (
                "amount_with_tax".to_string(),
                Expr::math(MathOperation::Multiply, Expr::col(2), Expr::constant(Datum::F64(1.2))),
            ),
            ("category".to_string(), Expr::col(3)),
        ];
        let params = vec![Datum::I64(args.selectivity)];
        let program = ScanProgram::new(desc, Some(quals), Some(projection), &params).map_err(io::Error::other)?;
        let program = Arc::new(program);

        let accelerator = Arc::new(HostAccelerator::new(
            args.device_memory * 1024 * 1024,
            chunkscan_core::accelerator::emulator::DEFAULT_IO_MAP_MEMORY,
        ));

        let mut builder = ScanBuilder::new(storage.clone(), accelerator, program.clone())
            .params(params)
            .configuration(config.clone())
            .scan_sync(Arc::new(MemoryScanSync::new()));

        if config.enable_cache() {
            let cache = Arc::new(MemoryColumnCache::new(config.cache_granule_blocks()));
            let granules = cache
                .build_all(storage.as_ref(), program.referenced_attrs())
                .map_err(io::Error::other)?;
            info!("columnar cache holds {} granules", granules);
            builder = builder.cache(cache);
        }

        let mut scan = ParallelScan::new(builder, config.concurrent_workers());
        let started = Instant::now();
        let output = scan.run().await.map_err(io::Error::other)?;

        info!(
            "{} of {} tuples returned in {:?}",
            output.tuples.len(),
            args.blocks as usize * args.tuples_per_block,
            started.elapsed()
        );
        for worker in &output.per_worker {
            info!(
                "worker {}: {} tasks ({} on CPU), {} tuples read",
                worker.worker, worker.counters.tasks, worker.counters.fallback_tasks, worker.counters.tuples_read
            );
        }

        print!("{}", scan.explain());
        Ok::<(), io::Error>(())
    })
}
