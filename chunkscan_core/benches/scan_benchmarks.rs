use std::{hint::black_box, sync::Arc};

use criterion::{Criterion, criterion_group, criterion_main};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::runtime::Runtime;

use chunkscan_core::{
    accelerator::emulator::HostAccelerator,
    cache::column_cache::MemoryColumnCache,
    configuration::Configuration,
    core::{
        db_type::DbType,
        expression::{ComparerOperation, Expr},
        processor::{parallel::ParallelScan, scan::ScanBuilder},
        program::ScanProgram,
        schema::{AttrSet, Attribute, TupleDesc},
        storage_providers::{memory::MemoryStorageProvider, traits::BlockStorage},
        tuple::Datum,
    },
};

const BLOCKS: usize = 128;
const TUPLES_PER_BLOCK: usize = 100;

fn relation() -> Arc<MemoryStorageProvider> {
    let desc = Arc::new(TupleDesc::new(vec![
        Attribute::new("id", DbType::I64),
        Attribute::new("score", DbType::F64),
    ]));
    let mut rng = StdRng::seed_from_u64(7);
    let rows = (0..BLOCKS * TUPLES_PER_BLOCK)
        .map(|i| vec![Datum::I64(i as i64), Datum::F64(rng.random_range(0.0..1.0))])
        .collect();
    Arc::new(MemoryStorageProvider::from_rows(1, desc, TUPLES_PER_BLOCK, rows).unwrap())
}

fn builder(storage: Arc<MemoryStorageProvider>, config: Configuration) -> ScanBuilder {
    let quals = Expr::compare(ComparerOperation::Less, Expr::col(1), Expr::constant(Datum::F64(0.5)));
    let program = Arc::new(ScanProgram::new(storage.tuple_desc(), Some(quals), None, &[]).unwrap());
    ScanBuilder::new(storage, Arc::new(HostAccelerator::default()), program).configuration(config)
}

fn drain(builder: &ScanBuilder) -> usize {
    let mut scan = builder.build().unwrap();
    let mut n = 0;
    while let Some(tuple) = scan.next_tuple().unwrap() {
        black_box(tuple);
        n += 1;
    }
    n
}

fn criterion_benchmark_scan(c: &mut Criterion) {
    let storage = relation();

    let row = builder(storage.clone(), Configuration::default());
    c.bench_function("scan_row_chunks", |b| b.iter(|| drain(black_box(&row))));

    let direct = builder(
        storage.clone(),
        Configuration {
            direct_transfer: Some(true),
            chunk_size: Some(32 * chunkscan_core::BLCKSZ),
            ..Default::default()
        },
    );
    c.bench_function("scan_block_chunks_direct", |b| b.iter(|| drain(black_box(&direct))));

    let cache = Arc::new(MemoryColumnCache::new(16));
    cache.build_all(storage.as_ref(), &AttrSet::all(2)).unwrap();
    let cached = builder(
        storage.clone(),
        Configuration {
            cache_granule_blocks: Some(16),
            ..Default::default()
        },
    )
    .cache(cache);
    c.bench_function("scan_column_cache", |b| b.iter(|| drain(black_box(&cached))));

    let rt = Runtime::new().unwrap();
    let parallel = builder(storage, Configuration::default());
    c.bench_function("scan_parallel_4_workers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut scan = ParallelScan::new(parallel.clone(), 4);
                black_box(scan.run().await.unwrap().tuples.len())
            })
        })
    });
}

criterion_group!(benches, criterion_benchmark_scan);
criterion_main!(benches);
