//! Criterion benchmarks for the core store/fetch/transaction paths,
//! run against an in-memory database so file-system noise stays out of
//! the numbers.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tdb::{Flags, OpenFlags, StoreMode, Tdb};

fn internal_db() -> Tdb {
    Tdb::open(
        "bench.tdb",
        Flags::INTERNAL,
        OpenFlags::RDWR,
        0o600,
        vec![],
    )
    .expect("internal open")
}

fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("store");
    for &value_len in &[32usize, 256, 4096] {
        group.throughput(Throughput::Bytes(value_len as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(value_len),
            &value_len,
            |b, &value_len| {
                let mut db = internal_db();
                let value = vec![0xa5u8; value_len];
                let mut i = 0u64;
                b.iter(|| {
                    i += 1;
                    let key = (i % 10_000).to_le_bytes();
                    db.store(black_box(&key), black_box(&value), StoreMode::Replace)
                        .unwrap();
                });
            },
        );
    }
    group.finish();
}

fn bench_fetch(c: &mut Criterion) {
    let mut db = internal_db();
    for i in 0..10_000u64 {
        db.store(&i.to_le_bytes(), &[7u8; 256], StoreMode::Insert)
            .unwrap();
    }
    let mut i = 0u64;
    c.bench_function("fetch_hot", |b| {
        b.iter(|| {
            i += 1;
            let key = (i % 10_000).to_le_bytes();
            black_box(db.fetch(black_box(&key)).unwrap());
        })
    });
}

fn bench_transaction(c: &mut Criterion) {
    c.bench_function("transaction_100_stores", |b| {
        let mut db = internal_db();
        let mut round = 0u64;
        b.iter(|| {
            round += 1;
            db.transaction_start().unwrap();
            for i in 0..100u64 {
                let key = (round * 100 + i % 1000).to_le_bytes();
                db.store(&key, &[1u8; 128], StoreMode::Replace).unwrap();
            }
            db.transaction_commit().unwrap();
        })
    });
}

criterion_group!(benches, bench_store, bench_fetch, bench_transaction);
criterion_main!(benches);
