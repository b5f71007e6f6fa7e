//! Store hot paths: point reads, upserts, seeks and snapshot commits.
//!
//! Usage: cargo bench --bench store_bench

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tempfile::TempDir;

use hybridlog_core::{CheckpointKind, Config, SeekDirection, Store};

const PRELOAD: u64 = 10_000;

fn key(i: u64) -> [u8; 8] {
    i.to_be_bytes()
}

fn preloaded(config: Config) -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(dir.path(), config).unwrap();
    for i in 0..PRELOAD {
        store.put(&key(i), &[0x42; 64]).unwrap();
    }
    (store, dir)
}

fn bench_point_ops(c: &mut Criterion) {
    let (store, _dir) = preloaded(Config::workstation().with_checkpoint_interval(None));
    let mut group = c.benchmark_group("point");
    group.throughput(Throughput::Elements(1));

    let mut i = 0u64;
    group.bench_function("get_hit", |b| {
        b.iter(|| {
            i = (i + 7919) % PRELOAD;
            black_box(store.get(&key(i)).unwrap());
        })
    });
    group.bench_function("get_miss", |b| b.iter(|| black_box(store.get(b"absent").unwrap())));

    let mut n = PRELOAD;
    group.bench_function("put_64b", |b| {
        b.iter(|| {
            n += 1;
            store.put(&key(n), &[0x17; 64]).unwrap();
        })
    });
    group.bench_function("put_object_128k", |b| {
        let value = vec![0x5A; 128 * 1024];
        b.iter(|| store.put(b"object", &value).unwrap())
    });
    group.finish();
}

fn bench_seek(c: &mut Criterion) {
    let (store, _dir) = preloaded(Config::workstation().with_checkpoint_interval(None));
    let mut group = c.benchmark_group("seek");
    group.throughput(Throughput::Elements(100));

    group.bench_function("forward_take_100", |b| {
        b.iter(|| black_box(store.seek(&key(PRELOAD / 2), SeekDirection::Forward).unwrap().take(100).count()))
    });
    group.bench_function("backward_take_100", |b| {
        b.iter(|| black_box(store.seek(&key(PRELOAD / 2), SeekDirection::Backward).unwrap().take(100).count()))
    });
    group.finish();
}

fn bench_checkpoints(c: &mut Criterion) {
    let (store, _dir) = preloaded(Config::workstation().with_checkpoint_interval(None).with_remove_outdated(true));
    let mut group = c.benchmark_group("checkpoint");
    group.sample_size(20);

    group.bench_function("fold_over", |b| {
        b.iter(|| {
            store.put(b"dirty", b"1").unwrap();
            store.checkpoint(CheckpointKind::FoldOver).unwrap()
        })
    });
    group.bench_function("standalone_10k", |b| b.iter(|| store.checkpoint(CheckpointKind::Standalone).unwrap()));
    group.bench_function("snapshot_commit_100", |b| {
        b.iter_batched(
            || store.get_snapshot().unwrap(),
            |snapshot| {
                for i in 0..100u64 {
                    snapshot.put(&key(i), b"updated").unwrap();
                }
                snapshot.commit().unwrap()
            },
            BatchSize::PerIteration,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_point_ops, bench_seek, bench_checkpoints);
criterion_main!(benches);
