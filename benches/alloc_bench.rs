//! Allocator benchmarks: the alloc/free fast paths per size class, and the
//! `epoch_close` sweep cost at varying live-slab counts.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use epochslab::{Allocator, Config};

fn bench_alloc_free_roundtrip(c: &mut Criterion) {
    let sizes: &[usize] = &[64, 128, 256, 512, 768];
    let mut group = c.benchmark_group("alloc_free_roundtrip");

    for &size in sizes {
        let alloc = Allocator::create(Config::default()).unwrap();
        let epoch = alloc.epoch_current();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::new("size", size), &size, |b, &size| {
            b.iter(|| {
                let (ptr, handle) = alloc.alloc_obj(black_box(size), epoch).unwrap();
                black_box(ptr);
                alloc.free_obj(handle).unwrap();
            })
        });
    }
    group.finish();
}

fn bench_batch_alloc_then_free(c: &mut Criterion) {
    let n = 1000usize;
    let mut group = c.benchmark_group("batch_1000_alloc_then_free");
    group.throughput(Throughput::Elements(n as u64));

    for &size in &[64usize, 256, 768] {
        group.bench_with_input(BenchmarkId::new("size", size), &size, |b, &size| {
            let alloc = Allocator::create(Config::default()).unwrap();
            let epoch = alloc.epoch_current();
            b.iter(|| {
                let handles: Vec<_> = (0..n).map(|_| alloc.alloc_obj(size, epoch).unwrap().1).collect();
                for h in handles {
                    alloc.free_obj(h).unwrap();
                }
            })
        });
    }
    group.finish();
}

/// `epoch_close` sweep cost as a function of how many live (not yet freed)
/// slabs the epoch is carrying, all pre-freed before the timed close.
fn bench_epoch_close_sweep(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch_close_sweep");
    let slots_per_slab_estimate = 32usize;

    for &slab_count in &[1usize, 8, 32, 128] {
        group.throughput(Throughput::Elements(slab_count as u64));
        group.bench_with_input(
            BenchmarkId::new("live_slabs", slab_count),
            &slab_count,
            |b, &slab_count| {
                b.iter_batched(
                    || {
                        let alloc = Allocator::create(Config::default()).unwrap();
                        let epoch = alloc.epoch_current();
                        let handles: Vec<_> = (0..(slab_count * slots_per_slab_estimate))
                            .map(|_| alloc.alloc_obj(128, epoch).unwrap().1)
                            .collect();
                        for h in handles {
                            alloc.free_obj(h).unwrap();
                        }
                        (alloc, epoch)
                    },
                    |(alloc, epoch)| {
                        black_box(alloc.epoch_close(epoch));
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );
    }
    group.finish();
}

fn bench_multithreaded_alloc_free(c: &mut Criterion) {
    use std::sync::Arc;

    let mut group = c.benchmark_group("multithreaded_4_threads");
    let ops_per_thread = 5000usize;
    let nthreads = 4;
    group.throughput(Throughput::Elements((ops_per_thread * nthreads) as u64));

    group.bench_function("class_64", |b| {
        b.iter_batched(
            || Arc::new(Allocator::create(Config::default()).unwrap()),
            |alloc| {
                let epoch = alloc.epoch_current();
                let handles: Vec<_> = (0..nthreads)
                    .map(|_| {
                        let alloc = Arc::clone(&alloc);
                        std::thread::spawn(move || {
                            let mut live: Vec<_> = Vec::with_capacity(100);
                            for _ in 0..ops_per_thread {
                                live.push(alloc.alloc_obj(64, epoch).unwrap().1);
                                if live.len() > 50 {
                                    for _ in 0..25 {
                                        alloc.free_obj(live.pop().unwrap()).unwrap();
                                    }
                                }
                            }
                            for h in live {
                                alloc.free_obj(h).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            },
            criterion::BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_roundtrip,
    bench_batch_alloc_then_free,
    bench_epoch_close_sweep,
    bench_multithreaded_alloc_free,
);
criterion_main!(benches);
