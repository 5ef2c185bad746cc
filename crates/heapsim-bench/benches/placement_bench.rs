//! Placement strategy benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use heapsim_core::{Heap, HeapConfig, Strategy};
use heapsim_harness::storm::{StormConfig, StormKind, run_storm};

fn quiet_heap(capacity: usize, strategy: Strategy) -> Heap {
    Heap::with_config(&HeapConfig {
        capacity,
        strategy,
        record_lifecycle: false,
    })
    .unwrap()
}

/// Striped heap: free 16-byte holes between allocated 8-byte chunks.
fn striped_heap(strategy: Strategy, stripes: usize) -> Heap {
    let mut heap = quiet_heap(stripes * 64 + 1024, strategy);
    for _ in 0..stripes {
        heap.allocate(16).unwrap();
        heap.allocate(8).unwrap();
    }
    for _ in 0..stripes {
        heap.release(16).unwrap();
    }
    heap
}

fn bench_bump_cycle(c: &mut Criterion) {
    let sizes: &[i64] = &[8, 64, 256, 1024];
    let mut group = c.benchmark_group("bump_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("first_fit", size), &size, |b, &sz| {
            let mut heap = quiet_heap(8192, Strategy::FirstFit);
            b.iter(|| {
                let ok = heap.allocate(sz).unwrap() && heap.release(sz).unwrap();
                criterion::black_box(ok);
            });
        });
    }
    group.finish();
}

fn bench_bin_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("bin_reuse");

    for strategy in Strategy::ALL {
        group.bench_function(BenchmarkId::new(strategy.protocol_name(), 256), |b| {
            let mut heap = striped_heap(strategy, 256);
            b.iter(|| {
                heap.allocate(16).unwrap();
                heap.release(16).unwrap();
                criterion::black_box(heap.top_index());
            });
        });
    }
    group.finish();
}

fn bench_storms(c: &mut Criterion) {
    let mut group = c.benchmark_group("storm");
    group.sample_size(10);
    let config = StormConfig {
        seed: 0x5EED,
        steps: 500,
        capacity: 4096,
    };

    for kind in [StormKind::RandomChurn, StormKind::SizeClassThrash] {
        for strategy in Strategy::ALL {
            let id = BenchmarkId::new(kind.as_str(), strategy.protocol_name());
            group.bench_function(id, |b| {
                b.iter(|| criterion::black_box(run_storm(kind, strategy, &config).unwrap()));
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_bump_cycle, bench_bin_reuse, bench_storms);
criterion_main!(benches);
