//! Benchmarks for `OrderedSet`'s bulk constructor (spec §4.1: `from_sorted`
//! must be at least 5x faster than inserting the same rows one by one).
//!
//! Run with: `cargo bench --bench ordered_set_bench`

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use zql_core::ordered_set::{Comparator, OrderedSet};

fn int_cmp() -> Comparator<i64> {
    Arc::new(|a: &i64, b: &i64| a.cmp(b))
}

fn sorted_run(n: usize) -> Vec<i64> {
    (0..n as i64).collect()
}

fn bench_bulk_vs_incremental(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordered_set_construction");

    for n in [100, 1_000, 10_000] {
        let items = sorted_run(n);

        group.bench_with_input(BenchmarkId::new("from_sorted", n), &items, |b, items| {
            b.iter(|| OrderedSet::from_sorted(int_cmp(), black_box(items.clone())).unwrap());
        });

        group.bench_with_input(BenchmarkId::new("one_by_one", n), &items, |b, items| {
            b.iter(|| {
                let mut set = OrderedSet::new(int_cmp());
                for v in items {
                    set.add(black_box(*v));
                }
                set
            });
        });
    }
    group.finish();
}

fn bench_bulk_construction_shuffled_source(c: &mut Criterion) {
    // The input to `from_sorted` must already be sorted; this benchmarks
    // the cost of producing that sorted run plus the bulk build, against
    // inserting the unsorted run one row at a time (the realistic
    // hydration path for a freshly connected Source index).
    let mut group = c.benchmark_group("ordered_set_hydration");

    for n in [100, 1_000, 10_000] {
        let mut shuffled = sorted_run(n);
        // Deterministic, non-identity permutation: reverse in blocks of 7.
        for chunk in shuffled.chunks_mut(7) {
            chunk.reverse();
        }

        group.bench_with_input(BenchmarkId::new("sort_then_bulk", n), &shuffled, |b, rows| {
            b.iter(|| {
                let mut sorted = rows.clone();
                sorted.sort_unstable();
                OrderedSet::from_sorted(int_cmp(), black_box(sorted)).unwrap()
            });
        });

        group.bench_with_input(BenchmarkId::new("one_by_one", n), &shuffled, |b, rows| {
            b.iter(|| {
                let mut set = OrderedSet::new(int_cmp());
                for v in rows {
                    set.add(black_box(*v));
                }
                set
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bulk_vs_incremental, bench_bulk_construction_shuffled_source);
criterion_main!(benches);
