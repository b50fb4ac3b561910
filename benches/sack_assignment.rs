//! Sack Assignment Benchmarks
//!
//! Cost of mapping metrics to sacks, deriving lock names, and a full
//! expunge pass over the in-memory collaborators.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kuba_chef::coordination::MemoryLockProvider;
use kuba_chef::engine::stubs::{InMemoryIngestor, InMemoryMetricIndex, InMemorySeriesStore};
use kuba_chef::sack::{lock_name, SackAssigner, DEFAULT_LOCK_PREFIX};
use kuba_chef::{Chef, Measure, Metric, MetricId, MetricStatus, SackId};
use std::hint::black_box;
use std::sync::Arc;

// =============================================================================
// Test Data Generators
// =============================================================================

fn create_metric_ids(count: usize) -> Vec<MetricId> {
    (0..count).map(|_| MetricId::new()).collect()
}

// =============================================================================
// Sack Assignment Benchmarks
// =============================================================================

fn bench_sack_for(c: &mut Criterion) {
    let ids = create_metric_ids(10_000);
    let mut group = c.benchmark_group("sack_for");
    group.throughput(Throughput::Elements(ids.len() as u64));

    for num_sacks in [8u32, 128, 2048] {
        let assigner = SackAssigner::new(num_sacks);
        group.bench_with_input(BenchmarkId::from_parameter(num_sacks), &ids, |b, ids| {
            b.iter(|| {
                for id in ids {
                    black_box(assigner.sack_for(id));
                }
            });
        });
    }

    group.finish();
}

fn bench_lock_name(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_name");

    for prefix in [DEFAULT_LOCK_PREFIX, "tenant-with-a-much-longer-deployment-prefix"] {
        group.bench_with_input(BenchmarkId::from_parameter(prefix.len()), &prefix, |b, prefix| {
            let mut sack = 0u32;
            b.iter(|| {
                sack = sack.wrapping_add(1);
                black_box(lock_name(prefix, SackId(sack)))
            });
        });
    }

    group.finish();
}

// =============================================================================
// Expunge Pass Benchmarks
// =============================================================================

fn bench_expunge_pass(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("expunge_pass");

    for doomed in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(doomed as u64));
        group.bench_with_input(BenchmarkId::from_parameter(doomed), &doomed, |b, &doomed| {
            b.iter_batched(
                || {
                    let index = Arc::new(InMemoryMetricIndex::new());
                    let ingestor = Arc::new(InMemoryIngestor::new(64));
                    for _ in 0..doomed {
                        let metric = Metric::active_new().with_status(MetricStatus::PendingDelete);
                        ingestor.add_measures(metric.id, [Measure::new(0, 1.0)]);
                        index.insert(metric);
                    }
                    Chef::new(
                        index,
                        ingestor,
                        Arc::new(InMemorySeriesStore::new()),
                        Arc::new(MemoryLockProvider::new()),
                    )
                },
                |chef| rt.block_on(async { black_box(chef.expunge_metrics(false).await) }),
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_sack_for, bench_lock_name, bench_expunge_pass);
criterion_main!(benches);
