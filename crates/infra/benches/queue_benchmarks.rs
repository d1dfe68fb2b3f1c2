use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration as ChronoDuration, Utc};
use hireloop_core::{CandidateRef, NewUploadJob, UploadQueueJob};
use hireloop_infra::jobs::{InMemoryQueueStore, QueueStore};
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn filled_store(rt: &tokio::runtime::Runtime, jobs: usize) -> Arc<InMemoryQueueStore> {
    let store = InMemoryQueueStore::arc();
    let base = Utc::now();
    rt.block_on(async {
        for i in 0..jobs {
            let candidate = CandidateRef::new("cand-bench").unwrap();
            let input = NewUploadJob::new(candidate, format!("r{i}.pdf")).unwrap();
            let job = UploadQueueJob::new(input, base + ChronoDuration::milliseconds(i as i64));
            store.enqueue(job).await.unwrap();
        }
    });
    store
}

/// Single claimer draining a backlog in batches.
fn bench_claim_next_batches(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_next_batches");

    for backlog in [100usize, 1000, 10000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || filled_store(&rt, backlog),
                |store| {
                    rt.block_on(async {
                        loop {
                            let batch = store.claim_next(5).await.unwrap();
                            if batch.is_empty() {
                                break;
                            }
                            black_box(batch);
                        }
                    })
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

/// Several concurrent claimers contending on one store.
fn bench_concurrent_claimers(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("concurrent_claimers");
    let backlog = 2000usize;
    group.throughput(Throughput::Elements(backlog as u64));

    for claimers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(claimers), &claimers, |b, &claimers| {
            b.iter_batched(
                || filled_store(&rt, backlog),
                |store| {
                    rt.block_on(async {
                        let mut tasks = Vec::with_capacity(claimers);
                        for _ in 0..claimers {
                            let store = store.clone();
                            tasks.push(tokio::spawn(async move {
                                let mut claimed = 0usize;
                                loop {
                                    let batch = store.claim_next(5).await.unwrap();
                                    if batch.is_empty() {
                                        break claimed;
                                    }
                                    claimed += batch.len();
                                }
                            }));
                        }
                        let mut total = 0;
                        for task in tasks {
                            total += task.await.unwrap();
                        }
                        assert_eq!(total, backlog);
                    })
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("snapshot");

    for jobs in [100usize, 1000, 10000] {
        let store = filled_store(&rt, jobs);
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, _| {
            b.iter(|| rt.block_on(async { black_box(store.snapshot().await.unwrap()) }));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_next_batches,
    bench_concurrent_claimers,
    bench_snapshot
);
criterion_main!(benches);
