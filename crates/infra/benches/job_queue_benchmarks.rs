use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use tenantforge_core::{BackupId, TenantId};
use tenantforge_infra::jobs::{InMemoryJobQueue, JobPayload, JobQueue, Lane, LeasePolicy};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

/// Enqueue `n` jobs for distinct tenants spread over the three lanes.
async fn fill(queue: &InMemoryJobQueue, n: usize) {
    for i in 0..n {
        let tenant = TenantId::new();
        let (payload, lane) = match i % 3 {
            0 => (JobPayload::restore(tenant, BackupId::new()), Lane::High),
            1 => (JobPayload::provision(tenant), Lane::Default),
            _ => (JobPayload::backup(tenant, BackupId::new()), Lane::Low),
        };
        queue.enqueue(payload, lane).await.unwrap();
    }
}

fn bench_enqueue(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("enqueue");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_job", |b| {
        let queue = InMemoryJobQueue::new(LeasePolicy::default());
        b.iter(|| {
            rt.block_on(async {
                black_box(
                    queue
                        .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
                        .await
                        .unwrap(),
                )
            })
        });
    });

    group.finish();
}

fn bench_lease_complete_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("lease_complete_cycle");

    for backlog in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::new("drain", backlog), &backlog, |b, &n| {
            b.iter(|| {
                rt.block_on(async {
                    let queue = InMemoryJobQueue::new(LeasePolicy::default());
                    fill(&queue, n).await;
                    while let Some(leased) = queue.lease_next(Duration::ZERO).await.unwrap() {
                        queue.complete(&leased).await.unwrap();
                    }
                    black_box(queue.stats().await.unwrap())
                })
            });
        });
    }

    group.finish();
}

/// Lease contention: one tenant with a deep backlog behind many others.
fn bench_busy_tenant_skip(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("busy_tenant_skip");

    group.bench_function("skip_500_same_tenant", |b| {
        b.iter(|| {
            rt.block_on(async {
                let queue = Arc::new(InMemoryJobQueue::new(LeasePolicy::default()));
                let hot = TenantId::new();
                for _ in 0..500 {
                    queue.enqueue(JobPayload::provision(hot), Lane::Default).await.unwrap();
                }
                queue
                    .enqueue(JobPayload::provision(TenantId::new()), Lane::Default)
                    .await
                    .unwrap();

                let held = queue.lease_next(Duration::ZERO).await.unwrap().unwrap();
                black_box(queue.lease_next(Duration::ZERO).await.unwrap());
                queue.complete(&held).await.unwrap();
            })
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue,
    bench_lease_complete_cycle,
    bench_busy_tenant_skip
);
criterion_main!(benches);
