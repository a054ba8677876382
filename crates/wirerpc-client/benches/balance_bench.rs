// Criterion benchmarks for wirerpc-client
//
// Run benchmarks with:
//   cargo bench -p wirerpc-client

use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::time::Instant;
use wirerpc_client::{
    CallSlot, LoadBalancer, PendingCall, PendingCallTable, Provider, RandomLoadBalancer,
    RoundRobinLoadBalancer,
};
use wirerpc_common::Response;

fn providers(n: usize) -> Vec<Provider> {
    (0..n)
        .map(|i| Provider::new(format!("10.0.{}.{}:7000", i / 256, i % 256), 1 + (i % 100) as i32))
        .collect()
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");

    for n in [2usize, 16, 256] {
        let rr = RoundRobinLoadBalancer::new();
        rr.set_providers(providers(n));
        group.bench_with_input(BenchmarkId::new("round_robin", n), &rr, |b, lb| {
            b.iter(|| black_box(lb.select()));
        });

        let random = RandomLoadBalancer::new();
        random.set_providers(providers(n));
        group.bench_with_input(BenchmarkId::new("random", n), &random, |b, lb| {
            b.iter(|| black_box(lb.select()));
        });
    }

    group.finish();
}

fn bench_pending(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();
    let table = PendingCallTable::new();
    let mut next_id = 0i32;

    c.bench_function("register_complete", |b| {
        b.iter(|| {
            let (slot, future) = CallSlot::new();
            let id = next_id;
            next_id = next_id.wrapping_add(1);
            table.register(PendingCall::new(id, 1, slot, Instant::now() + Duration::from_secs(5)));
            table.complete(id, Response::ok(id, &b""[..]));
            black_box(future);
        });
    });
}

criterion_group!(benches, bench_select, bench_pending);
criterion_main!(benches);
