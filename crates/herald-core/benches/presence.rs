//! Benchmarks for presence views and routing.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use herald_core::{presence_view, Member, Router};
use serde_json::json;

fn membership(users: usize, tabs: usize) -> Vec<Member> {
    (0..users * tabs)
        .map(|i| {
            Member::new(
                json!(i % users),
                json!({ "name": format!("user-{}", i % users) }),
                format!("conn-{i}"),
            )
        })
        .collect()
}

fn bench_presence_view(c: &mut Criterion) {
    let mut group = c.benchmark_group("presence_view");

    for users in [10, 100, 1000] {
        let members = membership(users, 3);
        group.bench_with_input(BenchmarkId::from_parameter(users), &members, |b, members| {
            b.iter(|| presence_view(black_box(members)));
        });
    }

    group.finish();
}

fn bench_emit(c: &mut Criterion) {
    let mut group = c.benchmark_group("emit");

    for subscribers in [10, 100, 1000] {
        let router = Router::new();
        let mut inboxes = Vec::with_capacity(subscribers);
        for i in 0..subscribers {
            let id = format!("conn-{i}");
            inboxes.push(router.register(&id));
            router.subscribe(&id, "bench").unwrap();
        }

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    router.emit("bench", "tick", json!({ "n": 1 }));
                    for inbox in &mut inboxes {
                        while inbox.try_recv().is_ok() {}
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_presence_view, bench_emit);
criterion_main!(benches);
