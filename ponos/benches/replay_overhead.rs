use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ponos::core::{Failure, Outcome};
use ponos::prelude::*;
use ponos::storage::{bucket_key, parse_snapshot, step_key, StepCache};
use serde_json::{json, Value};
use std::collections::HashMap;

// =============================================================================
// Fixtures
// =============================================================================

/// A bucket with `steps` steps, each failed twice and then succeeded.
fn snapshot_fields(steps: usize) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for i in 0..steps {
        let step = format!("step-{}", i);
        for attempt in 1..=2 {
            let failed: Outcome<Failure, Value> =
                Outcome::fail(Failure::new("timeout", "Error: timeout"));
            fields.insert(step_key(&step, attempt), serde_json::to_string(&failed).unwrap());
        }
        let done: Outcome<Failure, Value> = Outcome::succeed(json!({ "n": i }));
        fields.insert(step_key(&step, 3), serde_json::to_string(&done).unwrap());
    }
    fields
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_outcome_all(c: &mut Criterion) {
    let mixed: Vec<Outcome<String, u32>> = (0..100)
        .map(|i| {
            if i % 10 == 0 {
                Outcome::fail(format!("e{}", i))
            } else {
                Outcome::succeed(i)
            }
        })
        .collect();
    let successes: Vec<Outcome<String, u32>> = (0..100).map(Outcome::succeed).collect();

    c.bench_function("outcome_all_mixed_100", |b| {
        b.iter(|| black_box(Outcome::all(mixed.iter().cloned())))
    });
    c.bench_function("outcome_all_successes_100", |b| {
        b.iter(|| black_box(Outcome::all(successes.iter().cloned())))
    });
}

fn bench_parse_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_snapshot");
    for steps in [10, 100, 1000] {
        let fields = snapshot_fields(steps);
        group.bench_function(format!("{}_steps", steps), |b| {
            b.iter(|| black_box(parse_snapshot("tasks:bench:run", fields.clone()).unwrap()))
        });
    }
    group.finish();
}

fn bench_replay_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(InMemoryStepStore::new());

    rt.block_on(async {
        let bucket = bucket_key("bench", "run");
        for (field, value) in snapshot_fields(100) {
            store.put_if_absent(&bucket, &field, &value).await.unwrap();
        }
    });
    let cache = rt
        .block_on(StepCache::load(store.clone(), "bench", "run"))
        .unwrap();

    // What a replayed `step.run` does before it returns a cached value.
    c.bench_function("cached_step_attempts", |b| {
        b.iter(|| black_box(cache.attempts("step-42").unwrap()))
    });

    c.bench_function("load_step_cache_100_steps", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(StepCache::load(store.clone(), "bench", "run").await.unwrap())
            })
        })
    });
}

criterion_group!(
    benches,
    bench_outcome_all,
    bench_parse_snapshot,
    bench_replay_lookup,
);
criterion_main!(benches);
