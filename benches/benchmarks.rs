use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use opstate::checkpoint::KvStore;
use opstate::checkpoint::MemStore;
use opstate::engine::MemEngine;
use opstate::functions::FunctionRegistry;
use opstate::FuncContext;
use opstate::OperatorContext;
use opstate::StateStore;
use opstate::Value;

fn operator() -> Arc<OperatorContext> {
    let store: Arc<dyn StateStore> = Arc::new(MemStore);
    Arc::new(OperatorContext::new("bench", "op", store).unwrap())
}

pub fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("state");
    group.bench_function("incr_counter", |b| {
        let ctx = operator();
        b.iter(|| ctx.incr_counter("n", 1).unwrap());
    });
    for size in [1, 16, 256] {
        group.bench_with_input(BenchmarkId::new("lag", size), &size, |b, &size| {
            let registry = FunctionRegistry::with_builtins();
            let ctx = FuncContext::new(operator(), 0);
            let args = [Value::from(1), Value::from(size), Value::from("k")];
            b.iter(|| registry.exec("lag", &ctx, &args).unwrap());
        });
    }
    group.finish();

    let mut group = c.benchmark_group("checkpoint");
    for keys in [10, 1000] {
        group.bench_with_input(BenchmarkId::new("save", keys), &keys, |b, &keys| {
            let store = Arc::new(KvStore::with_engine("bench", Arc::new(MemEngine::new()), 3).unwrap());
            let ctx = OperatorContext::new("bench", "op", store.clone()).unwrap();
            for i in 0..keys {
                ctx.incr_counter(&format!("key{i}"), i).unwrap();
            }
            let mut checkpoint_id = 0;
            b.iter(|| {
                checkpoint_id += 1;
                ctx.snapshot().unwrap();
                ctx.save_state(checkpoint_id).unwrap();
                store.save_checkpoint(checkpoint_id).unwrap();
            });
            store.wait_for_evictions();
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
