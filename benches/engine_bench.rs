use criterion::{criterion_group, criterion_main};
use criterion::{BatchSize, Criterion};
use datastore::{DataStore, Engine, Mode};
use rand::distributions::Alphanumeric;
use rand::prelude::*;
use slog::{o, Logger};
use tempfile::TempDir;

/// 生成100个随机长度键值对
fn generate_kvpairs() -> Vec<(String, String)> {
    let mut key_value_pairs = Vec::with_capacity(100);
    let mut rng = rand::thread_rng();

    for _ in 0..100 {
        let key_len = rng.gen_range(1, 1_001);
        let value_len = rng.gen_range(1, 10_001);

        let key: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(key_len)
            .collect();
        let value: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(value_len)
            .collect();

        key_value_pairs.push((key, value));
    }

    key_value_pairs
}

fn open_store(engine: Engine) -> (DataStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = DataStore::open_at(
        engine,
        temp_dir.path().join("store"),
        Mode::ReadWrite,
        Logger::root(slog::Discard, o!()),
    )
    .unwrap();
    (store, temp_dir)
}

fn put_bench(c: &mut Criterion) {
    let key_value_pairs = generate_kvpairs();
    let mut group = c.benchmark_group("put_bench");

    for &engine in Engine::ALL {
        group.bench_function(engine.name(), |b| {
            b.iter_batched(
                || open_store(engine),
                |(mut store, _temp_dir)| {
                    for (k, v) in key_value_pairs.iter() {
                        let res = store.put(k.as_bytes(), v.as_bytes());
                        assert!(res.is_ok());
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn get_bench(c: &mut Criterion) {
    let key_value_pairs = generate_kvpairs();
    let mut request_keys = Vec::with_capacity(1000);
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let index: usize = rng.gen_range(0, 100);
        request_keys.push(&key_value_pairs[index].0);
    }

    let mut group = c.benchmark_group("get_bench");

    for &engine in Engine::ALL {
        group.bench_function(engine.name(), |b| {
            b.iter_batched(
                || {
                    // 打开存储并写入键值对
                    let (mut store, temp_dir) = open_store(engine);
                    for (k, v) in key_value_pairs.iter() {
                        store.put(k.as_bytes(), v.as_bytes()).unwrap();
                    }
                    (store, temp_dir)
                },
                |(mut store, _temp_dir)| {
                    for &key in request_keys.iter() {
                        let res = store.get(key.as_bytes());
                        assert!(matches!(res, Ok(Some(_))));
                    }
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, put_bench, get_bench);
criterion_main!(benches);
