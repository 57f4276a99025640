use criterion::{black_box, criterion_group, criterion_main, Criterion};

use xexec::{ExecController, Promise, Registry};

fn bench_execution(c: &mut Criterion) {
    let controller = ExecController::builder()
        .compute_threads(2)
        .thread_name("bench-exec")
        .build()
        .expect("controller build");

    c.bench_function("execution_round_trip", |b| {
        b.iter(|| {
            let (tx, rx) = std::sync::mpsc::channel();
            controller.fork().start(move |_execution| {
                let _ = tx.send(1u8);
                Ok(())
            });
            black_box(rx.recv().unwrap());
        });
    });

    c.bench_function("promise_map_then", |b| {
        b.iter(|| {
            let (tx, rx) = std::sync::mpsc::channel();
            controller.fork().start(move |_execution| {
                Promise::of(2).map(|n| n * 3).then(move |n| {
                    let _ = tx.send(n);
                    Ok(())
                })
            });
            black_box(rx.recv().unwrap());
        });
    });
}

fn bench_registry(c: &mut Criterion) {
    let parent = Registry::builder()
        .add("p1".to_string())
        .add("p2".to_string())
        .build();
    let joined = parent.join(Registry::single("c1".to_string()));

    c.bench_function("registry_joined_maybe_get", |b| {
        b.iter(|| {
            let _ = black_box(joined.maybe_get::<String>());
        });
    });

    c.bench_function("registry_joined_get_all", |b| {
        b.iter(|| {
            let _ = black_box(joined.get_all::<String>());
        });
    });
}

criterion_group!(benches, bench_execution, bench_registry);
criterion_main!(benches);
