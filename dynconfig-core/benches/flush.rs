use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dynconfig_core::{ConfigBuilder, ConfigHandler, Defaults, ManualScheduler};
use serde_json::json;

fn handler_with_listeners(listeners: usize) -> ConfigHandler {
    let handler = ConfigBuilder::new(json!({
        "endpointUrl": "https://e",
        "extensionConfig": {"sampling": 100, "maxBatchSize": 10}
    }))
    .scheduler(Arc::new(ManualScheduler::new()))
    .build()
    .expect("build config");

    for _ in 0..listeners {
        handler
            .watch(|details| {
                black_box(details.cfg.get_path("extensionConfig.sampling"));
                Ok(())
            })
            .expect("register listener");
    }
    handler
}

/// Benchmark: one write followed by an explicit flush.
fn bench_write_and_notify(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_and_notify");
    for listeners in [1, 16, 128] {
        let handler = handler_with_listeners(listeners);
        let ext = handler
            .root()
            .get("extensionConfig")
            .as_node()
            .cloned()
            .expect("extension config");
        let mut next = 0;

        group.bench_with_input(BenchmarkId::from_parameter(listeners), &listeners, |b, _| {
            b.iter(|| {
                next += 1;
                ext.set("sampling", next).expect("write");
                handler.notify().expect("flush");
            });
        });
    }
    group.finish();
}

/// Benchmark: building a config and applying a defaults tree.
fn bench_create_with_defaults(c: &mut Criterion) {
    let defaults = Defaults::from_json(json!({
        "endpointUrl": "https://default",
        "disableTelemetry": false,
        "samplingPercentage": 100,
        "channel": {"maxBatchSize": 100, "maxBatchInterval": 15000}
    }));

    c.bench_function("create_with_defaults", |b| {
        b.iter(|| {
            let handler = ConfigBuilder::new(json!({"instrumentationKey": "k"}))
                .defaults(defaults.clone())
                .scheduler(Arc::new(ManualScheduler::new()))
                .build()
                .expect("build config");
            black_box(handler.root().get("endpointUrl"));
        });
    });
}

criterion_group!(flush_benches, bench_write_and_notify, bench_create_with_defaults);
criterion_main!(flush_benches);
