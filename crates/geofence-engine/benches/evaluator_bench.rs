//! 规则引擎性能基准测试
//!
//! 覆盖解析、编译、单规则评估与整次设备检测的热路径。

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use geofence_engine::{
    Device, Engine, EvalContext, GeoObject, MemoryObjectStore, Program, RuleExecutor, RuleSpec,
    StateIndex, parse, spatial::DeviceIndex,
};
use geo::{Rect, coord};
use std::hint::black_box;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const SPECS: &[(&str, &str)] = &[
    ("compare", "speed > 50"),
    (
        "mixed",
        "(speed > 50 OR battery < 10) AND brand IN [\"acme\", \"globex\"] AND time IN [08:00 .. 17:30]",
    ),
    (
        "spatial",
        "device :radius 500m NEAR polygon(@depot) :after 30s AND {device.speed} >= 5 :trigger every 10m",
    ),
];

fn device(imei: &str, lat: f64, lon: f64) -> Device {
    Device {
        speed: 60.0,
        battery: 50.0,
        brand: "acme".to_string(),
        date_time: 1_700_000_000,
        ..Device::new(imei, lat, lon)
    }
}

/// 解析基准
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    for (name, src) in SPECS {
        group.bench_with_input(BenchmarkId::from_parameter(name), src, |b, src| {
            b.iter(|| parse(black_box(src)))
        });
    }
    group.finish();
}

/// 解析 + 编译基准
fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    for (name, src) in SPECS {
        group.bench_with_input(BenchmarkId::from_parameter(name), src, |b, src| {
            b.iter(|| Program::from_source(black_box(src)))
        });
    }
    group.finish();
}

/// 单规则评估基准
fn bench_evaluate(c: &mut Criterion) {
    let objects = MemoryObjectStore::new();
    objects.insert(GeoObject::new(
        "depot",
        Rect::new(coord! { x: 19.99, y: 9.99 }, coord! { x: 20.01, y: 10.01 }),
    ));
    let devices = DeviceIndex::new(36);
    let states = StateIndex::new();
    let cancel = CancellationToken::new();
    let executor = RuleExecutor::new();
    let subject = device("bench", 10.0, 20.0);

    let mut group = c.benchmark_group("evaluate");
    for (name, src) in SPECS {
        let program = Program::from_source(src).unwrap();
        let ctx = EvalContext {
            device: &subject,
            rule_id: "bench-rule",
            objects: &objects,
            devices: &devices,
            states: &states,
            cancel: &cancel,
            circle_steps: 36,
            now: 1_700_000_000,
        };
        group.bench_function(*name, |b| {
            b.iter(|| executor.execute("bench-rule", "bench", black_box(&program), &ctx))
        });
    }
    group.finish();
}

/// 整次设备检测基准：不同规则数量下的候选查找与评估
fn bench_detect(c: &mut Criterion) {
    let mut group = c.benchmark_group("detect");
    for count in [10usize, 100, 1_000] {
        let engine = Engine::new(Arc::new(MemoryObjectStore::new()));
        for i in 0..count {
            let offset = (i % 100) as f64 * 0.001;
            engine
                .register(RuleSpec::new(
                    format!("rule-{i}"),
                    "speed > 50 AND battery > 20",
                    10.0 + offset,
                    20.0 + offset,
                    5_000.0,
                ))
                .unwrap();
        }
        let cancel = CancellationToken::new();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| engine.detect(&cancel, black_box(device("bench", 10.05, 20.05))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse, bench_compile, bench_evaluate, bench_detect);
criterion_main!(benches);
