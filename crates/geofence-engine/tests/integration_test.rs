//! 地理围栏引擎集成测试
//!
//! 测试完整的规则注册、编译、检测工作流。

use geofence_engine::{
    Device, Engine, GeoObject, MemoryObjectStore, ObjectStore, Program, RuleError, RuleSpec,
    StateId, StateIndex, parse,
};
use geo::{Rect, coord};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const LAT: f64 = 42.334;
const LON: f64 = -72.237;

fn engine() -> Engine {
    Engine::new(Arc::new(MemoryObjectStore::new()))
}

fn device(imei: &str, lat: f64, lon: f64, speed: f64) -> Device {
    Device {
        speed,
        date_time: 1_700_000_000,
        ..Device::new(imei, lat, lon)
    }
}

#[test]
fn test_speed_sequence_against_two_rules() {
    let engine = engine();
    let slow = engine
        .register(RuleSpec::new(
            "slow",
            "{device.speed} >= 0 AND {device.speed} < 5",
            LAT,
            LON,
            10_000.0,
        ))
        .unwrap();
    let fast = engine
        .register(RuleSpec::new(
            "fast",
            "{device.speed} >= 10 AND {device.speed} < 25",
            LAT,
            LON,
            10_000.0,
        ))
        .unwrap();

    let cancel = CancellationToken::new();
    let fired: Vec<Vec<String>> = [0.0, 3.0, 6.0, 9.0, 12.0]
        .into_iter()
        .map(|speed| {
            engine
                .detect(&cancel, device("d1", LAT, LON, speed))
                .unwrap()
                .into_iter()
                .map(|e| e.rule_id)
                .collect()
        })
        .collect();

    assert_eq!(
        fired,
        vec![
            vec![slow.id.clone()],
            vec![slow.id.clone()],
            vec![],
            vec![],
            vec![fast.id.clone()],
        ]
    );
}

#[test]
fn test_or_escape() {
    let engine = engine();
    let rule = engine
        .register(RuleSpec::new(
            "either",
            "{device.speed} >= 0 OR {device.speed} < 5",
            LAT,
            LON,
            10_000.0,
        ))
        .unwrap();
    let result = engine
        .evaluate(&CancellationToken::new(), &rule, &device("d1", LAT, LON, 3.0))
        .unwrap();
    assert!(result.matched);
    assert_eq!(result.matches.len(), 1);
}

#[test]
fn test_coarse_rule_lifecycle() {
    let engine = engine();
    let rule = engine
        .register(RuleSpec::new("region", "speed > 0", LAT, LON, 139_000.0))
        .unwrap();

    let mut seen = Vec::new();
    engine.walk(&device("d1", LAT, LON, 0.0), |r| {
        seen.push(r.id.clone());
        true
    });
    assert_eq!(seen, vec![rule.id.clone()]);

    engine.delete_rule(&rule.id).unwrap();
    let mut seen = 0;
    engine.walk(&device("d1", LAT, LON, 0.0), |_| {
        seen += 1;
        true
    });
    assert_eq!(seen, 0);
    assert!(matches!(
        engine.find_rule(&rule.id),
        Err(RuleError::RuleNotFound(_))
    ));
    assert_eq!(engine.stats().coarse_cells, 0);
}

#[test]
fn test_state_cascade_by_device() {
    let states = StateIndex::new();
    let ids = [
        StateId::new("d1", "r1"),
        StateId::new("d1", "r2"),
        StateId::new("d2", "r1"),
    ];
    for id in &ids {
        states.make(id.clone()).unwrap();
    }

    assert_eq!(states.remove_by_device("d1"), 2);
    assert!(states.lookup(&ids[0]).is_err());
    assert!(states.lookup(&ids[1]).is_err());
    assert!(states.lookup(&ids[2]).is_ok());
    assert_eq!(states.devices_of_rule("r1"), vec!["d2".to_string()]);
    assert!(states.devices_of_rule("r2").is_empty());
    assert!(states.rules_of_device("d1").is_empty());
}

#[test]
fn test_near_device_to_device() {
    let engine = engine();
    let rule = engine
        .register(RuleSpec::new(
            "convoy",
            "device :radius 1km NEAR device",
            LAT,
            LON,
            10_000.0,
        ))
        .unwrap();
    let cancel = CancellationToken::new();

    // 约 555 米
    engine.upsert_device(device("d2", LAT + 0.005, LON, 0.0)).unwrap();
    let events = engine.detect(&cancel, device("d1", LAT, LON, 0.0)).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, rule.id);
    assert_eq!(events[0].matches[0].right.refs, vec!["d2".to_string()]);

    // 约 5.5 公里
    engine.upsert_device(device("d2", LAT + 0.05, LON, 0.0)).unwrap();
    assert!(engine.detect(&cancel, device("d1", LAT, LON, 0.0)).unwrap().is_empty());
}

#[test]
fn test_object_rules() {
    let objects = Arc::new(MemoryObjectStore::new());
    objects.insert(GeoObject::new(
        "depot",
        Rect::new(
            coord! { x: LON - 0.01, y: LAT - 0.01 },
            coord! { x: LON + 0.01, y: LAT + 0.01 },
        ),
    ));
    let store: Arc<dyn ObjectStore> = objects.clone();
    let engine = Engine::new(store);
    engine
        .register(RuleSpec::new(
            "left depot",
            "device NOT WITHIN rect(@depot) AND speed > 5 :trigger once",
            LAT,
            LON,
            10_000.0,
        ))
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(engine.detect(&cancel, device("d1", LAT, LON, 20.0)).unwrap().is_empty());
    let events = engine
        .detect(&cancel, device("d1", LAT + 0.02, LON, 20.0))
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(engine
        .detect(&cancel, device("d1", LAT + 0.03, LON, 20.0))
        .unwrap()
        .is_empty());

    // 对象被移除后，NOT WITHIN 对任意位置都成立
    objects.remove("depot").unwrap();
    assert_eq!(
        engine.detect(&cancel, device("d2", LAT, LON, 20.0)).unwrap().len(),
        1
    );
}

#[test]
fn test_range_parsing() {
    assert!(parse("speed IN [10 .. 5]").is_err());
    assert!(parse("speed IN [10 .. 10]").is_err());

    let engine = engine();
    let rule = engine
        .register(RuleSpec::new("band", "speed IN [5 .. 10]", LAT, LON, 10_000.0))
        .unwrap();
    let cancel = CancellationToken::new();
    for (speed, expected) in [(4.9, false), (5.0, true), (7.5, true), (10.0, true), (10.1, false)] {
        let result = engine
            .evaluate(&cancel, &rule, &device("d1", LAT, LON, speed))
            .unwrap();
        assert_eq!(result.matched, expected, "speed {speed}");
    }
}

#[test]
fn test_node_count_round_trip() {
    for src in [
        "speed > 1",
        "speed > 1 AND battery < 20 OR status == 3",
        "((speed > 1) OR (speed < 0)) AND brand IN [\"acme\"]",
        "device :bbox 2km NEAR devices(@d1, @d2) :after 30s OR temperature >= -5.5",
        "device INTERSECTS polygon(@a, @b) AND time IN [08:00 .. 17:30] :trigger 3 times in 10m",
        "{device.fuelLevel} < 10 :trigger every 1h30m",
    ] {
        let program = Program::from_source(src).unwrap_or_else(|e| panic!("{src}: {e}"));
        assert_eq!(program.nodes.len(), program.ops.len() + 1, "{src}");
    }
}

#[test]
fn test_parse_error_reports_offset() {
    let engine = engine();
    let err = engine
        .register(RuleSpec::new("broken", "speed > $", LAT, LON, 10_000.0))
        .unwrap_err();
    match err {
        RuleError::Parse(e) => assert_eq!(e.offset, 8),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(engine.stats().rules_count, 0);
}
