//! 节点评估器
//!
//! 针对单个设备快照求值编译后的节点：属性比较、集合/区间匹配与空间关系。

use crate::ast::Qualifier;
use crate::compiler::widen;
use crate::error::{Result, RuleError};
use crate::geometry::{bbox_around, device_shape, rect_contains};
use crate::models::{Decl, Device, Match};
use crate::objects::ObjectStore;
use crate::operators::*;
use crate::spatial::DeviceIndex;
use crate::state::{StateId, StateIndex};
use crate::token::Token;
use geo::{BoundingRect, Geometry, Intersects, Point};
use std::cmp::Ordering;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EPSILON: f64 = 1e-6;

/// 浮点数近似相等
///
/// 差值超过 1e-6 直接判为不等；任一侧为 0 时与 `1e-6 * f32::MIN_POSITIVE` 比较，
/// 否则按相对误差比较。
pub fn float64_equal(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    if diff > EPSILON {
        return false;
    }
    if a == 0.0 || b == 0.0 {
        return diff < EPSILON * f64::from(f32::MIN_POSITIVE);
    }
    diff / (a.abs() + b.abs()).min(f64::MAX) < EPSILON
}

/// 一次规则评估的上下文
pub struct EvalContext<'a> {
    pub device: &'a Device,
    pub rule_id: &'a str,
    pub objects: &'a dyn ObjectStore,
    pub devices: &'a DeviceIndex,
    pub states: &'a StateIndex,
    pub cancel: &'a CancellationToken,
    pub circle_steps: usize,
    /// 评估时刻（Unix 秒）
    pub now: i64,
}

/// 节点评估器
pub struct NodeEvaluator;

impl NodeEvaluator {
    /// 评估单个节点
    pub fn evaluate(node: &Node, ctx: &EvalContext<'_>) -> Result<Match> {
        if ctx.cancel.is_cancelled() {
            return Err(RuleError::Cancelled);
        }
        match node {
            Node::Compare(n) => Ok(Self::compare(n, ctx.device)),
            Node::Membership(n) => Ok(Self::membership(n, ctx.device)),
            Node::Range(n) => Ok(Self::range(n, ctx.device)),
            Node::Spatial(n) => Self::spatial(n, ctx),
        }
    }

    fn compare(n: &CompareNode, device: &Device) -> Match {
        let ok = match current(n.field, device) {
            Some(value) => holds(n.op, ordering(&value, &n.value)),
            None => false,
        };
        property_match(ok, n.field, n.op, n.pos)
    }

    fn membership(n: &MembershipNode, device: &Device) -> Match {
        let found = match (&n.set, current(n.field, device)) {
            (ValueSet::Numbers(set), Some(Operand::Number(v))) => {
                set.iter().any(|x| float64_equal(v, *x))
            }
            (ValueSet::Texts(set), Some(Operand::Text(v))) => set.contains(&v),
            (ValueSet::Times(set), Some(Operand::Time(v))) => set.contains(&v),
            _ => false,
        };
        let ok = found != n.negate;
        property_match(ok, n.field, node_op(n.negate), n.pos)
    }

    fn range(n: &RangeNode, device: &Device) -> Match {
        let inside = match current(n.field, device) {
            Some(value) => {
                let lower = ordering(&value, &n.begin);
                let upper = ordering(&value, &n.end);
                holds(Token::Geq, lower) && holds(Token::Leq, upper)
            }
            None => false,
        };
        let ok = inside != n.negate;
        property_match(ok, n.field, node_op(n.negate), n.pos)
    }

    fn spatial(n: &SpatialNode, ctx: &EvalContext<'_>) -> Result<Match> {
        let device = ctx.device;
        let hits = match &n.target {
            Target::Objects {
                refs,
                qualifier,
                after,
                ..
            } => {
                let shape = device_shape(
                    device.latitude,
                    device.longitude,
                    widen(n.device, *qualifier),
                    ctx.circle_steps,
                );
                let hits = Self::objects(n, refs, &shape, ctx)?;
                hold_for(ctx, n.pos, hits, *after)?
            }
            Target::Devices {
                refs,
                qualifier,
                after,
            } => {
                let shape = device_shape(
                    device.latitude,
                    device.longitude,
                    widen(n.device, *qualifier),
                    ctx.circle_steps,
                );
                let shape = if n.by_box() {
                    match shape.bounding_rect() {
                        Some(rect) => Geometry::Rect(rect),
                        None => shape,
                    }
                } else {
                    shape
                };
                let hits = Self::devices(refs, &shape, ctx)?;
                hold_for(ctx, n.pos, hits, *after)?
            }
            Target::Nearby { qualifier } => Self::nearby(*qualifier, ctx)?,
        };

        let ok = !hits.is_empty() != n.negated();
        Ok(Match {
            ok,
            left: Decl::with_refs(Token::Device.as_str(), vec![device.imei.clone()]),
            right: Decl::with_refs(n.target.keyword(), hits),
            operator: n.op,
            pos: n.pos,
        })
    }

    /// 与设备形状满足空间关系的对象 ID；不存在的对象被跳过
    fn objects(
        n: &SpatialNode,
        refs: &[String],
        shape: &Geometry<f64>,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<String>> {
        let mut hits = Vec::new();
        for id in refs {
            if ctx.cancel.is_cancelled() {
                return Err(RuleError::Cancelled);
            }
            let object = match ctx.objects.lookup(id) {
                Ok(object) => object,
                Err(RuleError::ObjectNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let ok = match n.op {
                Token::Within | Token::NotWithin => object.contains_shape(shape),
                Token::Contains | Token::NotContains => object.within_shape(shape),
                _ if n.by_box() => shape
                    .bounding_rect()
                    .is_some_and(|rect| object.intersects_box(&rect)),
                _ => object.intersects(shape),
            };
            if ok {
                hits.push(id.clone());
            }
        }
        Ok(hits)
    }

    /// 指定设备中落在当前设备形状内的；未上报的设备被跳过
    fn devices(
        refs: &[String],
        shape: &Geometry<f64>,
        ctx: &EvalContext<'_>,
    ) -> Result<Vec<String>> {
        let mut hits = Vec::new();
        for imei in refs {
            if ctx.cancel.is_cancelled() {
                return Err(RuleError::Cancelled);
            }
            if *imei == ctx.device.imei {
                continue;
            }
            let other = match ctx.devices.lookup(imei) {
                Ok(other) => other,
                Err(RuleError::DeviceNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if shape.intersects(&Point::new(other.longitude, other.latitude)) {
                hits.push(imei.clone());
            }
        }
        Ok(hits)
    }

    /// 设备索引中范围内的任意其它设备
    fn nearby(qualifier: Qualifier, ctx: &EvalContext<'_>) -> Result<Vec<String>> {
        let device = ctx.device;
        let (lat, lon) = (device.latitude, device.longitude);
        let (meters, bbox) = match qualifier {
            Qualifier::Radius(m) => (m, None),
            Qualifier::BBox(m) => (m * std::f64::consts::SQRT_2, Some(bbox_around(lat, lon, m))),
        };

        let mut hits = Vec::new();
        ctx.devices.nearby(ctx.cancel, lat, lon, meters, |other| {
            let inside = bbox
                .as_ref()
                .is_none_or(|b| rect_contains(b, other.latitude, other.longitude));
            if other.imei != device.imei && inside {
                hits.push(other.imei.clone());
            }
            Ok(())
        })?;
        hits.sort();
        // 设备在遍历过程中换了单元时可能被访问两次
        hits.dedup();
        Ok(hits)
    }
}

/// `:after` 过滤：关系须持续成立给定时长才计入
///
/// 首次成立时间记在 (设备, 规则) 状态中，键为 `{节点位置}/{ID}`；不再成立的条目被清除。
fn hold_for(
    ctx: &EvalContext<'_>,
    pos: usize,
    hits: Vec<String>,
    after: Option<Duration>,
) -> Result<Vec<String>> {
    let Some(after) = after else {
        return Ok(hits);
    };

    let id = StateId::new(ctx.device.imei.as_str(), ctx.rule_id);
    let prefix = format!("{pos}/");
    ctx.states.modify(&id, |state| {
        state.objects.retain(|key, _| match key.strip_prefix(&prefix) {
            Some(rest) => hits.iter().any(|h| h == rest),
            None => true,
        });

        let mut held = Vec::new();
        for hit in hits {
            let since = *state
                .objects
                .entry(format!("{prefix}{hit}"))
                .or_insert(ctx.now);
            if (ctx.now - since) as f64 >= after.as_secs_f64() {
                held.push(hit);
            }
        }
        state.last_seen = ctx.now;
        held
    })
}

/// 设备当前的属性值
fn current(field: Token, device: &Device) -> Option<Operand> {
    match Family::of(field)? {
        Family::Numeric => device.number(field).map(Operand::Number),
        Family::Text => device.text(field).map(|s| Operand::Text(s.into_owned())),
        Family::Time => Some(Operand::Time(device.time_of_day())),
    }
}

/// 比较结果：`Some(Equal)` 表示近似相等，类型不一致时为 `None`
fn ordering(value: &Operand, expected: &Operand) -> Option<Ordering> {
    match (value, expected) {
        (Operand::Number(a), Operand::Number(b)) => {
            if float64_equal(*a, *b) {
                Some(Ordering::Equal)
            } else {
                a.partial_cmp(b)
            }
        }
        (Operand::Text(a), Operand::Text(b)) => Some(a.cmp(b)),
        (Operand::Time(a), Operand::Time(b)) => Some(a.minutes().cmp(&b.minutes())),
        _ => None,
    }
}

fn holds(op: Token, ord: Option<Ordering>) -> bool {
    let Some(ord) = ord else {
        return false;
    };
    match op {
        Token::Eql => ord == Ordering::Equal,
        Token::Neq => ord != Ordering::Equal,
        Token::Lss => ord == Ordering::Less,
        Token::Gtr => ord == Ordering::Greater,
        Token::Leq => ord != Ordering::Greater,
        Token::Geq => ord != Ordering::Less,
        _ => false,
    }
}

fn node_op(negate: bool) -> Token {
    if negate { Token::NotIn } else { Token::In }
}

fn property_match(ok: bool, field: Token, op: Token, pos: usize) -> Match {
    Match {
        ok,
        left: Decl::new(field.as_str()),
        right: Decl::new(Token::Device.as_str()),
        operator: op,
        pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Program;
    use crate::objects::{GeoObject, MemoryObjectStore, MockObjectStore};
    use geo::{coord, polygon, Rect};
    use std::sync::Arc;

    struct Fixture {
        objects: MemoryObjectStore,
        devices: DeviceIndex,
        states: StateIndex,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            let objects = MemoryObjectStore::new();
            // 约 1.1 km 见方
            objects.insert(GeoObject::new(
                "square",
                Rect::new(coord! { x: 19.995, y: 9.995 }, coord! { x: 20.005, y: 10.005 }),
            ));
            Self {
                objects,
                devices: DeviceIndex::new(36),
                states: StateIndex::new(),
                cancel: CancellationToken::new(),
            }
        }

        fn ctx<'a>(&'a self, device: &'a Device, now: i64) -> EvalContext<'a> {
            EvalContext {
                device,
                rule_id: "rule-1",
                objects: &self.objects,
                devices: &self.devices,
                states: &self.states,
                cancel: &self.cancel,
                circle_steps: 36,
                now,
            }
        }

        fn eval(&self, src: &str, device: &Device) -> bool {
            self.eval_at(src, device, 0)
        }

        fn eval_at(&self, src: &str, device: &Device, now: i64) -> bool {
            let program = Program::from_source(src).unwrap();
            NodeEvaluator::evaluate(&program.nodes[0], &self.ctx(device, now))
                .unwrap()
                .ok
        }
    }

    fn device(speed: f64) -> Device {
        Device {
            speed,
            brand: "acme".to_string(),
            date_time: 1_700_000_000,
            ..Device::new("d1", 10.0, 20.0)
        }
    }

    #[test]
    fn test_float64_equal() {
        assert!(float64_equal(1.0, 1.0));
        assert!(float64_equal(0.0, 0.0));
        assert!(!float64_equal(1.0, 1.1));
        assert!(!float64_equal(1.0, 1.00001));
        // 相对误差 5e-8
        assert!(float64_equal(1.0, 1.0000001));
        // 一侧为 0 时阈值极小
        assert!(!float64_equal(0.0, 1e-12));
        assert!(float64_equal(1e9, 1e9 + 1e-7));
    }

    #[test]
    fn test_numeric_comparisons() {
        let f = Fixture::new();
        let d = device(50.0);
        assert!(f.eval("speed == 50", &d));
        assert!(f.eval("speed == 50.0000000001", &d));
        assert!(!f.eval("speed != 50", &d));
        assert!(f.eval("speed >= 50", &d));
        assert!(f.eval("speed <= 50", &d));
        assert!(!f.eval("speed > 50", &d));
        assert!(!f.eval("speed < 50", &d));
        assert!(f.eval("speed > 49.5", &d));
        assert!(f.eval("60 > speed", &d));
        assert!(!f.eval("40 > speed", &d));
    }

    #[test]
    fn test_text_and_time_comparisons() {
        let f = Fixture::new();
        let d = device(0.0);
        assert!(f.eval("brand == \"acme\"", &d));
        assert!(f.eval("brand != \"globex\"", &d));
        assert!(f.eval("brand IN [\"acme\", \"globex\"]", &d));
        assert!(f.eval("brand NOT IN [\"initech\"]", &d));
        assert!(f.eval("date == \"2023-11-14\"", &d));
        // 1_700_000_000 为 UTC 22:13
        assert!(f.eval("time > 22:00", &d));
        assert!(f.eval("time IN [22:00 .. 22:13]", &d));
        assert!(!f.eval("time IN [08:00 .. 17:30]", &d));
        assert!(f.eval("hour == 22", &d));
    }

    #[test]
    fn test_membership_and_range() {
        let f = Fixture::new();
        let d = device(6.0);
        assert!(f.eval("speed IN [3, 6, 9]", &d));
        assert!(f.eval("speed NOT IN [1, 2]", &d));
        assert!(f.eval("speed IN [5 .. 10]", &d));
        assert!(f.eval("speed IN [6 .. 10]", &d));
        assert!(f.eval("speed IN [1 .. 6]", &d));
        assert!(!f.eval("speed IN [7 .. 10]", &d));
        assert!(f.eval("speed NOT IN [7 .. 10]", &d));
        assert!(f.eval("speed IN [5.5 .. 6.5]", &d));
    }

    #[test]
    fn test_object_relations() {
        let f = Fixture::new();
        let inside = device(0.0);
        let outside = Device::new("d2", 10.02, 20.0);

        assert!(f.eval("device INTERSECTS rect(@square)", &inside));
        assert!(f.eval("device WITHIN rect(@square)", &inside));
        assert!(f.eval("rect(@square) CONTAINS device", &inside));
        assert!(!f.eval("device INTERSECTS rect(@square)", &outside));
        assert!(f.eval("device NOT WITHIN rect(@square)", &outside));

        // 约 1.6 km 外，扩展 2 km 半径后相交
        assert!(f.eval("device :radius 2km NEAR rect(@square)", &outside));
        assert!(f.eval("device NEAR rect(@square) :radius 2km", &outside));
        // 5 km 圆包住整个方块
        assert!(f.eval("device :radius 5km CONTAINS rect(@square)", &inside));
        assert!(!f.eval("device CONTAINS rect(@square)", &inside));
    }

    #[test]
    fn test_intersects_box_uses_bounding_rect() {
        let f = Fixture::new();
        f.objects.insert(GeoObject::new(
            "tri",
            geo::polygon![
                (x: 20.0, y: 10.0),
                (x: 20.01, y: 10.0),
                (x: 20.0, y: 10.01)
            ],
        ));
        // 落在三角形包围盒内、斜边之外
        let corner = Device::new("d3", 10.008, 20.008);
        assert!(!f.eval("device INTERSECTS polygon(@tri)", &corner));
        assert!(f.eval("device INTERSECTS-BOX polygon(@tri)", &corner));
        assert!(!f.eval("device NOT INTERSECTS-BOX polygon(@tri)", &corner));

        let far = Device::new("d4", 10.05, 20.05);
        assert!(!f.eval("device INTERSECTS-BOX polygon(@tri)", &far));
        assert!(f.eval("device :radius 10km INTERSECTS-BOX polygon(@tri)", &far));
    }

    #[test]
    fn test_missing_objects_are_skipped() {
        let f = Fixture::new();
        let d = device(0.0);
        assert!(!f.eval("device NEAR polygon(@missing)", &d));
        assert!(f.eval("device NOT NEAR polygon(@missing)", &d));

        let program = Program::from_source("device NEAR rect(@missing, @square)").unwrap();
        let m = NodeEvaluator::evaluate(&program.nodes[0], &f.ctx(&d, 0)).unwrap();
        assert!(m.ok);
        assert_eq!(m.right.refs, vec!["square".to_string()]);
    }

    #[test]
    fn test_store_errors_propagate() {
        let mut store = MockObjectStore::new();
        store
            .expect_lookup()
            .returning(|_| Err(RuleError::InvalidRule("backend down".into())));
        let f = Fixture::new();
        let d = device(0.0);
        let ctx = EvalContext {
            objects: &store,
            ..f.ctx(&d, 0)
        };
        let program = Program::from_source("device NEAR polygon(@a)").unwrap();
        assert!(matches!(
            NodeEvaluator::evaluate(&program.nodes[0], &ctx),
            Err(RuleError::InvalidRule(_))
        ));
    }

    #[test]
    fn test_mock_store_lookup() {
        let mut store = MockObjectStore::new();
        store
            .expect_lookup()
            .times(1)
            .returning(|id| {
                Ok(Arc::new(GeoObject::new(
                    id,
                    Rect::new(coord! { x: 19.0, y: 9.0 }, coord! { x: 21.0, y: 11.0 }),
                )))
            });
        let f = Fixture::new();
        let d = device(0.0);
        let ctx = EvalContext {
            objects: &store,
            ..f.ctx(&d, 0)
        };
        let program = Program::from_source("device WITHIN polygon(@a)").unwrap();
        assert!(NodeEvaluator::evaluate(&program.nodes[0], &ctx).unwrap().ok);
    }

    #[test]
    fn test_device_to_device() {
        let f = Fixture::new();
        let me = device(0.0);
        f.devices.upsert(me.clone()).unwrap();
        // 约 555 米
        f.devices.upsert(Device::new("d2", 10.005, 20.0)).unwrap();
        // 约 11 公里
        f.devices.upsert(Device::new("d3", 10.1, 20.0)).unwrap();

        let program = Program::from_source("device :radius 1km NEAR device").unwrap();
        let m = NodeEvaluator::evaluate(&program.nodes[0], &f.ctx(&me, 0)).unwrap();
        assert!(m.ok);
        assert_eq!(m.right.refs, vec!["d2".to_string()]);

        assert!(!f.eval("device :radius 500m NEAR device", &me));
        assert!(f.eval("device :radius 20km NEAR device", &me));
        assert!(f.eval("device :bbox 1km NEAR device", &me));
        assert!(f.eval("device :radius 500m NOT NEAR device", &me));

        assert!(f.eval("device :radius 1km NEAR devices(@d2, @d3)", &me));
        assert!(!f.eval("device :radius 1km NEAR devices(@d3, @nobody)", &me));
        assert!(!f.eval("device :radius 1km NEAR devices(@d1)", &me));
    }

    #[test]
    fn test_after_requires_sustained_relation() {
        let f = Fixture::new();
        let d = device(0.0);
        let src = "device INTERSECTS rect(@square) :after 30s";
        assert!(!f.eval_at(src, &d, 1_000));
        assert!(!f.eval_at(src, &d, 1_020));
        assert!(f.eval_at(src, &d, 1_030));

        // 离开后计时重置
        let away = Device {
            latitude: 11.0,
            ..d.clone()
        };
        assert!(!f.eval_at(src, &away, 1_040));
        assert!(!f.eval_at(src, &d, 1_050));
        assert!(f.eval_at(src, &d, 1_080));
    }

    #[test]
    fn test_cancelled_context() {
        let f = Fixture::new();
        f.cancel.cancel();
        let d = device(0.0);
        let program = Program::from_source("speed > 1").unwrap();
        assert!(matches!(
            NodeEvaluator::evaluate(&program.nodes[0], &f.ctx(&d, 0)),
            Err(RuleError::Cancelled)
        ));
    }
}
