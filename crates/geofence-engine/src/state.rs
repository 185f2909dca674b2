//! (设备, 规则) 维度的评估状态
//!
//! 主存储以复合键分片，另有“按规则”“按设备”两个二级索引，仅用于级联删除。
//! 写入与链接在级联锁的读模式下完成，级联删除持有写模式，因此调用方看到的
//! 级联删除是原子的：删除开始前写入的状态一定被删掉，不会残留半截链接。

use crate::error::{Result, RuleError};
use crate::sharded::ShardedMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument};

/// 状态键：设备 IMEI + 规则 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateId {
    pub imei: String,
    pub rule_id: String,
}

impl StateId {
    pub fn new(imei: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            imei: imei.into(),
            rule_id: rule_id.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.imei.is_empty() || self.rule_id.is_empty() {
            return Err(RuleError::InvalidRule(format!(
                "state id requires imei and rule id: {self:?}"
            )));
        }
        Ok(())
    }
}

/// 一个设备在一条规则上的累计状态，时间均为 Unix 秒
#[derive(Debug, Clone, PartialEq)]
pub struct State {
    pub id: StateId,
    pub last_seen: i64,
    /// 触发计数
    pub hits: u32,
    /// `N times in <interval>` 的窗口起点
    pub window_start: i64,
    pub last_fired: i64,
    /// 空间关系首次成立的时间，键为 `{节点位置}/{对象 ID}`
    pub objects: HashMap<String, i64>,
}

impl State {
    pub fn new(id: StateId) -> Self {
        Self {
            id,
            last_seen: 0,
            hits: 0,
            window_start: 0,
            last_fired: 0,
            objects: HashMap::new(),
        }
    }
}

/// 状态索引
#[derive(Default)]
pub struct StateIndex {
    states: ShardedMap<StateId, State>,
    by_rule: DashMap<String, HashSet<String>>,
    by_device: DashMap<String, HashSet<String>>,
    cascade: RwLock<()>,
}

impl StateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一条空状态，已存在时返回现有状态
    pub fn make(&self, id: StateId) -> Result<State> {
        self.modify(&id, |state| state.clone())
    }

    /// 在分片写锁内读改写一条状态，不存在时先创建
    ///
    /// 同一 (设备, 规则) 的并发调用被串行化，闭包看到的总是上一次写入的结果。
    pub fn modify<R>(&self, id: &StateId, f: impl FnOnce(&mut State) -> R) -> Result<R> {
        id.validate()?;
        let _cascade = self.cascade.read();
        let out = self.states.update(id, |shard| {
            let state = shard
                .entry(id.clone())
                .or_insert_with(|| State::new(id.clone()));
            f(state)
        });
        self.link(id);
        Ok(out)
    }

    pub fn lookup(&self, id: &StateId) -> Result<State> {
        self.states
            .get(id)
            .ok_or_else(|| RuleError::StateNotFound {
                imei: id.imei.clone(),
                rule_id: id.rule_id.clone(),
            })
    }

    /// 写回状态，覆盖已有内容
    pub fn update(&self, state: State) -> Result<()> {
        let id = state.id.clone();
        self.modify(&id, |slot| *slot = state)
    }

    pub fn remove(&self, id: &StateId) -> Result<()> {
        let _cascade = self.cascade.read();
        if self.states.remove(id).is_none() {
            return Err(RuleError::StateNotFound {
                imei: id.imei.clone(),
                rule_id: id.rule_id.clone(),
            });
        }
        unlink(&self.by_rule, &id.rule_id, &id.imei);
        unlink(&self.by_device, &id.imei, &id.rule_id);
        Ok(())
    }

    /// 删除某条规则的全部状态，返回删除条数
    #[instrument(skip(self))]
    pub fn remove_by_rule(&self, rule_id: &str) -> usize {
        let _cascade = self.cascade.write();
        let Some((_, imeis)) = self.by_rule.remove(rule_id) else {
            return 0;
        };
        let mut removed = 0;
        for imei in imeis {
            if self.states.remove(&StateId::new(imei.as_str(), rule_id)).is_some() {
                removed += 1;
            }
            unlink(&self.by_device, &imei, rule_id);
        }
        debug!(removed, "规则状态已级联删除");
        removed
    }

    /// 删除某个设备的全部状态，返回删除条数
    #[instrument(skip(self))]
    pub fn remove_by_device(&self, imei: &str) -> usize {
        let _cascade = self.cascade.write();
        let Some((_, rules)) = self.by_device.remove(imei) else {
            return 0;
        };
        let mut removed = 0;
        for rule_id in rules {
            if self.states.remove(&StateId::new(imei, rule_id.as_str())).is_some() {
                removed += 1;
            }
            unlink(&self.by_rule, &rule_id, imei);
        }
        debug!(removed, "设备状态已级联删除");
        removed
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// 某条规则当前关联的设备
    pub fn devices_of_rule(&self, rule_id: &str) -> Vec<String> {
        self.by_rule
            .get(rule_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 某个设备当前关联的规则
    pub fn rules_of_device(&self, imei: &str) -> Vec<String> {
        self.by_device
            .get(imei)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn link(&self, id: &StateId) {
        self.by_rule
            .entry(id.rule_id.clone())
            .or_default()
            .insert(id.imei.clone());
        self.by_device
            .entry(id.imei.clone())
            .or_default()
            .insert(id.rule_id.clone());
    }
}

/// 从二级索引中移除一条关联，集合为空时清理外层键
fn unlink(index: &DashMap<String, HashSet<String>>, outer: &str, inner: &str) {
    if let Some(mut set) = index.get_mut(outer) {
        set.remove(inner);
    }
    index.remove_if(outer, |_, set| set.is_empty());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_make_lookup_update() {
        let index = StateIndex::new();
        let id = StateId::new("imei-1", "rule-1");
        assert!(matches!(
            index.lookup(&id),
            Err(RuleError::StateNotFound { .. })
        ));

        let mut state = index.make(id.clone()).unwrap();
        assert_eq!(state.hits, 0);
        state.hits = 3;
        index.update(state).unwrap();
        assert_eq!(index.lookup(&id).unwrap().hits, 3);

        // 重复 make 不覆盖已有状态
        assert_eq!(index.make(id.clone()).unwrap().hits, 3);
    }

    #[test]
    fn test_rejects_empty_keys() {
        let index = StateIndex::new();
        assert!(index.make(StateId::new("", "r")).is_err());
        assert!(index.make(StateId::new("d", "")).is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_by_device_cascades() {
        let index = StateIndex::new();
        for rule in ["r1", "r2"] {
            index.make(StateId::new("d1", rule)).unwrap();
            index.make(StateId::new("d2", rule)).unwrap();
        }
        assert_eq!(index.len(), 4);

        assert_eq!(index.remove_by_device("d1"), 2);
        assert!(index.lookup(&StateId::new("d1", "r1")).is_err());
        assert!(index.lookup(&StateId::new("d1", "r2")).is_err());
        assert_eq!(index.devices_of_rule("r1"), vec!["d2".to_string()]);
        assert_eq!(index.devices_of_rule("r2"), vec!["d2".to_string()]);
        assert!(index.rules_of_device("d1").is_empty());
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_by_rule_cascades() {
        let index = StateIndex::new();
        index.make(StateId::new("d1", "r1")).unwrap();
        index.make(StateId::new("d1", "r2")).unwrap();

        assert_eq!(index.remove_by_rule("r1"), 1);
        assert_eq!(index.remove_by_rule("r1"), 0);
        assert_eq!(index.rules_of_device("d1"), vec!["r2".to_string()]);
        assert!(index.devices_of_rule("r1").is_empty());
    }

    #[test]
    fn test_concurrent_modify_keeps_every_hit() {
        let index = Arc::new(StateIndex::new());
        let id = StateId::new("d1", "r1");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let index = Arc::clone(&index);
                let id = id.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        index.modify(&id, |state| state.hits += 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(index.lookup(&id).unwrap().hits, 4_000);
    }

    #[test]
    fn test_cascade_is_atomic_against_writers() {
        let index = Arc::new(StateIndex::new());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let index = Arc::clone(&index);
                thread::spawn(move || {
                    for i in 0..300 {
                        let id = StateId::new(format!("d{t}-{}", i % 10), "r1");
                        index.modify(&id, |state| state.hits += 1).unwrap();
                        index.make(StateId::new(format!("d{t}"), "r2")).unwrap();
                    }
                })
            })
            .collect();
        let cascader = {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for _ in 0..200 {
                    index.remove_by_rule("r1");
                    index.remove_by_device("d0");
                }
            })
        };
        for h in writers {
            h.join().unwrap();
        }
        cascader.join().unwrap();

        // 幸存的状态必须在两个二级索引中都有链接
        for state in index.states.values() {
            let StateId { imei, rule_id } = &state.id;
            assert!(index.devices_of_rule(rule_id).contains(imei), "{imei}/{rule_id}");
            assert!(index.rules_of_device(imei).contains(rule_id), "{imei}/{rule_id}");
        }

        index.remove_by_rule("r1");
        index.remove_by_rule("r2");
        assert!(index.is_empty());
        assert!(index.by_rule.is_empty());
        assert!(index.by_device.is_empty());
    }

    #[test]
    fn test_remove_single() {
        let index = StateIndex::new();
        let id = StateId::new("d1", "r1");
        index.make(id.clone()).unwrap();
        index.remove(&id).unwrap();
        assert!(index.remove(&id).is_err());
        assert!(index.rules_of_device("d1").is_empty());
        assert!(index.devices_of_rule("r1").is_empty());
    }
}
