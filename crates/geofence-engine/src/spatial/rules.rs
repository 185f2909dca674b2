//! 规则空间索引
//!
//! 两个互相独立的分层：细粒度层的桶是按规则包围盒建立的 R 树，粗粒度层的桶是
//! 普通哈希表（粗单元很大、规则很少，逐条扫描比维护 R 树更便宜）。
//! 规则本体只保存在按 ID 分片的扁平表中，网格单元里只存 ID。

use super::{CellBuckets, point_envelopes};
use crate::error::{Result, RuleError};
use crate::geometry::rect_contains;
use crate::grid::{self, CellId, COARSE_LEVEL, FINE_LEVEL};
use crate::models::Tier;
use crate::rule::Rule;
use crate::sharded::ShardedMap;
use dashmap::DashMap;
use geo::Rect;
use parking_lot::RwLock;
use rstar::{AABB, RTreeObject};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// 细粒度桶中的规则条目
#[derive(Debug, Clone, PartialEq)]
struct RuleEntry {
    id: String,
    envelope: AABB<[f64; 2]>,
}

impl RuleEntry {
    fn new(rule: &Rule) -> Self {
        let (min, max) = (rule.bbox.min(), rule.bbox.max());
        Self {
            id: rule.id.clone(),
            envelope: AABB::from_corners([min.x, min.y], [max.x, max.y]),
        }
    }
}

impl RTreeObject for RuleEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// 规则空间索引
pub struct RuleIndex {
    rules: ShardedMap<String, Arc<Rule>>,
    fine: CellBuckets<RuleEntry>,
    coarse: DashMap<CellId, RwLock<HashMap<String, Rect<f64>>>>,
}

impl RuleIndex {
    pub fn new() -> Self {
        Self {
            rules: ShardedMap::new(),
            fine: CellBuckets::new(),
            coarse: DashMap::new(),
        }
    }

    /// 插入规则，同 ID 的旧规则会先从所有单元中移除
    #[instrument(skip(self, rule), fields(rule_id = %rule.id, tier = ?rule.tier))]
    pub fn insert(&self, rule: Arc<Rule>) -> Result<()> {
        if rule.cells.is_empty() {
            return Err(RuleError::InvalidRule(format!(
                "rule {} has no covering cells",
                rule.id
            )));
        }

        // 扁平表与单元的写入在同一把 ID 分片锁内完成，与同 ID 的删除互斥
        self.rules.update(rule.id.as_str(), |shard| {
            if let Some(old) = shard.insert(rule.id.clone(), Arc::clone(&rule)) {
                warn!("替换已存在的规则: {}", old.id);
                self.unlink(&old);
            }
            self.link(&rule);
        });

        debug!(cells = rule.cells.len(), "规则已写入空间索引");
        Ok(())
    }

    /// 删除规则，并从其覆盖的每个单元中移除
    #[instrument(skip(self))]
    pub fn delete(&self, rule_id: &str) -> Result<Arc<Rule>> {
        let rule = self.rules.update(rule_id, |shard| -> Result<Arc<Rule>> {
            let rule = shard
                .remove(rule_id)
                .ok_or_else(|| RuleError::RuleNotFound(rule_id.to_string()))?;
            self.unlink(&rule);
            Ok(rule)
        })?;
        info!("规则已删除: {}", rule_id);
        Ok(rule)
    }

    pub fn lookup(&self, rule_id: &str) -> Result<Arc<Rule>> {
        self.rules
            .get(rule_id)
            .ok_or_else(|| RuleError::RuleNotFound(rule_id.to_string()))
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.rules.contains(rule_id)
    }

    /// 位置 (lat, lon) 上可能生效的规则：细、粗两层的精确点查询结果拼接
    pub fn find_candidates(&self, lat: f64, lon: f64) -> Vec<Arc<Rule>> {
        let mut ids: Vec<String> = self
            .fine
            .query(grid::cell(lat, lon, FINE_LEVEL), &point_envelopes(lat, lon))
            .into_iter()
            .map(|e| e.id)
            .collect();

        if let Some(bucket) = self.coarse.get(&grid::cell(lat, lon, COARSE_LEVEL)) {
            ids.extend(
                bucket
                    .read()
                    .iter()
                    .filter(|(_, bbox)| rect_contains(bbox, lat, lon))
                    .map(|(id, _)| id.clone()),
            );
        }

        // 单元里只有 ID，规则本体从扁平表解析；并发删除中的规则被跳过
        ids.iter().filter_map(|id| self.rules.get(id.as_str())).collect()
    }

    /// 依次访问所有规则，回调返回 false 时停止
    pub fn walk(&self, mut visit: impl FnMut(&Arc<Rule>) -> bool) {
        self.rules.for_each(|_, rule| visit(rule));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// (细粒度单元数, 粗粒度单元数)
    pub fn cell_counts(&self) -> (usize, usize) {
        (self.fine.len(), self.coarse.len())
    }

    fn link(&self, rule: &Rule) {
        match rule.tier {
            Tier::Fine => {
                let entry = RuleEntry::new(rule);
                for cell in &rule.cells {
                    self.fine.insert(*cell, entry.clone());
                }
            }
            Tier::Coarse => {
                for cell in &rule.cells {
                    let bucket = self
                        .coarse
                        .entry(*cell)
                        .or_insert_with(|| RwLock::new(HashMap::new()));
                    bucket.write().insert(rule.id.clone(), rule.bbox);
                }
            }
        }
    }

    fn unlink(&self, rule: &Rule) {
        match rule.tier {
            Tier::Fine => {
                let entry = RuleEntry::new(rule);
                for cell in &rule.cells {
                    self.fine.remove(*cell, &entry);
                }
            }
            Tier::Coarse => {
                for cell in &rule.cells {
                    if let Some(bucket) = self.coarse.get(cell) {
                        bucket.write().remove(&rule.id);
                    }
                    self.coarse
                        .remove_if(cell, |_, bucket| bucket.read().is_empty());
                }
            }
        }
    }
}

impl Default for RuleIndex {
    fn default() -> Self {
        Self::new()
    }
}
