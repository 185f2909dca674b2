//! 网格分桶的空间索引
//!
//! 网格单元 ID 到桶的映射由 DashMap 维护，每个桶自带读写锁：查询只持有读锁，
//! 写入只锁受影响的单元。空桶在删除最后一个条目后被回收。

pub mod devices;
pub mod rules;

pub use devices::DeviceIndex;
pub use rules::RuleIndex;

use crate::grid::CellId;
use dashmap::DashMap;
use geo::Rect;
use parking_lot::RwLock;
use rstar::{AABB, RTree, RTreeObject};

/// 以网格单元分桶的 R 树集合
pub(crate) struct CellBuckets<T: RTreeObject<Envelope = AABB<[f64; 2]>>> {
    cells: DashMap<CellId, RwLock<RTree<T>>>,
}

impl<T> CellBuckets<T>
where
    T: RTreeObject<Envelope = AABB<[f64; 2]>> + PartialEq + Clone,
{
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    /// 插入条目；持有单元映射的分片锁，保证不会写入一个正在被回收的桶
    pub fn insert(&self, cell: CellId, item: T) {
        let bucket = self
            .cells
            .entry(cell)
            .or_insert_with(|| RwLock::new(RTree::new()));
        bucket.write().insert(item);
    }

    /// 删除条目，桶为空时回收
    pub fn remove(&self, cell: CellId, item: &T) -> bool {
        let removed = match self.cells.get(&cell) {
            Some(bucket) => bucket.write().remove(item).is_some(),
            None => false,
        };
        self.cells.remove_if(&cell, |_, bucket| bucket.read().size() == 0);
        removed
    }

    /// 单元内与任一包络相交的条目
    pub fn query(&self, cell: CellId, envelopes: &[AABB<[f64; 2]>]) -> Vec<T> {
        let Some(bucket) = self.cells.get(&cell) else {
            return Vec::new();
        };
        let tree = bucket.read();
        let mut out: Vec<T> = Vec::new();
        for envelope in envelopes {
            for item in tree.locate_in_envelope_intersecting(envelope) {
                if !out.contains(item) {
                    out.push(item.clone());
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }
}

/// 矩形及其经度平移 ±360° 后的副本，用于跨越 ±180° 的查询
pub(crate) fn wrapped_envelopes(rect: &Rect<f64>) -> Vec<AABB<[f64; 2]>> {
    let (min, max) = (rect.min(), rect.max());
    let mut out = vec![AABB::from_corners([min.x, min.y], [max.x, max.y])];
    if min.x < -180.0 {
        out.push(AABB::from_corners([min.x + 360.0, min.y], [180.0, max.y]));
    }
    if max.x > 180.0 {
        out.push(AABB::from_corners([-180.0, min.y], [max.x - 360.0, max.y]));
    }
    out
}

/// 点查询的包络，同时覆盖经度平移后的位置
pub(crate) fn point_envelopes(lat: f64, lon: f64) -> Vec<AABB<[f64; 2]>> {
    vec![
        AABB::from_point([lon, lat]),
        AABB::from_point([lon + 360.0, lat]),
        AABB::from_point([lon - 360.0, lat]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    #[test]
    fn test_wrapped_envelopes() {
        let rect = Rect::new(coord! { x: 179.0, y: 0.0 }, coord! { x: 181.0, y: 1.0 });
        let envs = wrapped_envelopes(&rect);
        assert_eq!(envs.len(), 2);
        assert_eq!(envs[1].lower(), [-180.0, 0.0]);
        assert_eq!(envs[1].upper(), [-179.0, 1.0]);

        let rect = Rect::new(coord! { x: 10.0, y: 0.0 }, coord! { x: 11.0, y: 1.0 });
        assert_eq!(wrapped_envelopes(&rect).len(), 1);
        assert_eq!(point_envelopes(0.0, 0.0).len(), 3);
    }
}
