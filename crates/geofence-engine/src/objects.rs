//! 几何对象协作者
//!
//! 规则通过 `polygon(@id)` 等引用的几何对象由 [`ObjectStore`] 提供，
//! 引擎只依赖查找接口；[`MemoryObjectStore`] 是基于 DashMap 的进程内实现。

use crate::error::{Result, RuleError};
use dashmap::DashMap;
use geo::{BoundingRect, Contains, Geometry, Intersects, Point, Polygon, Rect};
use std::sync::Arc;
use tracing::debug;

/// 被规则引用的几何对象
#[derive(Debug, Clone, PartialEq)]
pub struct GeoObject {
    pub id: String,
    pub geometry: Geometry<f64>,
}

impl GeoObject {
    pub fn new(id: impl Into<String>, geometry: impl Into<Geometry<f64>>) -> Self {
        Self {
            id: id.into(),
            geometry: geometry.into(),
        }
    }

    pub fn intersects_point(&self, point: &Point<f64>) -> bool {
        self.geometry.intersects(point)
    }

    pub fn intersects_poly(&self, poly: &Polygon<f64>) -> bool {
        self.geometry.intersects(poly)
    }

    pub fn intersects_rect(&self, rect: &Rect<f64>) -> bool {
        self.geometry.intersects(rect)
    }

    /// 与任意形状相交
    pub fn intersects(&self, shape: &Geometry<f64>) -> bool {
        match shape {
            Geometry::Point(p) => self.intersects_point(p),
            Geometry::Polygon(p) => self.intersects_poly(p),
            Geometry::Rect(r) => self.intersects_rect(r),
            other => self.geometry.intersects(other),
        }
    }

    /// 对象的包围盒与矩形相交
    pub fn intersects_box(&self, rect: &Rect<f64>) -> bool {
        self.geometry
            .bounding_rect()
            .is_some_and(|b| b.intersects(rect))
    }

    /// 形状完全落在对象内部
    pub fn contains_shape(&self, shape: &Geometry<f64>) -> bool {
        self.geometry.contains(shape)
    }

    /// 对象完全落在形状内部
    pub fn within_shape(&self, shape: &Geometry<f64>) -> bool {
        shape.contains(&self.geometry)
    }
}

/// 几何对象查找接口
#[cfg_attr(test, mockall::automock)]
pub trait ObjectStore: Send + Sync {
    /// 按 ID 查找，不存在时返回 `RuleError::ObjectNotFound`
    fn lookup(&self, id: &str) -> Result<Arc<GeoObject>>;
}

/// 进程内对象存储
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, Arc<GeoObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: GeoObject) {
        debug!(object_id = %object.id, "对象已写入");
        self.objects.insert(object.id.clone(), Arc::new(object));
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.objects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuleError::ObjectNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn lookup(&self, id: &str) -> Result<Arc<GeoObject>> {
        self.objects
            .get(id)
            .map(|o| Arc::clone(o.value()))
            .ok_or_else(|| RuleError::ObjectNotFound(id.to_string()))
    }
}
