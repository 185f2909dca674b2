//! 设备空间索引
//!
//! 每个设备只落在一个网格单元中；位置更新通过 [`DeviceIndex::upsert`] 在同一把
//! ID 分片锁内完成“旧单元删除 + 新单元插入”，读者只会看到更新前或更新后的版本。

use super::CellBuckets;
use crate::error::{Result, RuleError};
use crate::geometry::{bbox_around, distance_meters};
use crate::grid::{self, CellId, DEVICE_LEVEL};
use crate::models::Device;
use crate::sharded::ShardedMap;
use rstar::{AABB, RTreeObject};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// R 树中的设备条目
#[derive(Debug, Clone)]
struct DevicePoint {
    device: Arc<Device>,
    point: [f64; 2],
}

impl DevicePoint {
    fn new(device: Arc<Device>) -> Self {
        let point = [device.longitude, device.latitude];
        Self { device, point }
    }
}

impl PartialEq for DevicePoint {
    fn eq(&self, other: &Self) -> bool {
        self.device.imei == other.device.imei && self.point == other.point
    }
}

impl RTreeObject for DevicePoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

/// 设备空间索引
pub struct DeviceIndex {
    devices: ShardedMap<String, Arc<Device>>,
    cells: CellBuckets<DevicePoint>,
    level: u8,
    circle_steps: usize,
}

impl DeviceIndex {
    pub fn new(circle_steps: usize) -> Self {
        Self {
            devices: ShardedMap::new(),
            cells: CellBuckets::new(),
            level: DEVICE_LEVEL,
            circle_steps,
        }
    }

    fn cell_of(&self, device: &Device) -> CellId {
        grid::cell(device.latitude, device.longitude, self.level)
    }

    /// 写入或替换设备快照
    #[instrument(skip(self, device), fields(imei = %device.imei))]
    pub fn upsert(&self, device: Device) -> Result<Arc<Device>> {
        validate(&device)?;
        let imei = device.imei.clone();
        let device = Arc::new(device);
        let cell = self.cell_of(&device);

        self.devices.update(imei.as_str(), |shard| {
            if let Some(old) = shard.insert(imei.clone(), Arc::clone(&device)) {
                self.cells.remove(self.cell_of(&old), &DevicePoint::new(old));
            }
            self.cells.insert(cell, DevicePoint::new(Arc::clone(&device)));
        });
        debug!(cell, "设备位置已更新");
        Ok(device)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, imei: &str) -> Result<Arc<Device>> {
        self.devices.update(imei, |shard| -> Result<Arc<Device>> {
            let old = shard
                .remove(imei)
                .ok_or_else(|| RuleError::DeviceNotFound(imei.to_string()))?;
            self.cells.remove(self.cell_of(&old), &DevicePoint::new(Arc::clone(&old)));
            Ok(old)
        })
    }

    pub fn lookup(&self, imei: &str) -> Result<Arc<Device>> {
        self.devices
            .get(imei)
            .ok_or_else(|| RuleError::DeviceNotFound(imei.to_string()))
    }

    /// 访问 (lat, lon) 周围 `meters` 米内的设备
    ///
    /// 在覆盖网格的每个单元之间检查取消；访问者返回错误时立即停止并返回该错误。
    pub fn nearby<F>(
        &self,
        cancel: &CancellationToken,
        lat: f64,
        lon: f64,
        meters: f64,
        mut visit: F,
    ) -> Result<()>
    where
        F: FnMut(&Device) -> Result<()>,
    {
        let rect = bbox_around(lat, lon, meters);
        let envelopes = super::wrapped_envelopes(&rect);
        for cell in grid::covering(lat, lon, meters, self.level, self.circle_steps) {
            if cancel.is_cancelled() {
                return Err(RuleError::Cancelled);
            }
            let candidates = self.cells.query(cell, &envelopes);
            for candidate in candidates {
                let d = &candidate.device;
                if distance_meters(lat, lon, d.latitude, d.longitude) <= meters {
                    visit(d)?;
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// 当前非空的网格单元数
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }
}

fn validate(device: &Device) -> Result<()> {
    if device.imei.is_empty() {
        return Err(RuleError::InvalidDevice("imei is empty".to_string()));
    }
    if !(-90.0..=90.0).contains(&device.latitude) || !(-180.0..=180.0).contains(&device.longitude)
    {
        return Err(RuleError::InvalidDevice(format!(
            "{}: coordinates out of range ({}, {})",
            device.imei, device.latitude, device.longitude
        )));
    }
    Ok(())
}
