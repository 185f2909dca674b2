//! 经纬度网格
//!
//! 第 L 级把纬度等分为 2^L 行、经度等分为 2^L 列，每个网格单元高 180/2^L 度、
//! 宽 360/2^L 度。单元 ID 编码为 `level << 58 | row << 29 | col`。

use crate::geometry::{EARTH_RADIUS_METERS, MAX_DISTANCE_METERS, destination, normalize_lon};
use std::collections::BTreeSet;

pub type CellId = u64;

/// 小半径规则的网格精度
pub const FINE_LEVEL: u8 = 9;
/// 设备所在的网格精度
pub const DEVICE_LEVEL: u8 = 7;
/// 大半径规则的网格精度
pub const COARSE_LEVEL: u8 = 5;

const MAX_LEVEL: u8 = 28;
const ROW_SHIFT: u32 = 29;
const LEVEL_SHIFT: u32 = 58;
const AXIS_MASK: u64 = (1 << ROW_SHIFT) - 1;

/// 单次覆盖计算的采样点上限
pub const MAX_SAMPLES: usize = 1 << 16;

/// 每度纬度对应的米数
fn meters_per_degree() -> f64 {
    EARTH_RADIUS_METERS.to_radians()
}

fn lat_step(level: u8) -> f64 {
    180.0 / f64::from(1u32 << level)
}

fn lon_step(level: u8) -> f64 {
    360.0 / f64::from(1u32 << level)
}

/// 点所在的网格单元
pub fn cell(lat: f64, lon: f64, level: u8) -> CellId {
    let level = level.min(MAX_LEVEL);
    encode(level, row_of(lat, level), col_of(lon, level))
}

fn encode(level: u8, row: u64, col: u64) -> CellId {
    (u64::from(level) << LEVEL_SHIFT) | (row << ROW_SHIFT) | col
}

fn row_of(lat: f64, level: u8) -> u64 {
    let n = 1u64 << level;
    (((lat.clamp(-90.0, 90.0) + 90.0) / lat_step(level)) as u64).min(n - 1)
}

fn col_of(lon: f64, level: u8) -> u64 {
    let n = 1u64 << level;
    (((normalize_lon(lon) + 180.0) / lon_step(level)) as u64).min(n - 1)
}

/// 单元的精度
pub fn level(id: CellId) -> u8 {
    (id >> LEVEL_SHIFT) as u8
}

/// 单元的中心点 (lat, lon)
pub fn center(id: CellId) -> (f64, f64) {
    let level = level(id);
    let row = (id >> ROW_SHIFT) & AXIS_MASK;
    let col = id & AXIS_MASK;
    (
        -90.0 + (row as f64 + 0.5) * lat_step(level),
        -180.0 + (col as f64 + 0.5) * lon_step(level),
    )
}

/// 覆盖以 (lat, lon) 为圆心、半径 `meters` 的圆的网格单元集合
///
/// 采样圆心、圆周以及所有过圆心的直径上的点，采样间距约为半个单元，
/// 结果按单元 ID 排序且非空。采样点数超过 [`MAX_SAMPLES`] 时改为返回包围盒内的全部单元。
pub fn covering(lat: f64, lon: f64, meters: f64, level: u8, steps: usize) -> Vec<CellId> {
    let level = level.min(MAX_LEVEL);
    let meters = meters.clamp(0.0, MAX_DISTANCE_METERS);
    let spacing = sample_spacing(lat, meters, level);
    let boundary_f = (2.0 * std::f64::consts::PI * meters / spacing).ceil();
    let chord_f = (2.0 * meters / spacing).ceil();
    if !(boundary_f * chord_f / 2.0 <= MAX_SAMPLES as f64) {
        return bbox_cells(lat, lon, meters, level);
    }

    let mut cells = BTreeSet::new();
    cells.insert(cell(lat, lon, level));

    let n = (boundary_f as usize).max(steps).max(4).min(MAX_SAMPLES);
    // 直径成对采样需要偶数个圆周点
    let n = n + n % 2;

    let boundary: Vec<(f64, f64)> = (0..n)
        .map(|i| destination(lat, lon, 360.0 * i as f64 / n as f64, meters))
        .collect();
    for &(blat, blon) in &boundary {
        cells.insert(cell(blat, blon, level));
    }

    let chord_samples = (chord_f as usize).max(1);
    for i in 0..n / 2 {
        let bearing = 360.0 * i as f64 / n as f64;
        for k in 1..chord_samples {
            // 沿直径从一端走到另一端
            let along = -meters + 2.0 * meters * k as f64 / chord_samples as f64;
            let (slat, slon) = if along >= 0.0 {
                destination(lat, lon, bearing, along)
            } else {
                destination(lat, lon, bearing + 180.0, -along)
            };
            cells.insert(cell(slat, slon, level));
        }
    }

    cells.into_iter().collect()
}

/// 圆的经纬度包围盒覆盖到的全部单元；包含极点或经度跨度过大时取整行
fn bbox_cells(lat: f64, lon: f64, meters: f64, level: u8) -> Vec<CellId> {
    let n = 1u64 << level;
    let dlat = meters / meters_per_degree();
    let (south, north) = ((lat - dlat).max(-90.0), (lat + dlat).min(90.0));
    let widest = south.abs().max(north.abs());

    let (first_col, cols) = if widest >= 89.0 {
        (0, n)
    } else {
        let dlon = dlat / widest.to_radians().cos();
        if 2.0 * dlon + lon_step(level) >= 360.0 {
            (0, n)
        } else {
            let lo = col_of(lon - dlon, level);
            let hi = col_of(lon + dlon, level);
            (lo, (hi + n - lo) % n + 1)
        }
    };

    let mut cells = Vec::new();
    for row in row_of(south, level)..=row_of(north, level) {
        for k in 0..cols {
            cells.push(encode(level, row, (first_col + k) % n));
        }
    }
    cells.sort_unstable();
    cells
}

/// 采样间距：取该纬度范围内单元最窄边的一半，并限定下界
fn sample_spacing(lat: f64, meters: f64, level: u8) -> f64 {
    let lat_m = lat_step(level) * meters_per_degree();
    let max_lat = (lat.abs() + meters / meters_per_degree()).min(89.0);
    let lon_m = lon_step(level) * meters_per_degree() * max_lat.to_radians().cos();
    (lat_m.min(lon_m) / 2.0).max(lat_m / 16.0)
}
