//! 球面几何辅助函数

use crate::ast::Qualifier;
use geo::{Coord, Geometry, HaversineDestination, HaversineDistance, LineString, Point, Polygon, Rect};

/// 平均地球半径（米）
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// 距离上限：半个地球周长，超过此值的圆已覆盖整个球面
pub const MAX_DISTANCE_METERS: f64 = std::f64::consts::PI * EARTH_RADIUS_METERS;

/// 经度归一化到 [-180, 180)
pub fn normalize_lon(lon: f64) -> f64 {
    (lon + 180.0).rem_euclid(360.0) - 180.0
}

/// 两点间的大圆距离（米）
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

/// 从 (lat, lon) 沿方位角 `bearing` 前进 `meters` 后的位置，返回 (lat, lon)
pub fn destination(lat: f64, lon: f64, bearing: f64, meters: f64) -> (f64, f64) {
    let p = Point::new(lon, lat).haversine_destination(bearing, meters);
    (p.y().clamp(-90.0, 90.0), normalize_lon(p.x()))
}

/// 以 `steps` 个等方位角采样点近似的圆，首尾闭合
///
/// 顶点经度不做归一化，跨越 ±180° 的圆保持连续。
pub fn circle(lat: f64, lon: f64, meters: f64, steps: usize) -> Polygon<f64> {
    let center = Point::new(lon, lat);
    let steps = steps.max(3);
    let mut ring: Vec<Coord<f64>> = (0..steps)
        .map(|i| {
            let bearing = 360.0 * i as f64 / steps as f64;
            center.haversine_destination(bearing, meters).into()
        })
        .collect();
    ring.push(ring[0]);
    Polygon::new(LineString::from(ring), vec![])
}

/// 中心点周围边长为 2 × meters 的经纬度矩形
pub fn bbox_around(lat: f64, lon: f64, meters: f64) -> Rect<f64> {
    let dlat = (meters / EARTH_RADIUS_METERS).to_degrees();
    let cos = lat.to_radians().cos().abs().max(1e-6);
    let dlon = (dlat / cos).min(180.0);
    Rect::new(
        Coord {
            x: lon - dlon,
            y: (lat - dlat).max(-90.0),
        },
        Coord {
            x: lon + dlon,
            y: (lat + dlat).min(90.0),
        },
    )
}

/// 矩形是否包含点，考虑矩形越过 ±180° 的情况
pub fn rect_contains(rect: &Rect<f64>, lat: f64, lon: f64) -> bool {
    if lat < rect.min().y || lat > rect.max().y {
        return false;
    }
    [lon, lon + 360.0, lon - 360.0]
        .iter()
        .any(|x| *x >= rect.min().x && *x <= rect.max().x)
}

/// 设备在修饰符作用下的几何形状：点、圆或矩形
pub fn device_shape(
    lat: f64,
    lon: f64,
    qualifier: Option<Qualifier>,
    steps: usize,
) -> Geometry<f64> {
    match qualifier {
        None => Geometry::Point(Point::new(lon, lat)),
        Some(Qualifier::Radius(m)) => Geometry::Polygon(circle(lat, lon, m, steps)),
        Some(Qualifier::BBox(m)) => Geometry::Rect(bbox_around(lat, lon, m)),
    }
}
