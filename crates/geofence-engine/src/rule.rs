//! 规则：规格文本 + 编译结果 + 地理覆盖

use crate::ast::Trigger;
use crate::compiler::Program;
use crate::error::{Result, RuleError};
use crate::geometry::{MAX_DISTANCE_METERS, bbox_around};
use crate::grid::{self, CellId};
use crate::models::{RuleRecord, RuleSpec, Tier};
use geo::Rect;
use geofence_shared::config::EngineConfig;
use uuid::Uuid;

/// 已编译并计算好覆盖网格的规则
///
/// 发布到索引后不可变。
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub specification: String,
    pub latitude: f64,
    pub longitude: f64,
    /// 作用半径（米），不小于配置的最小半径
    pub radius: f64,
    pub bbox: Rect<f64>,
    pub cells: Vec<CellId>,
    pub tier: Tier,
    pub program: Program,
}

impl Rule {
    /// 解析、编译并计算覆盖网格，生成新的规则 ID
    pub fn new(spec: RuleSpec, config: &EngineConfig) -> Result<Self> {
        Self::build(Uuid::new_v4().to_string(), spec, config)
    }

    fn build(id: String, spec: RuleSpec, config: &EngineConfig) -> Result<Self> {
        validate(&spec)?;
        let program = Program::from_source(&spec.specification)?;

        let radius = spec
            .radius
            .max(config.min_radius_meters)
            .min(MAX_DISTANCE_METERS);
        let tier = if radius <= config.small_region_meters {
            Tier::Fine
        } else {
            Tier::Coarse
        };
        let cells = grid::covering(
            spec.latitude,
            spec.longitude,
            radius,
            tier.level(),
            config.circle_steps,
        );

        Ok(Self {
            id,
            name: spec.name,
            specification: spec.specification,
            latitude: spec.latitude,
            longitude: spec.longitude,
            radius,
            bbox: bbox_around(spec.latitude, spec.longitude, radius),
            cells,
            tier,
            program,
        })
    }

    pub fn trigger(&self) -> Option<Trigger> {
        self.program.trigger
    }

    /// 编码为传输/持久化格式
    pub fn to_record(&self) -> RuleRecord {
        RuleRecord {
            rule_id: self.id.clone(),
            name: self.name.clone(),
            region_size: self.tier.level(),
            specification: self.specification.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            radius: self.radius,
            region_ids: self.cells.iter().map(u64::to_string).collect(),
        }
    }

    /// 从编码恢复规则；规格文本重新编译，区域 ID 原样保留
    pub fn from_record(record: RuleRecord, config: &EngineConfig) -> Result<Self> {
        let tier = Tier::from_level(record.region_size).ok_or_else(|| {
            RuleError::InvalidRule(format!("unknown region size {}", record.region_size))
        })?;
        let cells = record
            .region_ids
            .iter()
            .map(|s| {
                s.parse::<CellId>()
                    .map_err(|_| RuleError::InvalidRule(format!("invalid region id {s:?}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let spec = RuleSpec {
            name: record.name,
            specification: record.specification,
            latitude: record.latitude,
            longitude: record.longitude,
            radius: record.radius,
        };
        let mut rule = Self::build(record.rule_id, spec, config)?;
        if !cells.is_empty() {
            if cells.iter().any(|c| grid::level(*c) != tier.level()) {
                return Err(RuleError::InvalidRule(
                    "region ids do not match region size".to_string(),
                ));
            }
            rule.tier = tier;
            rule.cells = cells;
        }
        Ok(rule)
    }
}

fn validate(spec: &RuleSpec) -> Result<()> {
    if spec.specification.trim().is_empty() {
        return Err(RuleError::InvalidRule("specification is empty".to_string()));
    }
    if !(-90.0..=90.0).contains(&spec.latitude) || !(-180.0..=180.0).contains(&spec.longitude) {
        return Err(RuleError::InvalidRule(format!(
            "center out of range ({}, {})",
            spec.latitude, spec.longitude
        )));
    }
    if !spec.radius.is_finite() || spec.radius < 0.0 {
        return Err(RuleError::InvalidRule(format!(
            "invalid radius {}",
            spec.radius
        )));
    }
    Ok(())
}
